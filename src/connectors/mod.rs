//! Database connectors.
//!
//! Every backend family sits behind [`DatabaseConnector`]: `attach` opens a blocking [`Session`],
//! and the session runs statements into a [`crate::types::DataSet`]. Protocol-compatible backends
//! (Redshift over PostgreSQL, MariaDB over MySQL) are the same connector parameterized by
//! [`ConnectorType`], not separate implementations.
//!
//! [`extract::extract`] layers retries, the identifier allow-list, row limits and partitioned
//! extraction (see [`partition`]) on top of any connector.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::Retryable;
use crate::types::DataSet;

pub mod classify;
#[cfg(feature = "db_connectorx")]
pub mod connectorx;
pub mod credentials;
pub mod extract;
pub mod partition;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use classify::{FailureKind, classify_message};
pub use credentials::{CredentialCache, CredentialError, CredentialResolver, JsonFileResolver, StaticResolver};
pub use extract::{
    ConnectionTestOutcome, ExtractRequest, ExtractSettings, Extraction, QuerySource, extract, test_connection,
};
pub use partition::{PartitionBounds, PartitionPlan, PartitionSpec};

/// Supported backend types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorType {
    Postgresql,
    Redshift,
    Mysql,
    Mariadb,
    Mssql,
    Sqlite,
}

/// Protocol family a [`ConnectorType`] speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Postgres,
    MySql,
    Mssql,
    Sqlite,
}

/// Credential fields a connector type needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CredentialRequirements {
    pub host: bool,
    pub database: bool,
    pub username: bool,
    /// A database file path (SQLite); `database` is accepted in its place.
    pub file_path: bool,
}

impl ConnectorType {
    pub const ALL: [ConnectorType; 6] = [
        ConnectorType::Postgresql,
        ConnectorType::Redshift,
        ConnectorType::Mysql,
        ConnectorType::Mariadb,
        ConnectorType::Mssql,
        ConnectorType::Sqlite,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectorType::Postgresql => "postgresql",
            ConnectorType::Redshift => "redshift",
            ConnectorType::Mysql => "mysql",
            ConnectorType::Mariadb => "mariadb",
            ConnectorType::Mssql => "mssql",
            ConnectorType::Sqlite => "sqlite",
        }
    }

    pub fn family(self) -> Family {
        match self {
            ConnectorType::Postgresql | ConnectorType::Redshift => Family::Postgres,
            ConnectorType::Mysql | ConnectorType::Mariadb => Family::MySql,
            ConnectorType::Mssql => Family::Mssql,
            ConnectorType::Sqlite => Family::Sqlite,
        }
    }

    pub fn default_port(self) -> Option<u16> {
        match self {
            ConnectorType::Postgresql => Some(5432),
            ConnectorType::Redshift => Some(5439),
            ConnectorType::Mysql | ConnectorType::Mariadb => Some(3306),
            ConnectorType::Mssql => Some(1433),
            ConnectorType::Sqlite => None,
        }
    }

    pub fn default_ssl_mode(self) -> Option<&'static str> {
        match self {
            ConnectorType::Postgresql => Some("prefer"),
            ConnectorType::Redshift => Some("require"),
            ConnectorType::Mysql | ConnectorType::Mariadb => Some("preferred"),
            ConnectorType::Mssql => Some("disable"),
            ConnectorType::Sqlite => None,
        }
    }

    pub fn requirements(self) -> CredentialRequirements {
        match self.family() {
            Family::Sqlite => CredentialRequirements {
                host: false,
                database: false,
                username: false,
                file_path: true,
            },
            _ => CredentialRequirements {
                host: true,
                database: true,
                username: true,
                file_path: false,
            },
        }
    }

    /// Whether extraction can be split into key ranges.
    pub fn supports_partitioning(self) -> bool {
        self.family() != Family::Sqlite
    }

    pub fn dialect(self) -> Dialect {
        match self.family() {
            Family::Mssql => Dialect::Mssql,
            _ => Dialect::Standard,
        }
    }
}

impl fmt::Display for ConnectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectorType {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        match key.as_str() {
            "postgres" => Ok(ConnectorType::Postgresql),
            "sqlserver" => Ok(ConnectorType::Mssql),
            _ => ConnectorType::ALL
                .into_iter()
                .find(|t| t.as_str() == key)
                .ok_or_else(|| {
                    ConnectorError::new(
                        FailureKind::Unsupported,
                        format!(
                            "unknown connector type '{s}'; available: {}",
                            ConnectorType::ALL.map(ConnectorType::as_str).join(", ")
                        ),
                    )
                }),
        }
    }
}

/// SQL dialect details the extraction layer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `... LIMIT n`
    Standard,
    /// `SELECT TOP (n) ...`
    Mssql,
}

static HAS_LIMIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\blimit\s+\d+|\btop\s*\(?\s*\d+").expect("valid regex"));

impl Dialect {
    /// Wrap `sql` so it returns at most `limit` rows. Statements that already limit are unchanged.
    pub fn apply_limit(self, sql: &str, limit: usize) -> String {
        let sql = sql.trim().trim_end_matches(';');
        if HAS_LIMIT.is_match(sql) {
            return sql.to_string();
        }
        match self {
            Dialect::Standard => format!("SELECT * FROM ({sql}) AS _limited LIMIT {limit}"),
            Dialect::Mssql => format!("SELECT TOP ({limit}) * FROM ({sql}) AS _limited"),
        }
    }
}

static SAFE_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.]+$").expect("valid regex"));

/// Reject table/column names that could carry SQL. Allowed: ASCII alphanumerics, `_` and `.`.
pub fn validate_identifier(name: &str) -> Result<(), ConnectorError> {
    if SAFE_IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(ConnectorError::new(
            FailureKind::MalformedQuery,
            format!("invalid identifier '{name}': only alphanumeric characters, underscores, and dots are allowed"),
        ))
    }
}

/// Connection parameters, resolved per call and never persisted.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectorCredentials {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Database name (or SQLite file path).
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: Option<String>,
    /// SQLite file path.
    pub file_path: Option<String>,
}

impl fmt::Debug for ConnectorCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("ssl_mode", &self.ssl_mode)
            .field("file_path", &self.file_path)
            .finish()
    }
}

impl ConnectorCredentials {
    /// Check the fields `connector` declares as required.
    pub fn validate_for(&self, connector: ConnectorType) -> Result<(), ConnectorError> {
        let req = connector.requirements();
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        let mut missing = Vec::new();
        if req.host && !present(&self.host) {
            missing.push("host");
        }
        if req.database && !present(&self.database) {
            missing.push("database");
        }
        if req.username && !present(&self.username) {
            missing.push("username");
        }
        if req.file_path && !present(&self.file_path) && !present(&self.database) {
            missing.push("file_path");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConnectorError::new(
                FailureKind::Unsupported,
                format!("{connector} credentials are missing: {}", missing.join(", ")),
            ))
        }
    }

    pub fn port_or_default(&self, connector: ConnectorType) -> Option<u16> {
        self.port.or(connector.default_port())
    }

    pub fn ssl_mode_or_default(&self, connector: ConnectorType) -> Option<&str> {
        self.ssl_mode.as_deref().or(connector.default_ssl_mode())
    }

    /// SQLite database path: `file_path`, else `database`.
    pub fn sqlite_path(&self) -> Option<&str> {
        self.file_path.as_deref().or(self.database.as_deref())
    }
}

/// A classified backend failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ConnectorError {
    pub kind: FailureKind,
    pub message: String,
}

impl ConnectorError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify a driver error by its message.
    pub fn from_driver(err: impl fmt::Display) -> Self {
        let message = err.to_string();
        Self::new(classify_message(&message), message)
    }
}

impl Retryable for ConnectorError {
    fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    fn timed_out(label: &str, after: std::time::Duration) -> Self {
        ConnectorError::new(
            FailureKind::ConnectionTimeout,
            format!("{label} timed out after {}s", after.as_secs_f64()),
        )
    }
}

/// An open, blocking connection to one backend.
///
/// Sessions are used from a single blocking task at a time.
pub trait Session: Send {
    /// Run `sql` and collect the full result.
    fn query(&mut self, sql: &str) -> Result<DataSet, ConnectorError>;

    /// Backend version string, when the backend exposes one.
    fn server_version(&mut self) -> Result<Option<String>, ConnectorError> {
        Ok(None)
    }

    /// Number of user tables, when cheap to compute.
    fn table_count(&mut self) -> Result<Option<u64>, ConnectorError> {
        Ok(None)
    }
}

/// One backend family.
pub trait DatabaseConnector: Send + Sync {
    fn connector_type(&self) -> ConnectorType;

    /// Open a session. Blocking; callers run it off the async runtime.
    fn attach(&self, credentials: &ConnectorCredentials) -> Result<Box<dyn Session>, ConnectorError>;

    fn supports_partitioning(&self) -> bool {
        self.connector_type().supports_partitioning()
    }

    fn dialect(&self) -> Dialect {
        self.connector_type().dialect()
    }
}

/// Stand-in for backend families that are not compiled into this build.
#[derive(Debug, Clone, Copy)]
pub struct UnavailableConnector {
    pub connector_type: ConnectorType,
    pub feature: &'static str,
}

impl DatabaseConnector for UnavailableConnector {
    fn connector_type(&self) -> ConnectorType {
        self.connector_type
    }

    fn attach(&self, _credentials: &ConnectorCredentials) -> Result<Box<dyn Session>, ConnectorError> {
        Err(ConnectorError::new(
            FailureKind::Unsupported,
            format!(
                "{} connector not enabled (enable cargo feature '{}')",
                self.connector_type, self.feature
            ),
        ))
    }
}

/// Connector lookup by type.
#[derive(Clone)]
pub struct ConnectorRegistry {
    connectors: HashMap<ConnectorType, Arc<dyn DatabaseConnector>>,
}

impl fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.connectors.keys().map(|t| t.as_str()).collect();
        types.sort_unstable();
        f.debug_struct("ConnectorRegistry").field("types", &types).finish()
    }
}

impl ConnectorRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            connectors: HashMap::new(),
        }
    }

    /// Every built-in connector this build carries; the rest answer `unsupported`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        for ty in ConnectorType::ALL {
            registry.register(builtin(ty));
        }
        registry
    }

    /// Add or replace the connector for its type.
    pub fn register(&mut self, connector: Arc<dyn DatabaseConnector>) -> &mut Self {
        self.connectors.insert(connector.connector_type(), connector);
        self
    }

    pub fn get(&self, ty: ConnectorType) -> Result<Arc<dyn DatabaseConnector>, ConnectorError> {
        self.connectors.get(&ty).cloned().ok_or_else(|| {
            ConnectorError::new(FailureKind::Unsupported, format!("no connector registered for {ty}"))
        })
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn builtin(ty: ConnectorType) -> Arc<dyn DatabaseConnector> {
    match ty.family() {
        #[cfg(feature = "sqlite")]
        Family::Sqlite => Arc::new(sqlite::SqliteConnector),
        #[cfg(not(feature = "sqlite"))]
        Family::Sqlite => Arc::new(UnavailableConnector {
            connector_type: ty,
            feature: "sqlite",
        }),
        #[cfg(feature = "db_connectorx")]
        _ => Arc::new(connectorx::CxConnector::new(ty)),
        #[cfg(not(feature = "db_connectorx"))]
        _ => Arc::new(UnavailableConnector {
            connector_type: ty,
            feature: "db_connectorx",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_allow_list() {
        for ok in ["orders", "public.orders", "Sales_2024", "a.b.c", "_x"] {
            assert!(validate_identifier(ok).is_ok(), "{ok}");
        }
        for bad in [
            "orders;drop table x",
            "orders ",
            "my table",
            "o'rders",
            "\"orders\"",
            "",
            "orders--",
            "tab\tle",
            "résumé",
        ] {
            let err = validate_identifier(bad).unwrap_err();
            assert_eq!(err.kind, FailureKind::MalformedQuery, "{bad}");
        }
    }

    #[test]
    fn aliases_parameterize_their_base_family() {
        assert_eq!(ConnectorType::Redshift.family(), Family::Postgres);
        assert_eq!(ConnectorType::Redshift.default_port(), Some(5439));
        assert_eq!(ConnectorType::Redshift.default_ssl_mode(), Some("require"));
        assert_eq!(ConnectorType::Mariadb.family(), Family::MySql);
        assert_eq!("postgres".parse::<ConnectorType>().unwrap(), ConnectorType::Postgresql);
        assert!("oracle".parse::<ConnectorType>().is_err());
    }

    #[test]
    fn requiredness_is_declared_per_connector() {
        let sqlite = ConnectorCredentials {
            file_path: Some("/tmp/x.db".into()),
            ..Default::default()
        };
        assert!(sqlite.validate_for(ConnectorType::Sqlite).is_ok());
        let err = sqlite.validate_for(ConnectorType::Postgresql).unwrap_err();
        assert!(err.message.contains("host, database, username"));

        let pg = ConnectorCredentials {
            host: Some("db".into()),
            database: Some("app".into()),
            username: Some("u".into()),
            ..Default::default()
        };
        // an empty password is allowed
        assert!(pg.validate_for(ConnectorType::Mysql).is_ok());
        assert_eq!(pg.port_or_default(ConnectorType::Mssql), Some(1433));
    }

    #[test]
    fn limits_follow_the_dialect() {
        assert_eq!(
            Dialect::Standard.apply_limit("SELECT * FROM t;", 10),
            "SELECT * FROM (SELECT * FROM t) AS _limited LIMIT 10"
        );
        assert_eq!(
            Dialect::Mssql.apply_limit("SELECT * FROM t", 5),
            "SELECT TOP (5) * FROM (SELECT * FROM t) AS _limited"
        );
        assert_eq!(Dialect::Standard.apply_limit("select a from t limit 3", 10), "select a from t limit 3");
    }

    #[test]
    fn password_is_redacted_in_debug() {
        let c = ConnectorCredentials {
            password: Some("hunter2".into()),
            ..Default::default()
        };
        assert!(!format!("{c:?}").contains("hunter2"));
    }

    #[test]
    fn missing_features_answer_unsupported() {
        let c = UnavailableConnector {
            connector_type: ConnectorType::Mssql,
            feature: "db_connectorx",
        };
        let err = c.attach(&ConnectorCredentials::default()).err().unwrap();
        assert_eq!(err.kind, FailureKind::Unsupported);
    }
}
