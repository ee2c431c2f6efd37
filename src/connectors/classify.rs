//! Classification of backend failures.
//!
//! Backends report failures as driver-specific errors; everything above the connector layer only
//! sees a [`FailureKind`]. Drivers rarely expose structured error codes for connection problems,
//! so [`classify_message`] falls back to message patterns.

use std::fmt;

use serde::Serialize;

/// Classified outcome of a failed backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ConnectionRefused,
    AuthenticationFailed,
    ConnectionTimeout,
    SslRequired,
    UnknownHost,
    InvalidDatabase,
    /// Reset connections, broken pipes and other protocol hiccups.
    ConnectionFailed,
    /// Syntax errors, invalid identifiers and other problems with the statement itself.
    MalformedQuery,
    UnknownTable,
    /// Any other failure the backend reported. Not retried.
    Backend,
    /// The backend family is not compiled in, or the operation is not supported by it.
    Unsupported,
}

impl FailureKind {
    /// Kinds reported by a connection test.
    pub const CONNECTION_CODES: [FailureKind; 7] = [
        FailureKind::ConnectionRefused,
        FailureKind::AuthenticationFailed,
        FailureKind::ConnectionTimeout,
        FailureKind::SslRequired,
        FailureKind::UnknownHost,
        FailureKind::InvalidDatabase,
        FailureKind::ConnectionFailed,
    ];

    pub fn code(self) -> &'static str {
        match self {
            FailureKind::ConnectionRefused => "connection_refused",
            FailureKind::AuthenticationFailed => "authentication_failed",
            FailureKind::ConnectionTimeout => "connection_timeout",
            FailureKind::SslRequired => "ssl_required",
            FailureKind::UnknownHost => "unknown_host",
            FailureKind::InvalidDatabase => "invalid_database",
            FailureKind::ConnectionFailed => "connection_failed",
            FailureKind::MalformedQuery => "malformed_query",
            FailureKind::UnknownTable => "unknown_table",
            FailureKind::Backend => "backend_error",
            FailureKind::Unsupported => "unsupported",
        }
    }

    /// Whether a retry may succeed.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FailureKind::ConnectionRefused | FailureKind::ConnectionTimeout | FailureKind::ConnectionFailed
        )
    }

    /// Code reported by a connection test. Statement-level kinds collapse to `connection_failed`.
    pub fn connection_code(self) -> &'static str {
        if Self::CONNECTION_CODES.contains(&self) {
            self.code()
        } else {
            FailureKind::ConnectionFailed.code()
        }
    }

    /// Human message for a connection test.
    pub fn summary(self) -> &'static str {
        match self {
            FailureKind::ConnectionRefused => {
                "Couldn't reach the database server. Check that the server is running and the host/port are correct."
            }
            FailureKind::AuthenticationFailed => {
                "The username or password wasn't accepted. Double-check your credentials and try again."
            }
            FailureKind::ConnectionTimeout => {
                "The server took too long to respond. It might be busy or unreachable."
            }
            FailureKind::SslRequired => "The server requires an encrypted (SSL/TLS) connection.",
            FailureKind::UnknownHost => "The database host name could not be resolved.",
            FailureKind::InvalidDatabase => "The database does not exist or the user cannot access it.",
            FailureKind::ConnectionFailed => "The connection to the database failed.",
            FailureKind::MalformedQuery => "The query could not be executed as written.",
            FailureKind::UnknownTable => "The requested table does not exist.",
            FailureKind::Backend => "The database rejected the request.",
            FailureKind::Unsupported => "This connector is not available in this build.",
        }
    }

    /// Remediation hints.
    pub fn suggestions(self) -> &'static [&'static str] {
        match self {
            FailureKind::ConnectionRefused => &[
                "Verify the hostname and port are correct",
                "Check your database server is running",
                "Ensure your firewall allows incoming connections from this service",
            ],
            FailureKind::AuthenticationFailed => &[
                "Verify your username and password are correct",
                "Check if the database user exists",
                "Ensure the user has the necessary permissions",
            ],
            FailureKind::ConnectionTimeout => &[
                "Check your server is responding",
                "Verify your firewall settings",
                "Try again when the server is less busy",
            ],
            FailureKind::SslRequired => &[
                "Set ssl_mode to 'require'",
                "Check the server's TLS certificate configuration",
            ],
            FailureKind::UnknownHost => &[
                "Check the hostname for typos",
                "Verify the host is reachable from this network",
            ],
            FailureKind::InvalidDatabase => &[
                "Check the database name",
                "Ensure the user has access to this database",
            ],
            FailureKind::ConnectionFailed => &[
                "Verify your connection parameters",
                "Retry the request; the failure may be temporary",
            ],
            FailureKind::MalformedQuery => &["Check the query syntax for this database"],
            FailureKind::UnknownTable => &["Check the table name and schema prefix"],
            FailureKind::Backend => &["Check the database logs for the full error"],
            FailureKind::Unsupported => &["Use a build that enables this connector"],
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Classify a driver error message.
///
/// Permanent conditions are checked first so that e.g. "password authentication failed ...
/// connection closed" is not retried. Messages matching no known pattern are [`FailureKind::Backend`].
/// Statement problems are checked before missing tables: Postgres reports missing columns and
/// functions with the same "does not exist" wording.
pub fn classify_message(message: &str) -> FailureKind {
    let m = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| m.contains(n));

    if has(&["password authentication", "authentication failed", "access denied", "login failed", "unauthorized"]) {
        FailureKind::AuthenticationFailed
    } else if has(&["ssl", "tls", "encryption"]) && has(&["required", "require", "must", "no pg_hba.conf"]) {
        FailureKind::SslRequired
    } else if has(&[
        "failed to lookup address",
        "name or service not known",
        "nodename nor servname",
        "no such host",
        "could not translate host name",
        "unknown host",
    ]) {
        FailureKind::UnknownHost
    } else if has(&["unknown database", "database \"", "cannot open database"]) && has(&["not exist", "unknown", "cannot open"]) {
        FailureKind::InvalidDatabase
    } else if has(&["syntax error", "near \"", "parse error", "incorrect syntax"])
        || has(&["no such column", "unknown column", "invalid column name", "undefined column", "ambiguous column"])
        || has(&["no such function", "undefined function", "is not a recognized built-in function"])
        || (has(&["column ", "function "]) && has(&["does not exist"]))
        || has(&["wrong number of arguments", "misuse of aggregate"])
    {
        FailureKind::MalformedQuery
    } else if has(&["no such table", "doesn't exist", "does not exist", "invalid object name"]) {
        FailureKind::UnknownTable
    } else if has(&["connection refused"]) {
        FailureKind::ConnectionRefused
    } else if has(&["timeout", "timed out"]) {
        FailureKind::ConnectionTimeout
    } else if has(&[
        "connection reset",
        "connection closed",
        "connection aborted",
        "broken pipe",
        "unexpected eof",
        "server has gone away",
        "lost connection",
        "database is locked",
    ]) {
        FailureKind::ConnectionFailed
    } else {
        FailureKind::Backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_driver_messages() {
        let cases = [
            ("FATAL: password authentication failed for user \"bob\"", FailureKind::AuthenticationFailed),
            ("Access denied for user 'x'@'y' (using password: YES)", FailureKind::AuthenticationFailed),
            ("error connecting to server: Connection refused (os error 111)", FailureKind::ConnectionRefused),
            ("failed to lookup address information: Name or service not known", FailureKind::UnknownHost),
            ("FATAL: database \"nope\" does not exist", FailureKind::InvalidDatabase),
            ("Unknown database 'nope'", FailureKind::InvalidDatabase),
            ("no such table: orders", FailureKind::UnknownTable),
            ("near \"SELEC\": syntax error", FailureKind::MalformedQuery),
            ("operation timed out", FailureKind::ConnectionTimeout),
            ("SSL connection is required", FailureKind::SslRequired),
            ("connection reset by peer", FailureKind::ConnectionFailed),
            ("no such column: nope", FailureKind::MalformedQuery),
            ("Unknown column 'x' in 'field list'", FailureKind::MalformedQuery),
            ("no such function: nope", FailureKind::MalformedQuery),
            ("ERROR: column \"nope\" does not exist", FailureKind::MalformedQuery),
            ("ERROR: function nope(integer) does not exist", FailureKind::MalformedQuery),
            ("Invalid column name 'nope'.", FailureKind::MalformedQuery),
            ("ERROR: relation \"orders\" does not exist", FailureKind::UnknownTable),
            ("division by zero", FailureKind::Backend),
        ];
        for (msg, kind) in cases {
            assert_eq!(classify_message(msg), kind, "{msg}");
        }
    }

    #[test]
    fn only_connection_level_hiccups_are_transient() {
        assert!(FailureKind::ConnectionRefused.is_transient());
        assert!(FailureKind::ConnectionTimeout.is_transient());
        assert!(!FailureKind::AuthenticationFailed.is_transient());
        assert!(!FailureKind::MalformedQuery.is_transient());
        assert!(!FailureKind::UnknownHost.is_transient());
        assert!(!FailureKind::Backend.is_transient());
        assert!(!classify_message("something nobody anticipated").is_transient());
    }

    #[test]
    fn connection_test_codes_come_from_the_fixed_set() {
        assert_eq!(FailureKind::UnknownTable.connection_code(), "connection_failed");
        assert_eq!(FailureKind::SslRequired.connection_code(), "ssl_required");
        assert!(!FailureKind::InvalidDatabase.suggestions().is_empty());
    }
}
