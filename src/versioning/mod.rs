//! Source and version records, the metadata store contract, and the version state machine.
//!
//! Every conversion attempt is a [`SourceVersion`] that starts `pending` before any I/O and ends
//! `active` (with metrics) or `error` (with a message). [`VersionTracker::begin`] allocates the
//! pending record; the returned [`PendingVersion`] can only be consumed by
//! [`PendingVersion::activate`] or [`PendingVersion::fail`], so a finished record cannot be
//! touched again through it.
//!
//! Activation updates the version record first and the source's `current_version` second. A
//! reader can therefore never see `current_version` point at a version that is not `active`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Database,
    Api,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::File => "file",
            SourceKind::Database => "database",
            SourceKind::Api => "api",
        }
    }
}

impl FromStr for SourceKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(SourceKind::File),
            "database" => Ok(SourceKind::Database),
            "api" => Ok(SourceKind::Api),
            other => Err(StoreError::Backend(format!("unknown source kind '{other}'"))),
        }
    }
}

/// A registered, versioned origin of data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub organization_id: String,
    pub kind: SourceKind,
    /// File format or connector type.
    pub source_type: String,
    /// Last `active` version; 0 before the first successful conversion.
    pub current_version: u32,
    pub extraction_query: Option<String>,
}

impl Source {
    pub fn new(id: impl Into<String>, organization_id: impl Into<String>, kind: SourceKind, source_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            organization_id: organization_id.into(),
            kind,
            source_type: source_type.into(),
            current_version: 0,
            extraction_query: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Pending,
    Active,
    Error,
}

impl VersionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VersionStatus::Pending => "pending",
            VersionStatus::Active => "active",
            VersionStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != VersionStatus::Pending
    }

    /// Pending may move to either terminal state; nothing else moves.
    pub fn can_become(self, next: VersionStatus) -> bool {
        self == VersionStatus::Pending && next.is_terminal()
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VersionStatus::Pending),
            "active" => Ok(VersionStatus::Active),
            "error" => Ok(VersionStatus::Error),
            other => Err(StoreError::Backend(format!("unknown version status '{other}'"))),
        }
    }
}

/// Figures recorded on an `active` version.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VersionMetrics {
    pub row_count: u64,
    pub column_count: u64,
    pub byte_size: u64,
    pub elapsed_secs: f64,
}

/// One conversion attempt against a [`Source`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceVersion {
    pub id: Uuid,
    pub source_id: String,
    pub version: u32,
    pub status: VersionStatus,
    pub metrics: Option<VersionMetrics>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SourceVersion {
    fn pending(source_id: &str, version: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id: source_id.to_string(),
            version,
            status: VersionStatus::Pending,
            metrics: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

/// Terminal update applied to a pending version.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionUpdate {
    pub status: VersionStatus,
    pub metrics: Option<VersionMetrics>,
    pub error_message: Option<String>,
}

impl VersionUpdate {
    pub fn active(metrics: VersionMetrics) -> Self {
        Self {
            status: VersionStatus::Active,
            metrics: Some(metrics),
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: VersionStatus::Error,
            metrics: None,
            error_message: Some(message.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("source not found: {0}")]
    SourceNotFound(String),

    #[error("source version not found: {0}")]
    VersionNotFound(Uuid),

    #[error("source {source_id} already has a pending conversion (v{version})")]
    PendingExists { source_id: String, version: u32 },

    #[error("version {id} cannot move from {from} to {to}")]
    IllegalTransition {
        id: Uuid,
        from: VersionStatus,
        to: VersionStatus,
    },

    /// `current_version` may only advance, and only to an `active` version.
    #[error("source {source_id} cannot point current_version at v{version}: {reason}")]
    InvalidCurrentVersion {
        source_id: String,
        version: u32,
        reason: &'static str,
    },

    #[error("metadata store error: {0}")]
    Backend(String),
}

/// Narrow read/write contract over the external metadata store. Each call is atomic on its own.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_source(&self, source_id: &str) -> Result<Source, StoreError>;

    /// Insert a `pending` record. Fails with [`StoreError::PendingExists`] when the source
    /// already has one.
    async fn insert_version(&self, version: &SourceVersion) -> Result<(), StoreError>;

    /// Apply a terminal update. Terminal records are immutable.
    async fn update_version(&self, version_id: Uuid, update: &VersionUpdate) -> Result<(), StoreError>;

    async fn update_current_version(&self, source_id: &str, version: u32) -> Result<(), StoreError>;

    async fn update_extraction_query(&self, source_id: &str, query: &str) -> Result<(), StoreError>;

    /// All versions of a source, oldest first.
    async fn list_versions(&self, source_id: &str) -> Result<Vec<SourceVersion>, StoreError>;
}

/// Allocates and finalizes versions through a [`MetadataStore`].
#[derive(Clone)]
pub struct VersionTracker {
    store: Arc<dyn MetadataStore>,
}

impl fmt::Debug for VersionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionTracker").finish_non_exhaustive()
    }
}

impl VersionTracker {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Persist a `pending` record numbered `current_version + 1`.
    pub async fn begin(&self, source: &Source) -> Result<PendingVersion, StoreError> {
        let record = SourceVersion::pending(&source.id, source.current_version + 1);
        self.store.insert_version(&record).await?;
        info!(source_id = %source.id, version = record.version, version_id = %record.id, "version pending");
        Ok(PendingVersion {
            store: Arc::clone(&self.store),
            record,
        })
    }

    /// Mark `pending` records older than `max_age` as `error`.
    ///
    /// A process that died mid-conversion leaves its record pending, which would block the
    /// source forever.
    pub async fn recover_stale(&self, source_id: &str, max_age: Duration) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let mut recovered = Vec::new();
        for v in self.store.list_versions(source_id).await? {
            if v.status == VersionStatus::Pending && v.created_at < cutoff {
                self.store
                    .update_version(v.id, &VersionUpdate::error("conversion abandoned before completion"))
                    .await?;
                warn!(source_id, version = v.version, version_id = %v.id, "stale pending version marked as error");
                recovered.push(v.id);
            }
        }
        Ok(recovered)
    }
}

/// A `pending` version awaiting its terminal transition.
#[must_use = "a pending version must be activated or failed"]
pub struct PendingVersion {
    store: Arc<dyn MetadataStore>,
    record: SourceVersion,
}

impl fmt::Debug for PendingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingVersion").field("record", &self.record).finish_non_exhaustive()
    }
}

impl PendingVersion {
    pub fn number(&self) -> u32 {
        self.record.version
    }

    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn source_id(&self) -> &str {
        &self.record.source_id
    }

    /// Record metrics, then advance the source's `current_version`.
    pub async fn activate(self, metrics: VersionMetrics) -> Result<SourceVersion, StoreError> {
        let update = VersionUpdate::active(metrics);
        self.store.update_version(self.record.id, &update).await?;
        self.store
            .update_current_version(&self.record.source_id, self.record.version)
            .await?;
        info!(
            source_id = %self.record.source_id,
            version = self.record.version,
            rows = metrics.row_count,
            "version active"
        );
        Ok(self.finish(update))
    }

    /// Record the failure. `current_version` is left alone.
    pub async fn fail(self, message: impl Into<String>) -> Result<SourceVersion, StoreError> {
        let update = VersionUpdate::error(message);
        self.store.update_version(self.record.id, &update).await?;
        warn!(
            source_id = %self.record.source_id,
            version = self.record.version,
            error = update.error_message.as_deref().unwrap_or_default(),
            "version failed"
        );
        Ok(self.finish(update))
    }

    fn finish(self, update: VersionUpdate) -> SourceVersion {
        SourceVersion {
            status: update.status,
            metrics: update.metrics,
            error_message: update.error_message,
            ..self.record
        }
    }
}
