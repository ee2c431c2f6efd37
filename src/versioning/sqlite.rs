//! SQLite-backed [`MetadataStore`].
//!
//! Every call runs via `spawn_blocking` on a connection behind `Arc<Mutex<_>>`. Partial unique
//! indexes enforce one pending version per source and one active record per version number.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use super::{MetadataStore, Source, SourceVersion, StoreError, VersionMetrics, VersionStatus, VersionUpdate};

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Run `$body` with the locked connection on a blocking thread.
macro_rules! db {
    ($conn:expr, $body:expr) => {{
        let conn = Arc::clone(&$conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| backend("connection lock poisoned"))?;
            ($body)(&mut *guard)
        })
        .await
        .map_err(|e| backend(format!("store task failed: {e}")))?
    }};
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::init(Connection::open(path.as_ref()).map_err(backend)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout=5000;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS sources (
                id               TEXT PRIMARY KEY,
                organization_id  TEXT NOT NULL,
                kind             TEXT NOT NULL,
                source_type      TEXT NOT NULL,
                current_version  INTEGER NOT NULL DEFAULT 0,
                extraction_query TEXT
            );

            CREATE TABLE IF NOT EXISTS source_versions (
                id              TEXT PRIMARY KEY,
                source_id       TEXT NOT NULL REFERENCES sources(id),
                version         INTEGER NOT NULL,
                status          TEXT NOT NULL,
                row_count       INTEGER,
                column_count    INTEGER,
                byte_size       INTEGER,
                elapsed_secs    REAL,
                error_message   TEXT,
                created_at      TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_one_pending
                ON source_versions(source_id) WHERE status = 'pending';
            CREATE UNIQUE INDEX IF NOT EXISTS idx_active_number
                ON source_versions(source_id, version) WHERE status = 'active';
            "#,
        )
        .map_err(backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Add or replace a source record.
    pub async fn register_source(&self, source: &Source) -> Result<(), StoreError> {
        let s = source.clone();
        db!(self.conn, move |conn: &mut Connection| {
            conn.execute(
                "INSERT OR REPLACE INTO sources \
                 (id, organization_id, kind, source_type, current_version, extraction_query) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![s.id, s.organization_id, s.kind.as_str(), s.source_type, s.current_version, s.extraction_query],
            )
            .map(|_| ())
            .map_err(backend)
        })
    }
}

type SourceRow = (String, String, String, String, u32, Option<String>);

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<SourceRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

/// Columns of `source_versions`, in table order.
struct VersionRow {
    id: String,
    source_id: String,
    version: u32,
    status: String,
    row_count: Option<i64>,
    column_count: Option<i64>,
    byte_size: Option<i64>,
    elapsed_secs: Option<f64>,
    error_message: Option<String>,
    created_at: String,
}

impl VersionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source_id: row.get(1)?,
            version: row.get(2)?,
            status: row.get(3)?,
            row_count: row.get(4)?,
            column_count: row.get(5)?,
            byte_size: row.get(6)?,
            elapsed_secs: row.get(7)?,
            error_message: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_version(self) -> Result<SourceVersion, StoreError> {
        let metrics = match (self.row_count, self.column_count, self.byte_size, self.elapsed_secs) {
            (Some(rows), Some(cols), Some(bytes), Some(secs)) => Some(VersionMetrics {
                row_count: rows as u64,
                column_count: cols as u64,
                byte_size: bytes as u64,
                elapsed_secs: secs,
            }),
            _ => None,
        };
        Ok(SourceVersion {
            id: self.id.parse().map_err(backend)?,
            source_id: self.source_id,
            version: self.version,
            status: self.status.parse()?,
            metrics,
            error_message: self.error_message,
            created_at: DateTime::parse_from_rfc3339(&self.created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(backend)?,
        })
    }
}

fn load_versions(conn: &Connection, source_id: &str) -> Result<Vec<SourceVersion>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, source_id, version, status, row_count, column_count, byte_size, elapsed_secs, \
                    error_message, created_at \
             FROM source_versions WHERE source_id = ?1 ORDER BY created_at, rowid",
        )
        .map_err(backend)?;
    let rows = stmt.query_map(params![source_id], VersionRow::read).map_err(backend)?;
    rows.map(|r| r.map_err(backend).and_then(VersionRow::into_version)).collect()
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn get_source(&self, source_id: &str) -> Result<Source, StoreError> {
        let id = source_id.to_owned();
        db!(self.conn, move |conn: &mut Connection| {
            let found = conn
                .query_row(
                    "SELECT id, organization_id, kind, source_type, current_version, extraction_query \
                     FROM sources WHERE id = ?1",
                    params![id],
                    source_from_row,
                )
                .optional()
                .map_err(backend)?;
            let (id, organization_id, kind, source_type, current_version, extraction_query) =
                found.ok_or(StoreError::SourceNotFound(id))?;
            Ok(Source {
                id,
                organization_id,
                kind: kind.parse()?,
                source_type,
                current_version,
                extraction_query,
            })
        })
    }

    async fn insert_version(&self, version: &SourceVersion) -> Result<(), StoreError> {
        let v = version.clone();
        db!(self.conn, move |conn: &mut Connection| {
            let tx = conn.transaction().map_err(backend)?;
            let exists: bool = tx
                .query_row("SELECT EXISTS(SELECT 1 FROM sources WHERE id = ?1)", params![v.source_id], |r| r.get(0))
                .map_err(backend)?;
            if !exists {
                return Err(StoreError::SourceNotFound(v.source_id));
            }
            let pending: Option<u32> = tx
                .query_row(
                    "SELECT version FROM source_versions WHERE source_id = ?1 AND status = 'pending'",
                    params![v.source_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(backend)?;
            if let Some(version) = pending {
                return Err(StoreError::PendingExists {
                    source_id: v.source_id,
                    version,
                });
            }
            tx.execute(
                "INSERT INTO source_versions (id, source_id, version, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![v.id.to_string(), v.source_id, v.version, v.status.as_str(), v.created_at.to_rfc3339()],
            )
            .map_err(backend)?;
            tx.commit().map_err(backend)
        })
    }

    async fn update_version(&self, version_id: Uuid, update: &VersionUpdate) -> Result<(), StoreError> {
        let u = update.clone();
        db!(self.conn, move |conn: &mut Connection| {
            let tx = conn.transaction().map_err(backend)?;
            let status: Option<String> = tx
                .query_row(
                    "SELECT status FROM source_versions WHERE id = ?1",
                    params![version_id.to_string()],
                    |r| r.get(0),
                )
                .optional()
                .map_err(backend)?;
            let from: VersionStatus = status.ok_or(StoreError::VersionNotFound(version_id))?.parse()?;
            if !from.can_become(u.status) {
                return Err(StoreError::IllegalTransition {
                    id: version_id,
                    from,
                    to: u.status,
                });
            }
            let m = u.metrics;
            tx.execute(
                "UPDATE source_versions SET status = ?2, row_count = ?3, column_count = ?4, byte_size = ?5, \
                 elapsed_secs = ?6, error_message = ?7 WHERE id = ?1",
                params![
                    version_id.to_string(),
                    u.status.as_str(),
                    m.map(|m| m.row_count as i64),
                    m.map(|m| m.column_count as i64),
                    m.map(|m| m.byte_size as i64),
                    m.map(|m| m.elapsed_secs),
                    u.error_message,
                ],
            )
            .map_err(backend)?;
            tx.commit().map_err(backend)
        })
    }

    async fn update_current_version(&self, source_id: &str, version: u32) -> Result<(), StoreError> {
        let id = source_id.to_owned();
        db!(self.conn, move |conn: &mut Connection| {
            let tx = conn.transaction().map_err(backend)?;
            let current: Option<u32> = tx
                .query_row("SELECT current_version FROM sources WHERE id = ?1", params![id], |r| r.get(0))
                .optional()
                .map_err(backend)?;
            let current = current.ok_or_else(|| StoreError::SourceNotFound(id.clone()))?;
            let invalid = |reason| StoreError::InvalidCurrentVersion {
                source_id: id.clone(),
                version,
                reason,
            };
            if version <= current {
                return Err(invalid("current_version only increases"));
            }
            let active: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM source_versions \
                     WHERE source_id = ?1 AND version = ?2 AND status = 'active')",
                    params![id, version],
                    |r| r.get(0),
                )
                .map_err(backend)?;
            if !active {
                return Err(invalid("version is not active"));
            }
            tx.execute("UPDATE sources SET current_version = ?2 WHERE id = ?1", params![id, version])
                .map_err(backend)?;
            tx.commit().map_err(backend)
        })
    }

    async fn update_extraction_query(&self, source_id: &str, query: &str) -> Result<(), StoreError> {
        let id = source_id.to_owned();
        let query = query.to_owned();
        db!(self.conn, move |conn: &mut Connection| {
            let n = conn
                .execute("UPDATE sources SET extraction_query = ?2 WHERE id = ?1", params![id, query])
                .map_err(backend)?;
            if n == 0 {
                Err(StoreError::SourceNotFound(id))
            } else {
                Ok(())
            }
        })
    }

    async fn list_versions(&self, source_id: &str) -> Result<Vec<SourceVersion>, StoreError> {
        let id = source_id.to_owned();
        db!(self.conn, move |conn: &mut Connection| load_versions(conn, &id))
    }
}
