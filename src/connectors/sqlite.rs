//! File-based SQLite backend (`rusqlite`).

use std::path::Path;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};

use crate::ingestion::columns::{Cell, ColumnarBuilder};
use crate::types::DataSet;

use super::{ConnectorCredentials, ConnectorError, ConnectorType, DatabaseConnector, FailureKind, Session};

/// Opens the database file read-only. SQLite has no range splitting.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteConnector;

impl DatabaseConnector for SqliteConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Sqlite
    }

    fn attach(&self, credentials: &ConnectorCredentials) -> Result<Box<dyn Session>, ConnectorError> {
        let path = credentials
            .sqlite_path()
            .ok_or_else(|| ConnectorError::new(FailureKind::InvalidDatabase, "no database file given"))?;
        if !Path::new(path).is_file() {
            return Err(ConnectorError::new(
                FailureKind::InvalidDatabase,
                format!("database file '{path}' does not exist"),
            ));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
        )
        .map_err(|e| ConnectorError::new(FailureKind::InvalidDatabase, e.to_string()))?;
        Ok(Box::new(SqliteSession { conn }))
    }
}

struct SqliteSession {
    conn: Connection,
}

impl Session for SqliteSession {
    fn query(&mut self, sql: &str) -> Result<DataSet, ConnectorError> {
        let mut stmt = self.conn.prepare(sql).map_err(ConnectorError::from_driver)?;

        let mut builder = ColumnarBuilder::new();
        let mut seen = std::collections::HashSet::new();
        let columns: Vec<usize> = stmt
            .column_names()
            .into_iter()
            .map(|name| {
                // Joins can repeat a name; later copies get a numeric suffix.
                let mut unique = name.to_string();
                let mut n = 2;
                while !seen.insert(unique.clone()) {
                    unique = format!("{name}_{n}");
                    n += 1;
                }
                builder.column(&unique)
            })
            .collect();

        let mut rows = stmt.query([]).map_err(ConnectorError::from_driver)?;
        while let Some(row) = rows.next().map_err(ConnectorError::from_driver)? {
            let mut cells = Vec::with_capacity(columns.len());
            for (i, &col) in columns.iter().enumerate() {
                let value = row.get_ref(i).map_err(ConnectorError::from_driver)?;
                cells.push((col, to_cell(value)));
            }
            builder.push_row(cells);
        }
        Ok(builder.finish())
    }

    fn server_version(&mut self) -> Result<Option<String>, ConnectorError> {
        Ok(Some(format!("SQLite {}", rusqlite::version())))
    }

    fn table_count(&mut self) -> Result<Option<u64>, ConnectorError> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .map_err(ConnectorError::from_driver)?;
        Ok(u64::try_from(n).ok())
    }
}

fn to_cell(value: ValueRef<'_>) -> Cell {
    match value {
        ValueRef::Null => Cell::Null,
        ValueRef::Integer(i) => Cell::Int(i),
        ValueRef::Real(f) => Cell::Float(f),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            if text.trim().is_empty() {
                Cell::Null
            } else {
                Cell::Text(text.into_owned())
            }
        }
        ValueRef::Blob(bytes) => Cell::Text(bytes.iter().map(|b| format!("{b:02x}")).collect()),
    }
}
