#![cfg(feature = "sqlite")]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use tabular_convert::PipelineError;
use tabular_convert::connectors::sqlite::SqliteConnector;
use tabular_convert::connectors::{
    ConnectorCredentials, ConnectorError, ConnectorType, DatabaseConnector, PartitionSpec, Session,
};
use tabular_convert::service::DatabaseConversionRequest;
use tabular_convert::types::{DataSet, Value};
use tabular_convert::versioning::MetadataStore;

mod common;

use common::HarnessBuilder;

fn readings_db(dir: &Path) -> PathBuf {
    let path = dir.join("readings.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("CREATE TABLE readings (id INTEGER, sensor TEXT, value REAL);")
        .unwrap();
    let mut insert = conn
        .prepare("INSERT INTO readings VALUES (?1, ?2, ?3)")
        .unwrap();
    for id in 1..=100_i64 {
        insert
            .execute(rusqlite::params![id, format!("s{}", id % 3), id as f64 / 10.0])
            .unwrap();
    }
    path
}

fn file_credentials(path: &Path) -> ConnectorCredentials {
    ConnectorCredentials {
        file_path: Some(path.display().to_string()),
        ..ConnectorCredentials::default()
    }
}

#[tokio::test]
async fn sqlite_table_converts_end_to_end() {
    let root = common::scratch_dir("sqlite-e2e");
    let db = readings_db(&root);
    let h = HarnessBuilder::new("sqlite-e2e")
        .credentials("local", file_credentials(&db))
        .build();
    common::database_source(&h.store, "readings", ConnectorType::Sqlite);

    let mut req = DatabaseConversionRequest::new("readings", "local");
    req.table_name = Some("readings".into());
    req.row_limit = Some(40);
    let done = h.converter.convert_database(req).await.unwrap();

    assert_eq!(done.metadata.rows, 40);
    assert_eq!(done.metadata.columns, 3);
    assert!(common::output_path(&h.root, "readings", 1).is_file());

    // SQLite never splits, even when asked to.
    let mut req = DatabaseConversionRequest::new("readings", "local");
    req.table_name = Some("readings".into());
    req.partition = Some(PartitionSpec {
        column: "id".into(),
        count: 4,
    });
    let done = h.converter.convert_database(req).await.unwrap();
    assert_eq!(done.version, 2);
    assert_eq!(done.metadata.connection.unwrap().partitions, 1);
    assert_eq!(done.metadata.rows, 100);
}

#[tokio::test]
async fn missing_tables_are_not_found() {
    let root = common::scratch_dir("sqlite-missing");
    let db = readings_db(&root);
    let h = HarnessBuilder::new("sqlite-missing")
        .credentials("local", file_credentials(&db))
        .build();
    common::database_source(&h.store, "readings", ConnectorType::Sqlite);

    let mut req = DatabaseConversionRequest::new("readings", "local");
    req.table_name = Some("nope".into());
    let err = h.converter.convert_database(req).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotFound(_)));
}

/// SQLite presented as a range-splitting backend, recording every statement it runs.
struct SplittingSqlite {
    statements: Arc<Mutex<Vec<String>>>,
}

impl DatabaseConnector for SplittingSqlite {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Postgresql
    }

    fn attach(&self, credentials: &ConnectorCredentials) -> Result<Box<dyn Session>, ConnectorError> {
        Ok(Box::new(RecordingSession {
            inner: SqliteConnector.attach(credentials)?,
            statements: Arc::clone(&self.statements),
        }))
    }
}

struct RecordingSession {
    inner: Box<dyn Session>,
    statements: Arc<Mutex<Vec<String>>>,
}

impl Session for RecordingSession {
    fn query(&mut self, sql: &str) -> Result<DataSet, ConnectorError> {
        self.statements.lock().unwrap().push(sql.to_string());
        self.inner.query(sql)
    }
}

#[tokio::test]
async fn partitions_cover_every_row_in_key_order() {
    let root = common::scratch_dir("sqlite-split");
    let db = readings_db(&root);
    let statements = Arc::new(Mutex::new(Vec::new()));
    let credentials = ConnectorCredentials {
        host: Some("localhost".into()),
        database: Some(db.display().to_string()),
        username: Some("reader".into()),
        ..file_credentials(&db)
    };
    let h = HarnessBuilder::new("sqlite-split")
        .credentials("split", credentials)
        .connector(Arc::new(SplittingSqlite {
            statements: Arc::clone(&statements),
        }))
        .build();
    common::database_source(&h.store, "readings", ConnectorType::Postgresql);

    let mut req = DatabaseConversionRequest::new("readings", "split");
    req.table_name = Some("readings".into());
    req.partition = Some(PartitionSpec {
        column: "id".into(),
        count: 4,
    });
    let done = h.converter.convert_database(req).await.unwrap();

    let info = done.metadata.connection.unwrap();
    assert_eq!(info.partitions, 4);
    assert_eq!(info.attempts, 5);
    assert_eq!(done.metadata.rows, 100);

    let statements = statements.lock().unwrap().clone();
    assert_eq!(statements.len(), 5);
    assert!(statements[0].contains("MIN(id)"));
    assert!(statements[1..].iter().all(|s| s.contains("_part")));

    let bytes = std::fs::read(common::output_path(&h.root, "readings", 1)).unwrap();
    let written = tabular_convert::ingestion::parquet::read_parquet(bytes::Bytes::from(bytes)).unwrap();
    let ids: Vec<Value> = written.rows.iter().map(|r| r[0].clone()).collect();
    let expected: Vec<Value> = (1..=100).map(Value::Int64).collect();
    assert_eq!(ids, expected);

    let source = h.store.get_source("readings").await.unwrap();
    assert_eq!(source.extraction_query.as_deref(), Some("SELECT * FROM readings"));
    assert_eq!(info.base_query, "SELECT * FROM readings");
}

#[tokio::test]
async fn statement_errors_fail_fast_as_input_errors() {
    let root = common::scratch_dir("sqlite-bad-column");
    let db = readings_db(&root);
    let statements = Arc::new(Mutex::new(Vec::new()));
    let credentials = ConnectorCredentials {
        host: Some("localhost".into()),
        database: Some(db.display().to_string()),
        username: Some("reader".into()),
        ..file_credentials(&db)
    };
    let h = HarnessBuilder::new("sqlite-bad-column")
        .credentials("split", credentials)
        .connector(Arc::new(SplittingSqlite {
            statements: Arc::clone(&statements),
        }))
        .build();
    common::database_source(&h.store, "readings", ConnectorType::Postgresql);

    let mut req = DatabaseConversionRequest::new("readings", "split");
    req.query = Some("SELECT nope FROM readings".into());
    let err = h.converter.convert_database(req).await.unwrap_err();

    assert!(matches!(err, PipelineError::Input(_)), "{err:?}");
    assert_eq!(err.status(), 400);
    assert!(err.to_string().contains("no such column"));
    // Tried once, never retried.
    assert_eq!(statements.lock().unwrap().len(), 1);

    let versions = h.store.list_versions("readings").await.unwrap();
    assert_eq!(versions[0].status, tabular_convert::versioning::VersionStatus::Error);
}
