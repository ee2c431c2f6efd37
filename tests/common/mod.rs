//! Shared harness for the integration tests: scratch roots, scripted connectors and a recording
//! observer.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tabular_convert::PipelineError;
use tabular_convert::config::ServiceConfig;
use tabular_convert::connectors::{
    ConnectorCredentials, ConnectorError, ConnectorType, DatabaseConnector, FailureKind, Session, StaticResolver,
};
use tabular_convert::ingestion::{ConversionContext, ConversionObserver, ConversionStats, Severity};
use tabular_convert::service::Converter;
use tabular_convert::types::{DataSet, DataType, Field, Schema, Value};
use tabular_convert::versioning::{InMemoryStore, Source, SourceKind};

pub const ORG: &str = "acme";
pub const CREDENTIAL_REF: &str = "warehouse";

/// A fresh directory under the system temp dir.
pub fn scratch_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tabular-convert-{label}-{}", uuid::Uuid::new_v4()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

/// Config rooted at `root` with fast retries.
pub fn config_at(root: &Path) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.source_root = root.display().to_string();
    config.output_root = root.display().to_string();
    config.worker_threads = Some(2);
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config.retry.jitter = 0.0;
    config
}

/// Place `contents` where the converter looks for uploads of `source_id`.
pub fn upload(root: &Path, source_id: &str, file_name: &str, contents: &[u8]) -> PathBuf {
    let dir = root.join(format!("org-{ORG}")).join("uploads").join(source_id);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(file_name);
    fs::write(&path, contents).unwrap();
    path
}

pub fn output_path(root: &Path, source_id: &str, version: u32) -> PathBuf {
    root.join(format!("org-{ORG}"))
        .join("processed")
        .join(source_id)
        .join(format!("v{version}"))
        .join("data.parquet")
}

pub fn file_source(store: &InMemoryStore, id: &str, format: &str) {
    store.register_source(Source::new(id, ORG, SourceKind::File, format));
}

pub fn database_source(store: &InMemoryStore, id: &str, connector: ConnectorType) {
    store.register_source(Source::new(id, ORG, SourceKind::Database, connector.as_str()));
}

pub fn postgres_credentials() -> ConnectorCredentials {
    ConnectorCredentials {
        host: Some("db.internal".into()),
        database: Some("analytics".into()),
        username: Some("reader".into()),
        password: Some("secret".into()),
        ..ConnectorCredentials::default()
    }
}

/// Everything a test needs to drive and inspect a converter.
pub struct Harness {
    pub root: PathBuf,
    pub store: Arc<InMemoryStore>,
    pub observer: Arc<RecordingObserver>,
    pub converter: Converter,
}

pub struct HarnessBuilder {
    root: PathBuf,
    config: ServiceConfig,
    resolver: StaticResolver,
    connectors: Vec<Arc<dyn DatabaseConnector>>,
}

impl HarnessBuilder {
    pub fn new(label: &str) -> Self {
        let root = scratch_dir(label);
        let config = config_at(&root);
        Self {
            root,
            config,
            resolver: StaticResolver::new().with(CREDENTIAL_REF, postgres_credentials()),
            connectors: Vec::new(),
        }
    }

    pub fn config(mut self, edit: impl FnOnce(&mut ServiceConfig)) -> Self {
        edit(&mut self.config);
        self
    }

    pub fn credentials(mut self, reference: &str, credentials: ConnectorCredentials) -> Self {
        self.resolver = self.resolver.with(reference, credentials);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn DatabaseConnector>) -> Self {
        self.connectors.push(connector);
        self
    }

    pub fn build(self) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let observer = Arc::new(RecordingObserver::default());
        let mut builder = Converter::builder(self.config)
            .store(store.clone())
            .credential_resolver(Arc::new(self.resolver))
            .observer(observer.clone());
        for c in self.connectors {
            builder = builder.connector(c);
        }
        Harness {
            root: self.root,
            store,
            observer,
            converter: builder.build().unwrap(),
        }
    }
}

/// Observer that remembers every callback.
#[derive(Default)]
pub struct RecordingObserver {
    pub successes: Mutex<Vec<(Option<u32>, usize)>>,
    pub failures: Mutex<Vec<(Severity, &'static str)>>,
    pub alerts: Mutex<Vec<Severity>>,
}

impl ConversionObserver for RecordingObserver {
    fn on_success(&self, ctx: &ConversionContext, stats: &ConversionStats) {
        self.successes.lock().unwrap().push((ctx.version, stats.rows));
    }

    fn on_failure(&self, _ctx: &ConversionContext, severity: Severity, error: &PipelineError) {
        self.failures.lock().unwrap().push((severity, error.error_code()));
    }

    fn on_alert(&self, _ctx: &ConversionContext, severity: Severity, _error: &PipelineError) {
        self.alerts.lock().unwrap().push(severity);
    }
}

/// Small typed table handed back by [`ScriptedConnector`] sessions.
pub fn orders(rows: i64) -> DataSet {
    DataSet::new(
        Schema::new(vec![
            Field::new("id", DataType::Int64),
            Field::new("amount", DataType::Float64),
        ]),
        (1..=rows)
            .map(|i| vec![Value::Int64(i), Value::Float64(i as f64 * 1.5)])
            .collect(),
    )
}

/// Connector whose sessions return a fixed table after a scripted number of failed attaches.
pub struct ScriptedConnector {
    connector_type: ConnectorType,
    failures_left: AtomicU32,
    failure: FailureKind,
    attach_delay: Duration,
    data: DataSet,
    pub attaches: AtomicU32,
    pub queries: Arc<Mutex<Vec<String>>>,
}

impl ScriptedConnector {
    pub fn new(connector_type: ConnectorType, data: DataSet) -> Self {
        Self {
            connector_type,
            failures_left: AtomicU32::new(0),
            failure: FailureKind::ConnectionRefused,
            attach_delay: Duration::ZERO,
            data,
            attaches: AtomicU32::new(0),
            queries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fail the first `times` attaches with `kind`.
    pub fn failing(mut self, times: u32, kind: FailureKind) -> Self {
        self.failures_left = AtomicU32::new(times);
        self.failure = kind;
        self
    }

    /// Block each attach for `delay`.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.attach_delay = delay;
        self
    }

    pub fn attach_count(&self) -> u32 {
        self.attaches.load(Ordering::SeqCst)
    }

    pub fn recorded_queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

impl DatabaseConnector for ScriptedConnector {
    fn connector_type(&self) -> ConnectorType {
        self.connector_type
    }

    fn attach(&self, _credentials: &ConnectorCredentials) -> Result<Box<dyn Session>, ConnectorError> {
        self.attaches.fetch_add(1, Ordering::SeqCst);
        if !self.attach_delay.is_zero() {
            std::thread::sleep(self.attach_delay);
        }
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(ConnectorError::new(self.failure, "scripted failure"));
        }
        Ok(Box::new(ScriptedSession {
            data: self.data.clone(),
            queries: Arc::clone(&self.queries),
        }))
    }
}

struct ScriptedSession {
    data: DataSet,
    queries: Arc<Mutex<Vec<String>>>,
}

impl Session for ScriptedSession {
    fn query(&mut self, sql: &str) -> Result<DataSet, ConnectorError> {
        self.queries.lock().unwrap().push(sql.to_string());
        Ok(self.data.clone())
    }
}
