//! The conversion service: request handling on top of every other module.
//!
//! [`Converter`] owns the shared pieces (connector registry, credential cache, version tracker,
//! worker pool, concurrency permits) and runs one request per call:
//!
//! 1. validate the request against the source record (no version exists yet)
//! 2. take a conversion permit and open a `pending` version
//! 3. read or extract, refine types, transform and write the output under the processing-time
//!    ceiling
//! 4. activate the version with metrics, or fail it with the error, then notify observers
//!
//! Step 4 always runs, so every failure after step 2 leaves an `error` record behind.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::connectors::{
    ConnectorRegistry, ConnectorType, CredentialCache, CredentialResolver, DatabaseConnector, ExtractRequest,
    ExtractSettings, QuerySource, StaticResolver, extract, test_connection, validate_identifier,
};
use crate::error::{PipelineError, PipelineResult};
use crate::execution::{ExecutionEngine, ExecutionOptions, TracingExecutionObserver};
use crate::inference::{InferenceOptions, MAX_SAMPLE_SIZE, infer_schema_with, refine_types_with};
use crate::ingestion::{
    CompositeObserver, ConversionContext, ConversionObserver, ConversionStats, FileObserver, Location, ReadOptions,
    Severity, SourceFormat, TracingObserver, fetch_source, notify, parse_location, read_bytes, resolve_format,
    source_prefix,
};
use crate::output::{Compression, output_location, write_dataset};
use crate::processing::{TransformOptions, apply_transforms_with};
use crate::types::{DataSet, Schema};
use crate::versioning::{
    InMemoryStore, MetadataStore, PendingVersion, Source, SourceKind, StoreError, VersionMetrics, VersionTracker,
};

pub mod api;

pub use api::{
    Capabilities, ColumnSchema, ConnectionInfo, ConnectionTestRequest, ConnectionTestResponse, ConnectorCapability,
    ConversionMetadata, ConversionResponse, DatabaseConversionRequest, ErrorResponse, FileConversionRequest,
    FileReadOptions, Limits, SchemaInferRequest, SchemaInferResponse,
};

/// Builds a [`Converter`]. Unset collaborators fall back to process-local defaults.
pub struct ConverterBuilder {
    config: ServiceConfig,
    store: Option<Arc<dyn MetadataStore>>,
    resolver: Option<Arc<dyn CredentialResolver>>,
    registry: ConnectorRegistry,
    observers: Vec<Arc<dyn ConversionObserver>>,
    alert_at: Severity,
}

impl ConverterBuilder {
    pub fn store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn credential_resolver(mut self, resolver: Arc<dyn CredentialResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Add or replace the connector for its type.
    pub fn connector(mut self, connector: Arc<dyn DatabaseConnector>) -> Self {
        self.registry.register(connector);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ConversionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Failures at or above `severity` are raised as alerts. Defaults to [`Severity::Critical`].
    pub fn alert_at(mut self, severity: Severity) -> Self {
        self.alert_at = severity;
        self
    }

    pub fn build(self) -> PipelineResult<Converter> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| PipelineError::Input(e.to_string()))?;
        let source_root = parse_location(&config.source_root, &config.storage_options)?;
        let output_root = parse_location(&config.output_root, &config.storage_options)?;

        let mut observers: Vec<Arc<dyn ConversionObserver>> = vec![Arc::new(TracingObserver)];
        if let Some(path) = &config.lineage_log {
            observers.push(Arc::new(FileObserver::new(path)));
        }
        observers.extend(self.observers);

        let store = self.store.unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let resolver = self.resolver.unwrap_or_else(|| Arc::new(StaticResolver::new()));
        let engine = ExecutionEngine::new(ExecutionOptions::with_threads(config.worker_threads))
            .with_observer(Arc::new(TracingExecutionObserver));

        Ok(Converter {
            credentials: CredentialCache::new(resolver, config.credential_cache_ttl()),
            tracker: VersionTracker::new(store),
            registry: self.registry,
            observer: CompositeObserver::new(observers),
            alert_at: self.alert_at,
            engine: Arc::new(engine),
            permits: Arc::new(Semaphore::new(config.max_concurrent_conversions)),
            settings: ExtractSettings::from_config(&config),
            source_root,
            output_root,
            config,
        })
    }
}

/// Runs conversions, schema inference and connection tests.
pub struct Converter {
    config: ServiceConfig,
    registry: ConnectorRegistry,
    credentials: CredentialCache,
    tracker: VersionTracker,
    observer: CompositeObserver,
    alert_at: Severity,
    engine: Arc<ExecutionEngine>,
    permits: Arc<Semaphore>,
    settings: ExtractSettings,
    source_root: Location,
    output_root: Location,
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("registry", &self.registry)
            .field("source_root", &self.source_root.to_string())
            .field("output_root", &self.output_root.to_string())
            .finish_non_exhaustive()
    }
}

/// What a conversion produced before it was written.
struct Prepared {
    dataset: DataSet,
    rows_skipped: usize,
    warnings: Vec<String>,
    connection: Option<ConnectionInfo>,
}

/// Output options settled before a version is opened.
#[derive(Debug, Clone, Copy)]
struct WriteSettings {
    compression: Compression,
    row_group_size: usize,
}

/// A successfully written conversion, ready for activation.
struct Written {
    schema: Schema,
    rows: usize,
    columns: usize,
    bytes: u64,
    rows_skipped: usize,
    warnings: Vec<String>,
    connection: Option<ConnectionInfo>,
}

impl Converter {
    pub fn builder(config: ServiceConfig) -> ConverterBuilder {
        ConverterBuilder {
            config,
            store: None,
            resolver: None,
            registry: ConnectorRegistry::with_defaults(),
            observers: Vec::new(),
            alert_at: Severity::Critical,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        self.tracker.store()
    }

    pub fn credentials(&self) -> &CredentialCache {
        &self.credentials
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Convert an uploaded file source into a new version.
    pub async fn convert_file(&self, req: FileConversionRequest) -> PipelineResult<ConversionResponse> {
        let request_id = Uuid::new_v4();
        let span = info_span!("convert_file", %request_id, source_id = %req.source_id);
        async move {
            info!("file conversion requested");
            let source = self.store().get_source(&req.source_id).await?;
            expect_kind(&source, SourceKind::File)?;
            let format = resolve_format(req.format, Some(&source.source_type), req.file_name.as_deref())?;
            ensure_enabled(format)?;
            let read = req.read.to_read_options()?;
            let write = self.write_settings(req.compression, req.row_group_size)?;

            let location = source_prefix(&self.source_root, &source.organization_id, &source.id);
            let max_bytes = self.config.max_file_size_bytes();
            let engine = Arc::clone(&self.engine);
            let transform = req.transform;
            let produce = move |_cancel: CancellationToken| async move {
                let fetched = fetch_source(&location, format, max_bytes).await?;
                info!(file = %fetched.name, bytes = fetched.size(), %format, "source fetched");
                run_blocking(move || {
                    let mut dataset = read_bytes(format, fetched.bytes, &read)?;
                    if format.is_text_bearing() {
                        refine_types_with(&engine, &mut dataset);
                    }
                    Ok(transformed(&engine, dataset, &transform))
                })
                .await
            };
            self.run_versioned(request_id, &source, format.as_str(), write, produce).await
        }
        .instrument(span)
        .await
    }

    /// Extract a database source into a new version.
    pub async fn convert_database(&self, req: DatabaseConversionRequest) -> PipelineResult<ConversionResponse> {
        let request_id = Uuid::new_v4();
        let span = info_span!("convert_database", %request_id, source_id = %req.source_id);
        async move {
            info!("database conversion requested");
            let source = self.store().get_source(&req.source_id).await?;
            expect_kind(&source, SourceKind::Database)?;
            let connector_type: ConnectorType = source.source_type.parse()?;
            let query_source = match (req.query.as_deref(), req.table_name.as_deref(), &source.extraction_query) {
                (None, None, Some(stored)) => QuerySource::Query(stored.clone()),
                (query, table, _) => QuerySource::from_parts(query, table)?,
            };
            let row_limit = self.row_limit(req.row_limit)?;
            if let Some(spec) = &req.partition {
                if spec.count == 0 || spec.count > self.config.max_partitions {
                    return Err(PipelineError::Input(format!(
                        "partition count must be between 1 and {}",
                        self.config.max_partitions
                    )));
                }
                validate_identifier(&spec.column)?;
            }
            if req.credential_ref.trim().is_empty() {
                return Err(PipelineError::Input("credential_ref is required".to_string()));
            }
            let write = self.write_settings(req.compression, req.row_group_size)?;
            let connector = self.registry.get(connector_type)?;

            let request = ExtractRequest {
                source: query_source,
                row_limit,
                partition: req.partition,
            };
            let settings = self.settings.clone();
            let engine = Arc::clone(&self.engine);
            let transform = req.transform;
            let credential_ref = req.credential_ref;
            let produce = move |cancel: CancellationToken| async move {
                let credentials = self.credentials.get(&credential_ref).await?;
                let extraction = extract(connector, credentials, &request, &settings, &cancel).await?;
                let connection = ConnectionInfo {
                    connector_type,
                    query: extraction.query,
                    base_query: extraction.base_query,
                    compression: write.compression,
                    partitions: extraction.plan.len(),
                    attempts: extraction.attempts,
                };
                let dataset = extraction.data;
                run_blocking(move || Ok(transformed(&engine, dataset, &transform)))
                    .await
                    .map(|prepared| Prepared {
                        connection: Some(connection),
                        ..prepared
                    })
            };
            self.run_versioned(request_id, &source, connector_type.as_str(), write, produce)
                .await
        }
        .instrument(span)
        .await
    }

    /// Infer the schema of a file source from a head sample. No version is created.
    pub async fn infer_schema(&self, req: SchemaInferRequest) -> PipelineResult<SchemaInferResponse> {
        let span = info_span!("infer_schema", source_id = %req.source_id);
        async move {
            let source = self.store().get_source(&req.source_id).await?;
            expect_kind(&source, SourceKind::File)?;
            let format = resolve_format(req.format, Some(&source.source_type), req.file_name.as_deref())?;
            ensure_enabled(format)?;
            let read: ReadOptions = req.read.to_read_options()?;
            let options = InferenceOptions {
                sample_size: req.sample_size.unwrap_or(crate::inference::DEFAULT_SAMPLE_SIZE),
                refine_text: format.is_text_bearing(),
                non_nullable: req.non_nullable,
            };
            options.validate().map_err(PipelineError::Input)?;

            let location = source_prefix(&self.source_root, &source.organization_id, &source.id);
            let max_bytes = self.config.max_file_size_bytes();
            let engine = Arc::clone(&self.engine);
            let ceiling = self.config.max_processing_time();
            let work = async move {
                let fetched = fetch_source(&location, format, max_bytes).await?;
                let size = fetched.size();
                run_blocking(move || {
                    let dataset = read_bytes(format, fetched.bytes, &read)?;
                    let mut report = infer_schema_with(&engine, &dataset, &options);
                    report.schema_info.file_size_bytes = Some(size);
                    Ok(report)
                })
                .await
            };
            let report = timeout(ceiling, work)
                .await
                .map_err(|_| PipelineError::Timeout { after: ceiling })??;
            info!(
                columns = report.schema_info.total_columns,
                rows = report.schema_info.total_rows,
                warnings = report.warnings.len(),
                "schema inferred"
            );
            Ok(SchemaInferResponse {
                success: true,
                source_id: source.id,
                format,
                schema_info: report.schema_info,
                sample_data: report.sample_data,
                warnings: report.warnings,
            })
        }
        .instrument(span)
        .await
    }

    /// Test connectivity to a backend. Backend failures come back as an unsuccessful outcome;
    /// only request and credential-lookup problems are errors.
    pub async fn test_connection(&self, req: ConnectionTestRequest) -> PipelineResult<ConnectionTestResponse> {
        let connector_type = req
            .connector_type
            .ok_or_else(|| PipelineError::Input("connector_type is required".to_string()))?;
        let credentials = match (req.credentials, req.credential_ref) {
            (Some(inline), _) => Arc::new(inline),
            (None, Some(reference)) => self.credentials.get(&reference).await?,
            (None, None) => {
                return Err(PipelineError::Input(
                    "either credentials or credential_ref is required".to_string(),
                ));
            }
        };
        let connector = self.registry.get(connector_type)?;
        let cancel = CancellationToken::new();
        let outcome = test_connection(connector, credentials, &self.settings, &cancel).await;
        if !outcome.success {
            warn!(connector = %connector_type, code = ?outcome.error_code, "connection test failed");
        }
        Ok(outcome)
    }

    /// Formats, connectors and configured limits.
    pub fn capabilities(&self) -> Capabilities {
        let c = &self.config;
        Capabilities {
            file_formats: SourceFormat::ALL.into_iter().filter(|f| f.is_enabled()).collect(),
            output_format: "parquet",
            compressions: Compression::ALL.to_vec(),
            default_compression: c.default_compression,
            connectors: ConnectorType::ALL
                .into_iter()
                .map(|ty| ConnectorCapability {
                    connector_type: ty,
                    available: connector_compiled_in(ty),
                    supports_partitioning: ty.supports_partitioning(),
                    default_port: ty.default_port(),
                    default_ssl_mode: ty.default_ssl_mode(),
                })
                .collect(),
            limits: Limits {
                max_file_size_mb: c.max_file_size_mb,
                max_processing_time_secs: c.max_processing_time_secs,
                memory_limit_mb: c.memory_limit_mb,
                worker_threads: self.engine.options().num_threads.unwrap_or(1),
                default_row_limit: c.default_row_limit,
                max_row_limit: c.max_row_limit,
                default_row_group_size: c.default_row_group_size,
                max_partitions: c.max_partitions,
                max_concurrent_conversions: c.max_concurrent_conversions,
                max_sample_size: MAX_SAMPLE_SIZE,
                credential_cache_ttl_secs: c.credential_cache_ttl_secs,
            },
        }
    }

    /// Fail `pending` versions of `source_id` older than twice the processing-time ceiling.
    pub async fn recover_stale_versions(&self, source_id: &str) -> PipelineResult<Vec<Uuid>> {
        Ok(self.tracker.recover_stale(source_id, self.stale_after()).await?)
    }

    fn stale_after(&self) -> Duration {
        self.config.max_processing_time().saturating_mul(2)
    }

    fn write_settings(&self, compression: Option<Compression>, row_group_size: Option<usize>) -> PipelineResult<WriteSettings> {
        let row_group_size = row_group_size.unwrap_or(self.config.default_row_group_size);
        if row_group_size == 0 {
            return Err(PipelineError::Input("row_group_size must be > 0".to_string()));
        }
        Ok(WriteSettings {
            compression: compression.unwrap_or(self.config.default_compression),
            row_group_size,
        })
    }

    fn row_limit(&self, requested: Option<usize>) -> PipelineResult<usize> {
        match requested {
            None => Ok(self.config.default_row_limit),
            Some(n) if n == 0 || n > self.config.max_row_limit => Err(PipelineError::Input(format!(
                "row_limit must be between 1 and {}",
                self.config.max_row_limit
            ))),
            Some(n) => Ok(n),
        }
    }

    /// Open a version, allowing one recovery pass when the blocking pending record is stale.
    async fn begin(&self, source: &Source) -> PipelineResult<PendingVersion> {
        match self.tracker.begin(source).await {
            Err(conflict @ StoreError::PendingExists { .. }) => {
                let recovered = self.tracker.recover_stale(&source.id, self.stale_after()).await?;
                if recovered.is_empty() {
                    return Err(conflict.into());
                }
                Ok(self.tracker.begin(source).await?)
            }
            other => Ok(other?),
        }
    }

    /// Open a version, run `produce` and the write under the processing ceiling, then finalize.
    async fn run_versioned<F, Fut>(
        &self,
        request_id: Uuid,
        source: &Source,
        source_type: &str,
        write: WriteSettings,
        produce: F,
    ) -> PipelineResult<ConversionResponse>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = PipelineResult<Prepared>>,
    {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Internal("conversion permits closed".to_string()))?;
        let started = Instant::now();
        let pending = self.begin(source).await?;
        let version = pending.number();
        let ctx = ConversionContext {
            request_id,
            organization_id: source.organization_id.clone(),
            source_id: source.id.clone(),
            source_type: source_type.to_string(),
            version: Some(version),
        };
        let target = output_location(&self.output_root, &source.organization_id, &source.id, version);
        let ceiling = self.config.max_processing_time();
        let cancel = CancellationToken::new();

        let work = async {
            let prepared = produce(cancel.clone()).await?;
            let schema = prepared.dataset.schema.clone();
            let summary = write_dataset(prepared.dataset, &target, write.compression, write.row_group_size, &cancel).await?;
            Ok::<_, PipelineError>(Written {
                schema,
                rows: summary.rows,
                columns: summary.columns,
                bytes: summary.bytes,
                rows_skipped: prepared.rows_skipped,
                warnings: prepared.warnings,
                connection: prepared.connection,
            })
        };
        let outcome = match timeout(ceiling, work).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                warn!(version, after_secs = ceiling.as_secs(), "processing time ceiling reached");
                Err(PipelineError::Timeout { after: ceiling })
            }
        };
        let outcome = match outcome {
            Ok(written) => match &written.connection {
                Some(info) => self
                    .store()
                    .update_extraction_query(&source.id, &info.base_query)
                    .await
                    .map(|_| written)
                    .map_err(PipelineError::from),
                None => Ok(written),
            },
            Err(e) => Err(e),
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(written) => {
                let metrics = VersionMetrics {
                    row_count: written.rows as u64,
                    column_count: written.columns as u64,
                    byte_size: written.bytes,
                    elapsed_secs: elapsed.as_secs_f64(),
                };
                let record = match pending.activate(metrics).await {
                    Ok(record) => record,
                    Err(e) => {
                        let e = PipelineError::from(e);
                        error!(version, error = %e, "version activation failed");
                        notify(&self.observer, self.alert_at, &ctx, Err(&e));
                        return Err(e);
                    }
                };
                let stats = ConversionStats {
                    rows: written.rows,
                    columns: written.columns,
                    bytes: written.bytes,
                    elapsed,
                    warnings: written.warnings.len(),
                };
                notify(&self.observer, self.alert_at, &ctx, Ok(&stats));
                Ok(ConversionResponse {
                    success: true,
                    source_id: source.id.clone(),
                    version: record.version,
                    version_id: record.id,
                    output: target.to_string(),
                    metadata: ConversionMetadata {
                        rows: written.rows,
                        columns: written.columns,
                        schema: api::column_schema(&written.schema),
                        file_size_bytes: written.bytes,
                        processing_time_secs: elapsed.as_secs_f64(),
                        source_type: source_type.to_string(),
                        rows_skipped: written.rows_skipped,
                        warnings: written.warnings,
                        connection: written.connection,
                    },
                })
            }
            Err(e) => {
                if matches!(e, PipelineError::Internal(_)) {
                    error!(version, error = %e, "conversion failed unexpectedly");
                }
                if let Err(store_err) = pending.fail(format!("{}: {e}", e.error_code())).await {
                    error!(version, error = %store_err, "could not record the failed version");
                }
                notify(&self.observer, self.alert_at, &ctx, Err(&e));
                Err(e)
            }
        }
    }
}

fn expect_kind(source: &Source, kind: SourceKind) -> PipelineResult<()> {
    if source.kind == kind {
        Ok(())
    } else {
        Err(PipelineError::Input(format!(
            "source {} is a {} source, not a {} source",
            source.id,
            source.kind.as_str(),
            kind.as_str()
        )))
    }
}

fn ensure_enabled(format: SourceFormat) -> PipelineResult<()> {
    if format.is_enabled() {
        Ok(())
    } else {
        Err(PipelineError::Input(format!(
            "{format} reading is not enabled in this build (enable cargo feature '{format}')"
        )))
    }
}

fn connector_compiled_in(ty: ConnectorType) -> bool {
    match ty {
        ConnectorType::Sqlite => cfg!(feature = "sqlite"),
        _ => cfg!(feature = "db_connectorx"),
    }
}

fn transformed(engine: &ExecutionEngine, dataset: DataSet, options: &TransformOptions) -> Prepared {
    let outcome = apply_transforms_with(engine, dataset, options);
    Prepared {
        dataset: outcome.dataset,
        rows_skipped: outcome.rows_skipped,
        warnings: outcome.warnings.iter().map(ToString::to_string).collect(),
        connection: None,
    }
}

/// Run CPU-bound work off the async runtime.
async fn run_blocking<T, F>(f: F) -> PipelineResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> PipelineResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::Internal(format!("worker task failed: {e}")))?
}
