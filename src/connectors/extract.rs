//! Partitioned extraction and connection tests.
//!
//! Every backend call runs in a blocking task (`attach` plus the work on the new session) wrapped
//! in [`retry_async`]. Partitions run concurrently, one task per partition, and are reassembled
//! in partition order regardless of completion order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PARTITION_CEILING, ServiceConfig};
use crate::retry::{RetryOutcome, RetryPolicy, retry_async};
use crate::types::DataSet;

use super::partition::{PartitionPlan, PartitionSpec, bounds_query};
use super::{ConnectorCredentials, ConnectorError, ConnectorType, DatabaseConnector, FailureKind, Session, validate_identifier};

/// What to extract: a free-form statement or a validated table name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuerySource {
    /// Passed through verbatim.
    Query(String),
    /// Checked against the identifier allow-list before any statement is issued.
    Table(String),
}

impl QuerySource {
    /// Exactly one of `query` and `table_name` must be set.
    pub fn from_parts(query: Option<&str>, table_name: Option<&str>) -> Result<Self, ConnectorError> {
        let query = query.map(str::trim).filter(|q| !q.is_empty());
        // Table names are validated as given; surrounding whitespace is rejected, not trimmed.
        let table_name = table_name.filter(|t| !t.is_empty());
        match (query, table_name) {
            (Some(q), None) => Ok(QuerySource::Query(q.to_string())),
            (None, Some(t)) => {
                validate_identifier(t)?;
                Ok(QuerySource::Table(t.to_string()))
            }
            (Some(_), Some(_)) => Err(ConnectorError::new(
                FailureKind::MalformedQuery,
                "provide either query or table_name, not both",
            )),
            (None, None) => Err(ConnectorError::new(
                FailureKind::MalformedQuery,
                "either query or table_name is required",
            )),
        }
    }

    /// The statement the extraction starts from.
    pub fn base_sql(&self) -> Result<String, ConnectorError> {
        match self {
            QuerySource::Query(q) => Ok(q.trim().trim_end_matches(';').to_string()),
            QuerySource::Table(t) => {
                validate_identifier(t)?;
                Ok(format!("SELECT * FROM {t}"))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub source: QuerySource,
    pub row_limit: usize,
    pub partition: Option<PartitionSpec>,
}

/// Retry and fan-out limits for backend calls.
#[derive(Debug, Clone)]
pub struct ExtractSettings {
    pub policy: RetryPolicy,
    pub attempt_timeout: Duration,
    pub max_partitions: usize,
}

impl ExtractSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            policy: config.retry.policy(),
            attempt_timeout: config.retry.attempt_timeout(),
            max_partitions: config.max_partitions,
        }
    }
}

impl Default for ExtractSettings {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(300),
            max_partitions: PARTITION_CEILING,
        }
    }
}

/// Result of [`extract`].
#[derive(Debug, Clone)]
pub struct Extraction {
    pub data: DataSet,
    /// The statement before any row limit or partition predicate; stored on the source for reuse.
    pub base_query: String,
    /// `base_query` with the row limit applied.
    pub query: String,
    pub plan: PartitionPlan,
    /// Backend attempts across bounds discovery and every partition.
    pub attempts: u32,
}

type ExtractResult<T> = Result<T, RetryOutcome<ConnectorError>>;

fn rejected(error: ConnectorError) -> RetryOutcome<ConnectorError> {
    RetryOutcome::Failed { attempts: 0, error }
}

/// Attach and run `work` on a blocking thread.
async fn run_session<T, F>(
    connector: Arc<dyn DatabaseConnector>,
    credentials: Arc<ConnectorCredentials>,
    work: F,
) -> Result<T, ConnectorError>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn Session) -> Result<T, ConnectorError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut session = connector.attach(&credentials)?;
        work(session.as_mut())
    })
    .await
    .map_err(|e| ConnectorError::new(FailureKind::Backend, format!("backend task failed: {e}")))?
}

/// Run one statement under the retry policy. Returns the data and the attempt that succeeded.
async fn query_with_retry(
    connector: &Arc<dyn DatabaseConnector>,
    credentials: &Arc<ConnectorCredentials>,
    sql: &str,
    settings: &ExtractSettings,
    cancel: &CancellationToken,
    label: &str,
) -> ExtractResult<(DataSet, u32)> {
    retry_async(
        |attempt| {
            let connector = Arc::clone(connector);
            let credentials = Arc::clone(credentials);
            let sql = sql.to_string();
            async move {
                run_session(connector, credentials, move |s| s.query(&sql))
                    .await
                    .map(|data| (data, attempt))
            }
        },
        settings.attempt_timeout,
        settings.policy.clone(),
        cancel,
        label,
    )
    .await
}

/// Extract `request` from `connector`.
///
/// Validation failures (bad identifiers, both or neither of query/table, an out-of-range
/// partition count) come back as [`RetryOutcome::Failed`] with zero attempts, before any backend
/// call. The first failing partition cancels the rest.
pub async fn extract(
    connector: Arc<dyn DatabaseConnector>,
    credentials: Arc<ConnectorCredentials>,
    request: &ExtractRequest,
    settings: &ExtractSettings,
    cancel: &CancellationToken,
) -> ExtractResult<Extraction> {
    let ty = connector.connector_type();
    credentials.validate_for(ty).map_err(rejected)?;
    let base = request.source.base_sql().map_err(rejected)?;
    let dialect = connector.dialect();
    let query = dialect.apply_limit(&base, request.row_limit);

    let mut attempts = 0u32;
    let plan = match &request.partition {
        Some(spec) if spec.count == 0 || spec.count > settings.max_partitions => {
            return Err(rejected(ConnectorError::new(
                FailureKind::MalformedQuery,
                format!("partition count must be between 1 and {}", settings.max_partitions),
            )));
        }
        Some(spec) if spec.count > 1 && connector.supports_partitioning() => {
            let sql = bounds_query(&base, &spec.column).map_err(rejected)?;
            let (bounds, attempt) =
                query_with_retry(&connector, &credentials, &sql, settings, cancel, "partition bounds").await?;
            attempts += attempt;
            PartitionPlan::from_bounds(&spec.column, &bounds, spec.count)
        }
        Some(spec) => {
            validate_identifier(&spec.column).map_err(rejected)?;
            if spec.count > 1 {
                debug!(connector = %ty, "connector does not split ranges; extracting one partition");
            }
            PartitionPlan::single()
        }
        None => PartitionPlan::single(),
    };
    info!(connector = %ty, partitions = plan.len(), column = ?plan.column, "extraction planned");

    let (mut data, partition_attempts) =
        run_partitions(&connector, &credentials, &plan, &base, request.row_limit, settings, cancel).await?;
    attempts += partition_attempts;
    data.truncate(request.row_limit);
    info!(connector = %ty, rows = data.row_count(), attempts, "extraction finished");
    Ok(Extraction {
        data,
        base_query: base,
        query,
        plan,
        attempts,
    })
}

async fn run_partitions(
    connector: &Arc<dyn DatabaseConnector>,
    credentials: &Arc<ConnectorCredentials>,
    plan: &PartitionPlan,
    base: &str,
    row_limit: usize,
    settings: &ExtractSettings,
    cancel: &CancellationToken,
) -> ExtractResult<(DataSet, u32)> {
    let dialect = connector.dialect();
    let workers = cancel.child_token();
    let mut tasks = JoinSet::new();
    for idx in 0..plan.len() {
        let sql = dialect.apply_limit(&plan.partition_query(base, idx), row_limit);
        let connector = Arc::clone(connector);
        let credentials = Arc::clone(credentials);
        let settings = settings.clone();
        let token = workers.clone();
        tasks.spawn(async move {
            let label = format!("partition {idx}");
            let out = query_with_retry(&connector, &credentials, &sql, &settings, &token, &label).await;
            (idx, out)
        });
    }

    let mut chunks: Vec<Option<DataSet>> = vec![None; plan.len()];
    let mut attempts = 0u32;
    while let Some(joined) = tasks.join_next().await {
        let (idx, out) = match joined {
            Ok(v) => v,
            Err(e) => {
                workers.cancel();
                tasks.abort_all();
                return Err(RetryOutcome::Failed {
                    attempts,
                    error: ConnectorError::new(FailureKind::Backend, format!("partition task failed: {e}")),
                });
            }
        };
        match out {
            Ok((chunk, attempt)) => {
                debug!(partition = idx, rows = chunk.row_count(), "partition extracted");
                attempts += attempt;
                chunks[idx] = Some(chunk);
            }
            Err(outcome) => {
                warn!(partition = idx, error = %outcome, "partition failed; cancelling the rest");
                workers.cancel();
                tasks.abort_all();
                return Err(outcome);
            }
        }
    }

    let mut data = DataSet::default();
    for chunk in chunks.into_iter().flatten() {
        data.append(chunk);
    }
    Ok((data, attempts))
}

/// Result of a connection test.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTestOutcome {
    pub success: bool,
    pub connector_type: ConnectorType,
    pub message: String,
    pub server_version: Option<String>,
    pub latency_ms: u64,
    pub table_count: Option<u64>,
    /// One of [`FailureKind::CONNECTION_CODES`], on failure.
    pub error_code: Option<&'static str>,
    pub suggestions: Vec<String>,
}

impl ConnectionTestOutcome {
    fn failed(ty: ConnectorType, kind: FailureKind, detail: &str, latency: Duration) -> Self {
        Self {
            success: false,
            connector_type: ty,
            message: format!("{} ({detail})", kind.summary()),
            server_version: None,
            latency_ms: latency.as_millis() as u64,
            table_count: None,
            error_code: Some(kind.connection_code()),
            suggestions: kind.suggestions().iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Attach, run a trivial round trip, and report what the backend exposes.
///
/// Never fails: every problem becomes an unsuccessful outcome with a classified code.
pub async fn test_connection(
    connector: Arc<dyn DatabaseConnector>,
    credentials: Arc<ConnectorCredentials>,
    settings: &ExtractSettings,
    cancel: &CancellationToken,
) -> ConnectionTestOutcome {
    let ty = connector.connector_type();
    let started = Instant::now();
    if let Err(e) = credentials.validate_for(ty) {
        return ConnectionTestOutcome::failed(ty, FailureKind::ConnectionFailed, &e.message, started.elapsed());
    }

    let out = retry_async(
        |_| {
            let connector = Arc::clone(&connector);
            let credentials = Arc::clone(&credentials);
            async move {
                run_session(connector, credentials, |s| {
                    s.query("SELECT 1")?;
                    let version = s.server_version().unwrap_or(None);
                    let tables = s.table_count().unwrap_or(None);
                    Ok((version, tables))
                })
                .await
            }
        },
        settings.attempt_timeout,
        settings.policy.clone(),
        cancel,
        "connection test",
    )
    .await;

    let latency = started.elapsed();
    match out {
        Ok((server_version, table_count)) => {
            info!(connector = %ty, latency_ms = latency.as_millis() as u64, "connection test succeeded");
            ConnectionTestOutcome {
                success: true,
                connector_type: ty,
                message: format!("Successfully connected to {ty}"),
                server_version,
                latency_ms: latency.as_millis() as u64,
                table_count,
                error_code: None,
                suggestions: Vec::new(),
            }
        }
        Err(outcome) => {
            let attempts = outcome.attempts();
            match outcome.into_inner() {
                Some(e) => {
                    warn!(connector = %ty, attempts, kind = %e.kind, "connection test failed");
                    ConnectionTestOutcome::failed(ty, e.kind, &e.message, latency)
                }
                None => ConnectionTestOutcome::failed(ty, FailureKind::ConnectionFailed, "cancelled", latency),
            }
        }
    }
}
