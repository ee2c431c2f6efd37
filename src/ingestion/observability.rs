use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;

/// Severity classification used for observer callbacks and alerting thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    /// Non-fatal (column-level warnings on a successful conversion).
    Warning,
    /// The request failed for a reason the caller can fix.
    Error,
    /// Backend, timeout or internal failure.
    Critical,
}

/// Severity of a failed request.
pub fn severity_for_error(e: &PipelineError) -> Severity {
    if e.is_infrastructure() {
        Severity::Critical
    } else {
        Severity::Error
    }
}

/// What a conversion attempt was about.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionContext {
    pub request_id: Uuid,
    pub organization_id: String,
    pub source_id: String,
    /// File format or connector type.
    pub source_type: String,
    /// Version number, once one was allocated.
    pub version: Option<u32>,
}

/// Outcome figures of a successful conversion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConversionStats {
    pub rows: usize,
    pub columns: usize,
    pub bytes: u64,
    pub elapsed: Duration,
    pub warnings: usize,
}

/// Hooks for conversion outcomes.
pub trait ConversionObserver: Send + Sync {
    fn on_success(&self, _ctx: &ConversionContext, _stats: &ConversionStats) {}

    fn on_failure(&self, _ctx: &ConversionContext, _severity: Severity, _error: &PipelineError) {}

    /// Called when a failure meets the alert threshold. Defaults to [`Self::on_failure`].
    fn on_alert(&self, ctx: &ConversionContext, severity: Severity, error: &PipelineError) {
        self.on_failure(ctx, severity, error)
    }
}

/// Report `result` to `observer`, raising an alert when the failure is at or above `alert_at`.
pub fn notify(
    observer: &dyn ConversionObserver,
    alert_at: Severity,
    ctx: &ConversionContext,
    result: Result<&ConversionStats, &PipelineError>,
) {
    match result {
        Ok(stats) => observer.on_success(ctx, stats),
        Err(e) => {
            let severity = severity_for_error(e);
            observer.on_failure(ctx, severity, e);
            if severity >= alert_at {
                observer.on_alert(ctx, severity, e);
            }
        }
    }
}

/// Fans out callbacks to a list of observers.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn ConversionObserver>>,
}

impl CompositeObserver {
    pub fn new(observers: Vec<Arc<dyn ConversionObserver>>) -> Self {
        Self { observers }
    }
}

impl fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("observers_len", &self.observers.len())
            .finish()
    }
}

impl ConversionObserver for CompositeObserver {
    fn on_success(&self, ctx: &ConversionContext, stats: &ConversionStats) {
        for o in &self.observers {
            o.on_success(ctx, stats);
        }
    }

    fn on_failure(&self, ctx: &ConversionContext, severity: Severity, error: &PipelineError) {
        for o in &self.observers {
            o.on_failure(ctx, severity, error);
        }
    }

    fn on_alert(&self, ctx: &ConversionContext, severity: Severity, error: &PipelineError) {
        for o in &self.observers {
            o.on_alert(ctx, severity, error);
        }
    }
}

/// Logs conversion outcomes through `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl ConversionObserver for TracingObserver {
    fn on_success(&self, ctx: &ConversionContext, stats: &ConversionStats) {
        info!(
            request_id = %ctx.request_id,
            source_id = %ctx.source_id,
            source_type = %ctx.source_type,
            version = ?ctx.version,
            rows = stats.rows,
            columns = stats.columns,
            bytes = stats.bytes,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            warnings = stats.warnings,
            "conversion succeeded"
        );
    }

    fn on_failure(&self, ctx: &ConversionContext, severity: Severity, error: &PipelineError) {
        warn!(
            request_id = %ctx.request_id,
            source_id = %ctx.source_id,
            source_type = %ctx.source_type,
            version = ?ctx.version,
            ?severity,
            code = error.error_code(),
            error = %error,
            "conversion failed"
        );
    }

    fn on_alert(&self, ctx: &ConversionContext, severity: Severity, error: &PipelineError) {
        error!(
            request_id = %ctx.request_id,
            source_id = %ctx.source_id,
            ?severity,
            code = error.error_code(),
            error = %error,
            "conversion alert"
        );
    }
}

/// Appends one JSON lineage line per conversion attempt to a local file.
#[derive(Debug)]
pub struct FileObserver {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileObserver {
    /// Writes are best-effort; failures to open/write the log file are ignored.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn append(&self, line: serde_json::Value) {
        let _guard = self.lock.lock().ok();
        if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(&self.path) {
            let _ = writeln!(f, "{line}");
        }
    }
}

impl ConversionObserver for FileObserver {
    fn on_success(&self, ctx: &ConversionContext, stats: &ConversionStats) {
        self.append(json!({
            "ts": Utc::now().to_rfc3339(),
            "event": "success",
            "context": ctx,
            "rows": stats.rows,
            "columns": stats.columns,
            "bytes": stats.bytes,
            "elapsed_ms": stats.elapsed.as_millis() as u64,
            "warnings": stats.warnings,
        }));
    }

    fn on_failure(&self, ctx: &ConversionContext, severity: Severity, error: &PipelineError) {
        self.append(json!({
            "ts": Utc::now().to_rfc3339(),
            "event": "failure",
            "context": ctx,
            "severity": severity,
            "code": error.error_code(),
            "message": error.public_message(),
        }));
    }

    fn on_alert(&self, ctx: &ConversionContext, severity: Severity, error: &PipelineError) {
        self.append(json!({
            "ts": Utc::now().to_rfc3339(),
            "event": "alert",
            "context": ctx,
            "severity": severity,
            "code": error.error_code(),
        }));
    }
}
