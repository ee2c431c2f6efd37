use std::time::Duration;

use thiserror::Error;

use crate::connectors::{ConnectorError, CredentialError, FailureKind};
use crate::output::OutputError;
use crate::retry::RetryOutcome;
use crate::versioning::StoreError;

/// Convenience result type for reader operations.
pub type IngestionResult<T> = Result<T, IngestionError>;

/// Convenience result type for request-level operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Error type returned by source readers.
///
/// This is a single error enum shared across CSV/JSON/Parquet (and optional Excel) reading, plus
/// source location resolution.
#[derive(Debug, Error)]
pub enum IngestionError {
    /// Underlying I/O error (e.g. file not found, permission denied).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "excel")]
    /// Excel reading error (feature-gated behind `excel`).
    #[error("excel error: {0}")]
    Excel(#[from] calamine::Error),

    /// CSV reading error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// Parquet reading error.
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Object-store listing/download error for remote sources.
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// The input does not have the shape the reader expects (no header, not an object, ...).
    #[error("schema mismatch: {message}")]
    SchemaMismatch { message: String },

    /// A record could not be decoded at all.
    #[error("failed to parse record {row}: {message}")]
    ParseError { row: usize, message: String },

    /// No source file could be located.
    #[error("source not found: {message}")]
    NotFound { message: String },

    /// The source exceeds the configured size ceiling.
    #[error("source is {size_mb:.1} MB which exceeds the {limit_mb} MB limit")]
    TooLarge { size_mb: f64, limit_mb: u64 },

    /// The format is unknown, or known but not compiled in.
    #[error("unsupported format: {message}")]
    Unsupported { message: String },
}

/// Request-level error taxonomy.
///
/// Every failure a conversion, inference or connection test can end in is one of these, each with
/// a stable [`error_code`](Self::error_code) and an HTTP-like [`status`](Self::status).
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed request or unsupported input. Never retried.
    #[error("invalid input: {0}")]
    Input(String),

    /// Credential store (or filesystem) refused access.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Unknown source, credential reference, file or table.
    #[error("not found: {0}")]
    NotFound(String),

    /// Another conversion of the same source is still pending.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A classified backend failure, surfaced after retries.
    #[error("{kind} after {attempts} attempt(s): {message}")]
    Upstream {
        kind: FailureKind,
        message: String,
        attempts: u32,
    },

    /// The processing-time ceiling was exceeded.
    #[error("conversion exceeded the {}s processing time limit", .after.as_secs())]
    Timeout { after: Duration },

    /// Unexpected failure in the pipeline itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Stable machine-readable code.
    pub fn error_code(&self) -> &'static str {
        match self {
            PipelineError::Input(_) => "invalid_input",
            PipelineError::PermissionDenied(_) => "permission_denied",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Conflict(_) => "conversion_in_progress",
            PipelineError::Upstream { kind, .. } => kind.code(),
            PipelineError::Timeout { .. } => "processing_timeout",
            PipelineError::Internal(_) => "internal_error",
        }
    }

    /// HTTP-like status an HTTP collaborator would answer with.
    pub fn status(&self) -> u16 {
        match self {
            PipelineError::Input(_) => 400,
            PipelineError::PermissionDenied(_) => 403,
            PipelineError::NotFound(_) => 404,
            PipelineError::Conflict(_) => 409,
            PipelineError::Upstream { .. } => 502,
            PipelineError::Timeout { .. } => 504,
            PipelineError::Internal(_) => 500,
        }
    }

    /// Message safe to show to callers. Internal details are withheld.
    pub fn public_message(&self) -> String {
        match self {
            PipelineError::Internal(_) => "an internal error occurred while processing the request".to_string(),
            other => other.to_string(),
        }
    }

    /// Remediation hints for backend failures.
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            PipelineError::Upstream { kind, .. } => {
                kind.suggestions().iter().map(|s| s.to_string()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Whether this class of failure points at infrastructure rather than the request.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            PipelineError::Upstream { .. } | PipelineError::Timeout { .. } | PipelineError::Internal(_)
        )
    }
}

impl From<IngestionError> for PipelineError {
    fn from(e: IngestionError) -> Self {
        match e {
            IngestionError::Io(ref io) => match io.kind() {
                std::io::ErrorKind::NotFound => PipelineError::NotFound(e.to_string()),
                std::io::ErrorKind::PermissionDenied => PipelineError::PermissionDenied(e.to_string()),
                _ => PipelineError::Internal(e.to_string()),
            },
            IngestionError::ObjectStore(ref os) => match os {
                object_store::Error::NotFound { .. } => PipelineError::NotFound(e.to_string()),
                object_store::Error::PermissionDenied { .. }
                | object_store::Error::Unauthenticated { .. } => {
                    PipelineError::PermissionDenied(e.to_string())
                }
                _ => PipelineError::Upstream {
                    kind: FailureKind::ConnectionFailed,
                    message: e.to_string(),
                    attempts: 1,
                },
            },
            IngestionError::NotFound { .. } => PipelineError::NotFound(e.to_string()),
            other => PipelineError::Input(other.to_string()),
        }
    }
}

impl From<ConnectorError> for PipelineError {
    fn from(e: ConnectorError) -> Self {
        PipelineError::from_connector(e, 1)
    }
}

impl PipelineError {
    /// Map a classified backend failure after `attempts` tries.
    pub fn from_connector(e: ConnectorError, attempts: u32) -> Self {
        match e.kind {
            FailureKind::MalformedQuery | FailureKind::Unsupported => PipelineError::Input(e.to_string()),
            FailureKind::UnknownTable => PipelineError::NotFound(e.to_string()),
            kind => PipelineError::Upstream {
                kind,
                message: e.message,
                attempts,
            },
        }
    }
}

impl From<RetryOutcome<ConnectorError>> for PipelineError {
    fn from(outcome: RetryOutcome<ConnectorError>) -> Self {
        let attempts = outcome.attempts();
        match outcome.into_inner() {
            Some(e) => PipelineError::from_connector(e, attempts),
            None => PipelineError::Internal("operation cancelled".to_string()),
        }
    }
}

impl From<CredentialError> for PipelineError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::NotFound(_) => PipelineError::NotFound(e.to_string()),
            CredentialError::PermissionDenied(_) => PipelineError::PermissionDenied(e.to_string()),
            CredentialError::Unavailable(_) => PipelineError::Upstream {
                kind: FailureKind::ConnectionFailed,
                message: e.to_string(),
                attempts: 1,
            },
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SourceNotFound(_) | StoreError::VersionNotFound(_) => {
                PipelineError::NotFound(e.to_string())
            }
            StoreError::PendingExists { .. } => PipelineError::Conflict(e.to_string()),
            other => PipelineError::Internal(other.to_string()),
        }
    }
}

impl From<OutputError> for PipelineError {
    fn from(e: OutputError) -> Self {
        match e {
            OutputError::InvalidLocation(_) | OutputError::UnknownCompression(_) => PipelineError::Input(e.to_string()),
            other => PipelineError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(PipelineError::Input("x".into()).status(), 400);
        assert_eq!(PipelineError::Conflict("x".into()).status(), 409);
        let upstream = PipelineError::Upstream {
            kind: FailureKind::ConnectionRefused,
            message: "refused".into(),
            attempts: 3,
        };
        assert_eq!(upstream.status(), 502);
        assert_eq!(upstream.error_code(), "connection_refused");
        assert!(!upstream.suggestions().is_empty());
        assert_eq!(PipelineError::Timeout { after: Duration::from_secs(1) }.status(), 504);
    }

    #[test]
    fn internal_errors_are_not_leaked() {
        let e = PipelineError::Internal("secret stack detail".into());
        assert!(!e.public_message().contains("secret"));
    }

    #[test]
    fn missing_file_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let e: PipelineError = IngestionError::Io(io).into();
        assert_eq!(e.status(), 404);
    }

    #[test]
    fn malformed_query_is_an_input_error() {
        let e: PipelineError = ConnectorError::new(FailureKind::MalformedQuery, "syntax error").into();
        assert_eq!(e.error_code(), "invalid_input");
    }
}
