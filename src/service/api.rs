//! Request and response shapes of the conversion service.
//!
//! These are transport-neutral: an HTTP collaborator deserializes requests into them and
//! serializes the responses back out. Credentials handed in directly are never stored.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connectors::{ConnectionTestOutcome, ConnectorCredentials, ConnectorType, PartitionSpec};
use crate::error::PipelineError;
use crate::inference::{InferenceWarning, SchemaInfo};
use crate::ingestion::{ReadOptions, SheetSelection, SourceFormat};
use crate::output::Compression;
use crate::processing::TransformOptions;
use crate::types::{DataType, Schema};

/// Reader settings shared by file conversion and schema inference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileReadOptions {
    /// WHATWG encoding label, e.g. `latin1`.
    pub encoding: Option<String>,
    /// Single-character delimiter; `\t` and `tab` mean a tab.
    pub delimiter: Option<String>,
    pub sheet_name: Option<String>,
    pub sheet_index: Option<usize>,
}

impl FileReadOptions {
    pub fn to_read_options(&self) -> Result<ReadOptions, PipelineError> {
        let delimiter = self.delimiter.as_deref().map(delimiter_byte).transpose()?;
        if let Some(label) = &self.encoding {
            if encoding_rs::Encoding::for_label(label.as_bytes()).is_none() {
                return Err(PipelineError::Input(format!("unknown encoding '{label}'")));
            }
        }
        Ok(ReadOptions {
            delimiter,
            encoding: self.encoding.clone(),
            sheet: SheetSelection::from_parts(self.sheet_name.as_deref(), self.sheet_index),
        })
    }
}

fn delimiter_byte(raw: &str) -> Result<u8, PipelineError> {
    match raw {
        "\\t" | "tab" | "\t" => Ok(b'\t'),
        s if s.len() == 1 && s.is_ascii() => Ok(s.as_bytes()[0]),
        s => Err(PipelineError::Input(format!(
            "delimiter must be a single ASCII character, got '{s}'"
        ))),
    }
}

/// Convert an uploaded file source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConversionRequest {
    pub source_id: String,
    /// Overrides the format recorded on the source.
    pub format: Option<SourceFormat>,
    /// Name of the uploaded file; its extension is the last resort for format detection.
    pub file_name: Option<String>,
    #[serde(flatten)]
    pub read: FileReadOptions,
    #[serde(flatten)]
    pub transform: TransformOptions,
    pub compression: Option<Compression>,
    pub row_group_size: Option<usize>,
}

impl FileConversionRequest {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Self::default()
        }
    }
}

/// Extract a table or query from a database source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConversionRequest {
    pub source_id: String,
    /// Reference resolved through the credential cache.
    pub credential_ref: String,
    /// Free-form SQL. Mutually exclusive with `table_name`.
    pub query: Option<String>,
    /// Validated against the identifier allow-list.
    pub table_name: Option<String>,
    /// Defaults to the configured `default_row_limit`.
    pub row_limit: Option<usize>,
    pub partition: Option<PartitionSpec>,
    #[serde(flatten)]
    pub transform: TransformOptions,
    pub compression: Option<Compression>,
    pub row_group_size: Option<usize>,
}

impl DatabaseConversionRequest {
    pub fn new(source_id: impl Into<String>, credential_ref: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            credential_ref: credential_ref.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
}

pub(crate) fn column_schema(schema: &Schema) -> Vec<ColumnSchema> {
    schema
        .fields
        .iter()
        .map(|f| ColumnSchema {
            name: f.name.clone(),
            data_type: f.data_type,
        })
        .collect()
}

/// How a database source was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub connector_type: ConnectorType,
    /// Statement executed, row limit included.
    pub query: String,
    /// The unlimited statement recorded as the source's `extraction_query`.
    pub base_query: String,
    pub compression: Compression,
    pub partitions: usize,
    /// Backend calls made, retries included.
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionMetadata {
    pub rows: usize,
    pub columns: usize,
    pub schema: Vec<ColumnSchema>,
    pub file_size_bytes: u64,
    pub processing_time_secs: f64,
    pub source_type: String,
    pub rows_skipped: usize,
    pub warnings: Vec<String>,
    pub connection: Option<ConnectionInfo>,
}

/// Successful conversion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionResponse {
    pub success: bool,
    pub source_id: String,
    pub version: u32,
    pub version_id: Uuid,
    /// Where the output was written.
    pub output: String,
    pub metadata: ConversionMetadata,
}

/// Failure body for any operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error_code: &'static str,
    pub status: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl From<&PipelineError> for ErrorResponse {
    fn from(e: &PipelineError) -> Self {
        Self {
            success: false,
            error_code: e.error_code(),
            status: e.status(),
            message: e.public_message(),
            suggestions: e.suggestions(),
        }
    }
}

/// Infer the schema of a file source without converting it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaInferRequest {
    pub source_id: String,
    pub format: Option<SourceFormat>,
    pub file_name: Option<String>,
    /// Rows sampled from the head of the source; defaults to 1,000.
    pub sample_size: Option<usize>,
    #[serde(flatten)]
    pub read: FileReadOptions,
    /// Columns expected to be free of nulls.
    pub non_nullable: Vec<String>,
}

impl SchemaInferRequest {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaInferResponse {
    pub success: bool,
    pub source_id: String,
    pub format: SourceFormat,
    #[serde(rename = "schema")]
    pub schema_info: SchemaInfo,
    pub sample_data: Vec<serde_json::Map<String, serde_json::Value>>,
    pub warnings: Vec<InferenceWarning>,
}

/// Test connectivity with inline credentials or a credential reference. Inline credentials win.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectionTestRequest {
    pub connector_type: Option<ConnectorType>,
    pub credentials: Option<ConnectorCredentials>,
    pub credential_ref: Option<String>,
}

pub type ConnectionTestResponse = ConnectionTestOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectorCapability {
    pub connector_type: ConnectorType,
    /// Whether this build can reach the backend.
    pub available: bool,
    pub supports_partitioning: bool,
    pub default_port: Option<u16>,
    pub default_ssl_mode: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Limits {
    pub max_file_size_mb: u64,
    pub max_processing_time_secs: u64,
    pub memory_limit_mb: u64,
    pub worker_threads: usize,
    pub default_row_limit: usize,
    pub max_row_limit: usize,
    pub default_row_group_size: usize,
    pub max_partitions: usize,
    pub max_concurrent_conversions: usize,
    pub max_sample_size: usize,
    pub credential_cache_ttl_secs: u64,
}

/// Static description of what this build and configuration support.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub file_formats: Vec<SourceFormat>,
    pub output_format: &'static str,
    pub compressions: Vec<Compression>,
    pub default_compression: Compression,
    pub connectors: Vec<ConnectorCapability>,
    pub limits: Limits,
}
