//! `tabular-convert` turns tabular sources into versioned Parquet outputs.
//!
//! Sources are delimited files, spreadsheets, JSON documents, Parquet files and live database
//! tables or queries. Every conversion is recorded as a version of a named source that moves from
//! `pending` to `active` or `error`, and only `active` versions are ever published as the source's
//! current version.
//!
//! The primary entrypoint is [`service::Converter`], which ties the other modules together. The
//! pieces are usable on their own as well.
//!
//! ## What you can convert
//!
//! **File formats** (resolved from the request, the source record, or the file extension):
//!
//! - **CSV/TSV**: `.csv`, `.tsv`, `.tab` with any delimiter and WHATWG encoding
//! - **JSON**: `.json`, `.ndjson`, `.jsonl` (array-of-objects, single object or NDJSON); nested
//!   objects flatten to dot paths such as `user.name`
//! - **GeoJSON**: `.geojson` feature collections
//! - **Parquet**: `.parquet`, `.pq`
//! - **Excel/workbooks** (Cargo feature `excel`): `.xlsx`, `.xls`, `.xlsm`, `.xlsb`, `.ods`
//!
//! **Databases**: SQLite (default feature `sqlite`), plus PostgreSQL, Redshift, MySQL, MariaDB and
//! SQL Server through ConnectorX (Cargo feature `db_connectorx`).
//!
//! ## Quick example: convert a file
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tabular_convert::config::ServiceConfig;
//! use tabular_convert::service::{Converter, FileConversionRequest};
//! use tabular_convert::versioning::{InMemoryStore, Source, SourceKind};
//!
//! # async fn run() -> Result<(), tabular_convert::PipelineError> {
//! let store = Arc::new(InMemoryStore::new());
//! store.register_source(Source::new("orders", "acme", SourceKind::File, "csv"));
//!
//! let converter = Converter::builder(ServiceConfig::default()).store(store).build()?;
//! // Reads data/org-acme/uploads/orders/*.csv, writes data/org-acme/processed/orders/v1/data.parquet
//! let done = converter.convert_file(FileConversionRequest::new("orders")).await?;
//! println!("v{} rows={}", done.version, done.metadata.rows);
//! # Ok(())
//! # }
//! ```
//!
//! ## Schema inference
//!
//! Inference runs over a bounded head sample and reports one descriptor per column:
//!
//! ```rust
//! use tabular_convert::inference::{infer_schema, InferenceOptions, SemanticFormat};
//! use tabular_convert::types::{DataSet, DataType, Field, Schema, Value};
//!
//! let ds = DataSet::new(
//!     Schema::new(vec![Field::new("email", DataType::Utf8)]),
//!     vec![
//!         vec![Value::Utf8("ada@example.com".into())],
//!         vec![Value::Null],
//!         vec![Value::Utf8("grace@example.org".into())],
//!     ],
//! );
//! let report = infer_schema(&ds, &InferenceOptions::default());
//! let email = &report.schema_info.columns[0];
//! assert_eq!(email.null_count, 1);
//! assert!(email.nullable);
//! assert_eq!(email.detected_format, Some(SemanticFormat::Email));
//! ```
//!
//! ## Modules
//!
//! - [`service`]: request/response shapes and the [`service::Converter`]
//! - [`ingestion`]: locating and reading sources, conversion observers
//! - [`inference`]: type/format detection and schema inference
//! - [`processing`]: row skipping, renames and type overrides
//! - [`connectors`]: database backends, credentials, partitioned extraction
//! - [`retry`]: bounded exponential backoff
//! - [`versioning`]: source/version records and the version state machine
//! - [`output`]: Parquet encoding and output targets
//! - [`execution`]: the worker pool for CPU-bound work
//! - [`config`], [`error`], [`types`]

pub mod config;
pub mod connectors;
pub mod error;
pub mod execution;
pub mod inference;
pub mod ingestion;
pub mod output;
pub mod processing;
pub mod retry;
pub mod service;
pub mod types;
pub mod versioning;

pub use error::{IngestionError, IngestionResult, PipelineError, PipelineResult};
