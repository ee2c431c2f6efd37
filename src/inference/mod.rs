//! Type and format detection plus schema inference.
//!
//! - [`detect`]: pure per-value parsing and per-column type/format decisions.
//! - [`schema`]: drives detection over a bounded head sample and produces
//!   [`ColumnDescriptor`]s, totals, a preview and data-quality warnings.
//!
//! ```
//! use tabular_convert::inference::{infer_schema, InferenceOptions};
//! use tabular_convert::types::{DataSet, DataType, Field, Schema, Value};
//!
//! let ds = DataSet::new(
//!     Schema::new(vec![Field::new("id", DataType::Utf8)]),
//!     vec![vec![Value::Utf8("1".into())], vec![Value::Utf8("2".into())]],
//! );
//! let report = infer_schema(&ds, &InferenceOptions::default());
//! assert_eq!(report.schema_info.columns[0].data_type, DataType::Int64);
//! ```

pub mod detect;
pub mod schema;

pub use detect::{SemanticFormat, detect_format, detect_type};
pub use schema::{
    ColumnDescriptor, DEFAULT_SAMPLE_SIZE, InferenceOptions, InferenceReport, InferenceWarning, IssueKind,
    MAX_SAMPLE_SIZE, SchemaInfo, infer_schema, infer_schema_with, refine_types, refine_types_with,
};
