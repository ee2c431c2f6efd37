//! In-memory dataset transformations.
//!
//! The transformation engine works on an already-read [`crate::types::DataSet`], so file and
//! database sources share one implementation:
//!
//! ```rust
//! use tabular_convert::processing::{apply_transforms, TransformOptions};
//! use tabular_convert::types::{DataSet, DataType, Field, Schema, Value};
//!
//! let ds = DataSet::new(
//!     Schema::new(vec![Field::new("qty", DataType::Utf8)]),
//!     vec![
//!         vec![Value::Utf8("header junk".into())],
//!         vec![Value::Utf8("3".into())],
//!         vec![Value::Utf8("three".into())],
//!     ],
//! );
//! let mut opts = TransformOptions::default();
//! opts.skip_rows.insert(0);
//! opts.column_mapping.insert("qty".into(), "quantity".into());
//! opts.type_overrides.insert("quantity".into(), DataType::Int64);
//!
//! let out = apply_transforms(ds, &opts);
//! assert_eq!(out.rows_skipped, 1);
//! assert_eq!(out.dataset.rows[0][0], Value::Int64(3));
//! assert_eq!(out.dataset.rows[1][0], Value::Null);
//! assert_eq!(out.warnings.len(), 1);
//! ```

pub mod cast;
pub mod transform;

pub use cast::cast_value;
pub use transform::{CastWarning, TransformOptions, TransformOutcome, apply_transforms, apply_transforms_with};
