//! Row skipping, column renames and type overrides, independent of the source format.
//!
//! The steps always run in the same order: skip rows (by zero-based input index), rename columns,
//! then cast overridden columns. Per-value cast failures never abort the run; the value becomes
//! null and one [`CastWarning`] is recorded for that (column, row).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::execution::ExecutionEngine;
use crate::types::{DataSet, DataType, Value};

use super::cast::cast_value;

/// Column transformations requested for one conversion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformOptions {
    /// Source column name to output column name. Unknown source names are ignored.
    pub column_mapping: BTreeMap<String, String>,
    /// Column (new or original name) to target type.
    pub type_overrides: BTreeMap<String, DataType>,
    /// Zero-based input row indices to drop. Out-of-range indices are ignored.
    pub skip_rows: BTreeSet<usize>,
}

impl TransformOptions {
    pub fn is_empty(&self) -> bool {
        self.column_mapping.is_empty() && self.type_overrides.is_empty() && self.skip_rows.is_empty()
    }
}

/// A value that could not be cast to its column's override type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CastWarning {
    /// Output column name.
    pub column: String,
    /// Zero-based index of the row in the input, before skipping.
    pub row: usize,
    pub target: DataType,
    pub reason: String,
}

impl fmt::Display for CastWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "column '{}' row {}: {} (value set to null)",
            self.column, self.row, self.reason
        )
    }
}

/// Result of [`apply_transforms`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutcome {
    pub dataset: DataSet,
    /// Rows actually removed (skip indices inside the input).
    pub rows_skipped: usize,
    pub warnings: Vec<CastWarning>,
}

/// Apply `options` to `dataset` on the calling thread.
pub fn apply_transforms(dataset: DataSet, options: &TransformOptions) -> TransformOutcome {
    let (dataset, input_rows, rows_skipped, casts) = prepare(dataset, options);
    let (rows, warnings) = cast_chunk(&dataset, 0, &dataset.rows, &input_rows, &casts);
    finish(dataset, rows, warnings, rows_skipped, &casts)
}

/// [`apply_transforms`], casting row chunks in parallel on `engine`.
pub fn apply_transforms_with(
    engine: &ExecutionEngine,
    dataset: DataSet,
    options: &TransformOptions,
) -> TransformOutcome {
    let (dataset, input_rows, rows_skipped, casts) = prepare(dataset, options);
    if casts.is_empty() {
        return finish(dataset, None, Vec::new(), rows_skipped, &casts);
    }
    let chunks = engine.fold_chunks("transform", &dataset, |range, rows| {
        cast_chunk(&dataset, range.start, rows, &input_rows, &casts)
    });

    let mut out_rows = Vec::with_capacity(dataset.row_count());
    let mut warnings = Vec::new();
    for (rows, mut chunk_warnings) in chunks {
        out_rows.extend(rows.unwrap_or_default());
        warnings.append(&mut chunk_warnings);
    }
    finish(dataset, Some(out_rows), warnings, rows_skipped, &casts)
}

/// Skip + rename, and resolve which columns need casting. Returns the dataset, each remaining
/// row's input index, the skipped count and `(column index, target type)` casts.
fn prepare(
    mut dataset: DataSet,
    options: &TransformOptions,
) -> (DataSet, Vec<usize>, usize, Vec<(usize, DataType)>) {
    let input_count = dataset.row_count();
    let rows_skipped = options.skip_rows.range(..input_count).count();
    let mut input_rows = Vec::with_capacity(input_count - rows_skipped);
    if rows_skipped > 0 {
        let rows = std::mem::take(&mut dataset.rows);
        dataset.rows = rows
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| !options.skip_rows.contains(idx))
            .map(|(idx, row)| {
                input_rows.push(idx);
                row
            })
            .collect();
    } else {
        input_rows.extend(0..input_count);
    }

    let original_names: Vec<String> = dataset.schema.field_names().map(str::to_string).collect();
    for field in &mut dataset.schema.fields {
        if let Some(new_name) = options.column_mapping.get(&field.name) {
            field.name = new_name.clone();
        }
    }

    let mut casts: Vec<(usize, DataType)> = Vec::new();
    for (name, target) in &options.type_overrides {
        let idx = dataset
            .schema
            .index_of(name)
            .or_else(|| original_names.iter().position(|n| n == name));
        if let Some(idx) = idx {
            if dataset.schema.fields[idx].data_type != *target {
                casts.retain(|(i, _)| *i != idx);
                casts.push((idx, *target));
            }
        }
    }
    casts.sort_by_key(|(idx, _)| *idx);

    (dataset, input_rows, rows_skipped, casts)
}

/// Cast one chunk. Returns `None` rows when there is nothing to cast.
fn cast_chunk(
    dataset: &DataSet,
    offset: usize,
    rows: &[Vec<Value>],
    input_rows: &[usize],
    casts: &[(usize, DataType)],
) -> (Option<Vec<Vec<Value>>>, Vec<CastWarning>) {
    if casts.is_empty() {
        return (None, Vec::new());
    }
    let mut warnings = Vec::new();
    let out = rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut row = row.clone();
            for &(col, target) in casts {
                let Some(cell) = row.get_mut(col) else { continue };
                match cast_value(cell, target) {
                    Ok(v) => *cell = v,
                    Err(reason) => {
                        *cell = Value::Null;
                        warnings.push(CastWarning {
                            column: dataset.schema.fields[col].name.clone(),
                            row: input_rows[offset + i],
                            target,
                            reason,
                        });
                    }
                }
            }
            row
        })
        .collect();
    (Some(out), warnings)
}

fn finish(
    mut dataset: DataSet,
    rows: Option<Vec<Vec<Value>>>,
    warnings: Vec<CastWarning>,
    rows_skipped: usize,
    casts: &[(usize, DataType)],
) -> TransformOutcome {
    if let Some(rows) = rows {
        dataset.rows = rows;
    }
    for &(col, target) in casts {
        dataset.schema.fields[col].data_type = target;
    }
    TransformOutcome {
        dataset,
        rows_skipped,
        warnings,
    }
}
