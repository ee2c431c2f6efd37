//! Schema inference over the head of a dataset.

use std::collections::HashSet;

use serde::Serialize;

use crate::execution::ExecutionEngine;
use crate::types::{DataSet, DataType, Value};

use super::detect::{self, SemanticFormat, TypeCandidate};

pub const DEFAULT_SAMPLE_SIZE: usize = 1_000;
pub const MAX_SAMPLE_SIZE: usize = 10_000;
/// Representative values reported per column.
pub const SAMPLE_VALUES_PER_COLUMN: usize = 5;
/// Rows included in the sample-data preview.
pub const PREVIEW_ROWS: usize = 100;
/// Row indices listed per warning.
pub const MAX_AFFECTED_ROWS: usize = 10;

/// Controls a schema inference run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceOptions {
    /// Rows taken from the head of the source, 1..=10,000.
    pub sample_size: usize,
    /// Whether text columns are re-typed by the detector (text-bearing formats) or kept as stored.
    pub refine_text: bool,
    /// Columns the caller declares non-nullable; nulls in them produce a `null_values` warning.
    pub non_nullable: Vec<String>,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            sample_size: DEFAULT_SAMPLE_SIZE,
            refine_text: true,
            non_nullable: Vec::new(),
        }
    }
}

impl InferenceOptions {
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_size == 0 || self.sample_size > MAX_SAMPLE_SIZE {
            return Err(format!(
                "sample_size must be between 1 and {MAX_SAMPLE_SIZE}, got {}",
                self.sample_size
            ));
        }
        Ok(())
    }
}

/// Everything inference learned about one column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    #[serde(rename = "inferred_type")]
    pub data_type: DataType,
    pub detected_format: Option<SemanticFormat>,
    pub nullable: bool,
    pub null_count: usize,
    /// Distinct non-null values within the sample.
    pub unique_count: usize,
    pub sample_values: Vec<Value>,
    pub min_value: Option<Value>,
    pub max_value: Option<Value>,
}

/// Kind of data-quality issue found during inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    TypeInconsistency,
    NullValues,
    HighNullPercentage,
}

/// A data-quality warning attached to one column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceWarning {
    pub column: String,
    pub issue: IssueKind,
    pub message: String,
    /// Zero-based sample row indices responsible, when meaningful.
    pub affected_rows: Vec<usize>,
}

/// Aggregate shape of the sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaInfo {
    pub columns: Vec<ColumnDescriptor>,
    pub total_rows: usize,
    pub total_columns: usize,
    pub file_size_bytes: Option<u64>,
}

/// Result of one inference run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceReport {
    #[serde(rename = "schema")]
    pub schema_info: SchemaInfo,
    /// Up to [`PREVIEW_ROWS`] rows as column name to value.
    pub sample_data: Vec<serde_json::Map<String, serde_json::Value>>,
    pub warnings: Vec<InferenceWarning>,
}

/// Infer a schema from the first `options.sample_size` rows of `dataset`.
pub fn infer_schema(dataset: &DataSet, options: &InferenceOptions) -> InferenceReport {
    let sample_rows = options.sample_size.min(dataset.row_count());
    let analyzed = (0..dataset.column_count())
        .map(|idx| analyze_column(dataset, idx, sample_rows, options))
        .collect();
    assemble(dataset, sample_rows, analyzed)
}

/// [`infer_schema`], analyzing columns in parallel on `engine`.
pub fn infer_schema_with(
    engine: &ExecutionEngine,
    dataset: &DataSet,
    options: &InferenceOptions,
) -> InferenceReport {
    let sample_rows = options.sample_size.min(dataset.row_count());
    let analyzed = engine.map_columns("infer_schema", dataset, |idx| {
        analyze_column(dataset, idx, sample_rows, options)
    });
    assemble(dataset, sample_rows, analyzed)
}

fn assemble(
    dataset: &DataSet,
    sample_rows: usize,
    analyzed: Vec<(ColumnDescriptor, Vec<InferenceWarning>)>,
) -> InferenceReport {
    let mut columns = Vec::with_capacity(analyzed.len());
    let mut warnings = Vec::new();
    for (descriptor, mut column_warnings) in analyzed {
        columns.push(descriptor);
        warnings.append(&mut column_warnings);
    }

    let sample_data = dataset.rows[..sample_rows.min(PREVIEW_ROWS)]
        .iter()
        .map(|row| {
            columns
                .iter()
                .enumerate()
                .map(|(idx, col)| {
                    let value = row.get(idx).cloned().unwrap_or(Value::Null);
                    let typed = typed_value(&value, col.data_type);
                    let json = serde_json::to_value(&typed).unwrap_or(serde_json::Value::Null);
                    (col.name.clone(), json)
                })
                .collect()
        })
        .collect();

    InferenceReport {
        schema_info: SchemaInfo {
            total_columns: columns.len(),
            columns,
            total_rows: sample_rows,
            file_size_bytes: None,
        },
        sample_data,
        warnings,
    }
}

/// Convert a stored value to the column's inferred type. Only text is ever re-typed, and blank
/// text counts as null whatever the type.
fn typed_value(value: &Value, data_type: DataType) -> Value {
    match value {
        Value::Utf8(s) if s.trim().is_empty() => Value::Null,
        Value::Utf8(s) if data_type != DataType::Utf8 => {
            detect::parse_as(s, data_type).unwrap_or(Value::Null)
        }
        other => other.clone(),
    }
}

fn analyze_column(
    dataset: &DataSet,
    idx: usize,
    sample_rows: usize,
    options: &InferenceOptions,
) -> (ColumnDescriptor, Vec<InferenceWarning>) {
    let field = &dataset.schema.fields[idx];
    let name = field.name.clone();
    let values: Vec<&Value> = dataset.column(idx).take(sample_rows).collect();
    let mut warnings = Vec::new();

    let mut data_type = field.data_type;
    let mut candidate = TypeCandidate::new();
    let refine = options.refine_text && field.data_type == DataType::Utf8;
    if refine {
        for v in &values {
            if let Value::Utf8(s) = v {
                candidate.update(s);
            }
        }
        data_type = candidate.decide();
    }

    let typed: Vec<Value> = values.iter().map(|v| typed_value(v, data_type)).collect();
    let null_rows: Vec<usize> = typed
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_null())
        .map(|(i, _)| i)
        .collect();
    let null_count = null_rows.len();
    let non_null: Vec<&Value> = typed.iter().filter(|v| !v.is_null()).collect();

    let unique_count = non_null
        .iter()
        .filter_map(|v| v.as_text())
        .collect::<HashSet<_>>()
        .len();
    let sample_values = non_null
        .iter()
        .take(SAMPLE_VALUES_PER_COLUMN)
        .map(|v| (*v).clone())
        .collect();

    let (min_value, max_value) = if data_type.is_orderable() {
        min_max(&non_null)
    } else {
        (None, None)
    };

    let detected_format = if data_type == DataType::Utf8 {
        let texts: Vec<String> = non_null
            .iter()
            .filter_map(|v| v.as_text().map(|t| t.into_owned()))
            .collect();
        detect::detect_format(texts.iter().map(String::as_str))
    } else {
        None
    };

    if refine && data_type == DataType::Utf8 {
        if let Some(majority) = candidate.majority_numeric_or_temporal() {
            let offending: Vec<usize> = values
                .iter()
                .enumerate()
                .filter_map(|(i, v)| match v {
                    Value::Utf8(s) if detect::parse_as(s, majority).is_none() => Some(i),
                    _ => None,
                })
                .take(MAX_AFFECTED_ROWS)
                .collect();
            warnings.push(InferenceWarning {
                column: name.clone(),
                issue: IssueKind::TypeInconsistency,
                message: format!("Column looks {majority} but contains non-{majority} values"),
                affected_rows: offending,
            });
        }
    }

    let total = values.len();
    if total > 0 && null_count * 2 > total {
        warnings.push(InferenceWarning {
            column: name.clone(),
            issue: IssueKind::HighNullPercentage,
            message: format!(
                "Column has {:.1}% null values",
                null_count as f64 * 100.0 / total as f64
            ),
            affected_rows: Vec::new(),
        });
    }

    if null_count > 0 && options.non_nullable.iter().any(|c| c == &name) {
        warnings.push(InferenceWarning {
            column: name.clone(),
            issue: IssueKind::NullValues,
            message: format!("Column is declared non-nullable but has {null_count} null values"),
            affected_rows: null_rows.iter().copied().take(MAX_AFFECTED_ROWS).collect(),
        });
    }

    let descriptor = ColumnDescriptor {
        name,
        data_type,
        detected_format,
        nullable: null_count > 0 || non_null.is_empty(),
        null_count,
        unique_count,
        sample_values,
        min_value,
        max_value,
    };
    (descriptor, warnings)
}

fn min_max(values: &[&Value]) -> (Option<Value>, Option<Value>) {
    let mut min: Option<&Value> = None;
    let mut max: Option<&Value> = None;
    for &v in values {
        if min.is_none_or(|m| v.partial_cmp_same_type(m).is_some_and(|o| o.is_lt())) {
            min = Some(v);
        }
        if max.is_none_or(|m| v.partial_cmp_same_type(m).is_some_and(|o| o.is_gt())) {
            max = Some(v);
        }
    }
    (min.cloned(), max.cloned())
}

/// Re-type every text column of `dataset` to the strictest type all its values parse as.
///
/// Used on text-bearing sources (CSV, JSON strings, spreadsheet text) before transformation.
/// Columns whose values already carry types are left alone.
pub fn refine_types(dataset: &mut DataSet) {
    let decided: Vec<DataType> = (0..dataset.column_count())
        .map(|idx| decide_text_column(dataset, idx))
        .collect();
    apply_types(dataset, &decided);
}

/// [`refine_types`], detecting column types in parallel on `engine`.
pub fn refine_types_with(engine: &ExecutionEngine, dataset: &mut DataSet) {
    let view: &DataSet = dataset;
    let decided = engine.map_columns("refine_types", view, |idx| decide_text_column(view, idx));
    apply_types(dataset, &decided);
}

fn decide_text_column(dataset: &DataSet, idx: usize) -> DataType {
    let field_type = dataset.schema.fields[idx].data_type;
    if field_type != DataType::Utf8 {
        return field_type;
    }
    let mut candidate = TypeCandidate::new();
    for v in dataset.column(idx) {
        if let Value::Utf8(s) = v {
            candidate.update(s);
        }
    }
    candidate.decide()
}

fn apply_types(dataset: &mut DataSet, decided: &[DataType]) {
    let changed: Vec<(usize, DataType)> = decided
        .iter()
        .enumerate()
        .filter(|(idx, t)| dataset.schema.fields[*idx].data_type != **t)
        .map(|(idx, t)| (idx, *t))
        .collect();
    if changed.is_empty() {
        return;
    }
    for row in &mut dataset.rows {
        for &(idx, data_type) in &changed {
            if let Some(cell) = row.get_mut(idx) {
                *cell = typed_value(cell, data_type);
            }
        }
    }
    for (idx, data_type) in changed {
        dataset.schema.fields[idx].data_type = data_type;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Field, Schema};

    fn text_dataset(columns: &[&str], rows: Vec<Vec<Option<&str>>>) -> DataSet {
        let schema = Schema::new(columns.iter().map(|c| Field::new(*c, DataType::Utf8)).collect());
        let rows = rows
            .into_iter()
            .map(|r| {
                r.into_iter()
                    .map(|v| v.map_or(Value::Null, |s| Value::Utf8(s.to_string())))
                    .collect()
            })
            .collect();
        DataSet::new(schema, rows)
    }

    #[test]
    fn email_column_with_blanks() {
        let rows = (0..1_000)
            .map(|i| {
                if i % 20 == 7 {
                    vec![None]
                } else {
                    vec![Some("user@example.com")]
                }
            })
            .collect();
        let ds = text_dataset(&["email"], rows);

        let report = infer_schema(&ds, &InferenceOptions::default());
        let col = &report.schema_info.columns[0];
        assert_eq!(col.data_type, DataType::Utf8);
        assert!(col.nullable);
        assert_eq!(col.null_count, 50);
        assert_eq!(col.detected_format, Some(SemanticFormat::Email));
        assert_eq!(report.schema_info.total_rows, 1_000);
    }

    #[test]
    fn numeric_columns_get_min_max_and_samples() {
        let ds = text_dataset(
            &["n"],
            vec![vec![Some("5")], vec![Some("-2")], vec![Some("40")], vec![None], vec![Some("5")]],
        );
        let report = infer_schema(&ds, &InferenceOptions::default());
        let col = &report.schema_info.columns[0];
        assert_eq!(col.data_type, DataType::Int64);
        assert_eq!(col.min_value, Some(Value::Int64(-2)));
        assert_eq!(col.max_value, Some(Value::Int64(40)));
        assert_eq!(col.unique_count, 3);
        assert_eq!(col.sample_values.len(), 4);
        assert_eq!(report.sample_data[1]["n"], serde_json::json!(-2));
    }

    #[test]
    fn sample_size_bounds_the_rows_read() {
        let rows = (0..50).map(|_| vec![Some("x")]).collect();
        let ds = text_dataset(&["c"], rows);
        let opts = InferenceOptions {
            sample_size: 10,
            ..Default::default()
        };
        let report = infer_schema(&ds, &opts);
        assert_eq!(report.schema_info.total_rows, 10);
        assert_eq!(report.sample_data.len(), 10);
        assert!(InferenceOptions { sample_size: 0, ..Default::default() }.validate().is_err());
        assert!(InferenceOptions { sample_size: 10_001, ..Default::default() }.validate().is_err());
    }

    #[test]
    fn mostly_numeric_text_column_warns_with_rows() {
        let ds = text_dataset(
            &["amount"],
            vec![vec![Some("1")], vec![Some("2")], vec![Some("oops")], vec![Some("4")]],
        );
        let report = infer_schema(&ds, &InferenceOptions::default());
        assert_eq!(report.schema_info.columns[0].data_type, DataType::Utf8);
        let w = &report.warnings[0];
        assert_eq!(w.issue, IssueKind::TypeInconsistency);
        assert_eq!(w.affected_rows, vec![2]);
    }

    #[test]
    fn null_warnings() {
        let ds = text_dataset(
            &["id", "note"],
            vec![
                vec![Some("1"), None],
                vec![None, None],
                vec![Some("3"), Some("hi")],
            ],
        );
        let opts = InferenceOptions {
            non_nullable: vec!["id".to_string()],
            ..Default::default()
        };
        let report = infer_schema(&ds, &opts);
        let kinds: Vec<(&str, IssueKind)> = report
            .warnings
            .iter()
            .map(|w| (w.column.as_str(), w.issue))
            .collect();
        assert!(kinds.contains(&("id", IssueKind::NullValues)));
        assert!(kinds.contains(&("note", IssueKind::HighNullPercentage)));
        let null_warning = report.warnings.iter().find(|w| w.issue == IssueKind::NullValues).unwrap();
        assert_eq!(null_warning.affected_rows, vec![1]);
    }

    #[test]
    fn all_null_column_is_nullable_string() {
        let ds = text_dataset(&["empty"], vec![vec![None], vec![None]]);
        let report = infer_schema(&ds, &InferenceOptions::default());
        let col = &report.schema_info.columns[0];
        assert_eq!(col.data_type, DataType::Utf8);
        assert!(col.nullable);
        assert_eq!(col.detected_format, None);
    }

    #[test]
    fn blank_text_counts_as_null_in_text_columns() {
        let ds = text_dataset(
            &["note"],
            vec![vec![Some("hello")], vec![Some("   ")], vec![Some("\t")], vec![Some("bye")]],
        );
        let report = infer_schema(&ds, &InferenceOptions::default());
        let col = &report.schema_info.columns[0];
        assert_eq!(col.data_type, DataType::Utf8);
        assert_eq!(col.null_count, 2);
        assert!(col.nullable);
        assert_eq!(col.unique_count, 2);
        assert_eq!(report.sample_data[1]["note"], serde_json::Value::Null);
    }

    #[test]
    fn inference_is_deterministic_and_matches_parallel_run() {
        let ds = text_dataset(
            &["a", "b", "c"],
            (0..300)
                .map(|i| {
                    vec![
                        Some(if i % 2 == 0 { "yes" } else { "no" }),
                        Some("2024-02-03"),
                        if i % 3 == 0 { None } else { Some("https://x.io") },
                    ]
                })
                .collect(),
        );
        let opts = InferenceOptions::default();
        let first = infer_schema(&ds, &opts);
        assert_eq!(first, infer_schema(&ds, &opts));
        let engine = ExecutionEngine::new(crate::execution::ExecutionOptions::with_threads(Some(3)));
        assert_eq!(first, infer_schema_with(&engine, &ds, &opts));
    }

    #[test]
    fn refine_types_converts_text_columns_in_place() {
        let mut ds = text_dataset(
            &["id", "name", "when"],
            vec![
                vec![Some("1"), Some("a"), Some("2024-01-01")],
                vec![Some("2"), None, Some("2024-01-02")],
            ],
        );
        refine_types(&mut ds);
        assert_eq!(ds.schema.fields[0].data_type, DataType::Int64);
        assert_eq!(ds.schema.fields[1].data_type, DataType::Utf8);
        assert_eq!(ds.schema.fields[2].data_type, DataType::Date);
        assert_eq!(ds.rows[1][0], Value::Int64(2));
        assert_eq!(ds.rows[1][1], Value::Null);
    }
}
