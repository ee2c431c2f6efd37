//! Partition planning for parallel extraction.
//!
//! A plan splits the integer range `[min, max]` of a partition column into contiguous intervals
//! `[lower, upper)`, the last one closed at `max`. Rows with a NULL key go to the first partition.
//! Anything that cannot be split (no column, a count of 1, a backend without range support, a
//! non-integer or empty range) degenerates to one unbounded partition.

use serde::{Deserialize, Serialize};

use crate::types::{DataSet, Value};

use super::{ConnectorError, validate_identifier};

/// Requested partitioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub column: String,
    pub count: usize,
}

/// Key range of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionBounds {
    /// The whole input.
    Unbounded,
    Range {
        lower: i64,
        upper: i64,
        /// Only the last partition includes `upper`.
        upper_inclusive: bool,
        /// Whether NULL keys belong here.
        include_nulls: bool,
    },
}

impl PartitionBounds {
    /// Whether `key` falls in this partition.
    pub fn contains(&self, key: Option<i64>) -> bool {
        match (*self, key) {
            (PartitionBounds::Unbounded, _) => true,
            (PartitionBounds::Range { include_nulls, .. }, None) => include_nulls,
            (
                PartitionBounds::Range {
                    lower,
                    upper,
                    upper_inclusive,
                    ..
                },
                Some(k),
            ) => k >= lower && (k < upper || (upper_inclusive && k == upper)),
        }
    }
}

/// Ordered, disjoint partitions over one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionPlan {
    pub column: Option<String>,
    pub partitions: Vec<PartitionBounds>,
}

impl PartitionPlan {
    pub fn single() -> Self {
        Self {
            column: None,
            partitions: vec![PartitionBounds::Unbounded],
        }
    }

    /// Split `[min, max]` into `requested` intervals of near-equal width.
    ///
    /// Widths differ by at most one key, wider intervals first. The count is capped by the
    /// number of distinct integers in the range.
    pub fn split(column: &str, min: i64, max: i64, requested: usize) -> Self {
        if requested <= 1 || min > max {
            return Self::single();
        }
        let span = i128::from(max) - i128::from(min) + 1;
        let count = (requested as i128).min(span);
        let (width, wider) = (span / count, span % count);

        let mut partitions = Vec::with_capacity(count as usize);
        let mut lower = i128::from(min);
        for idx in 0..count {
            let last = idx == count - 1;
            let next = lower + width + i128::from(idx < wider);
            // lower and the bounds below stay within [min, max], so they fit back in i64.
            let upper = if last { i128::from(max) } else { next };
            partitions.push(PartitionBounds::Range {
                lower: lower as i64,
                upper: upper as i64,
                upper_inclusive: last,
                include_nulls: idx == 0,
            });
            lower = next;
        }
        Self {
            column: Some(column.to_string()),
            partitions,
        }
    }

    /// Build a plan from the result of [`bounds_query`].
    pub fn from_bounds(column: &str, bounds: &DataSet, requested: usize) -> Self {
        let row = bounds.rows.first();
        let lo = row.and_then(|r| r.first()).and_then(integer_key);
        let hi = row.and_then(|r| r.get(1)).and_then(integer_key);
        match (lo, hi) {
            (Some(lo), Some(hi)) => Self::split(column, lo, hi, requested),
            _ => Self::single(),
        }
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn is_single(&self) -> bool {
        self.partitions.len() <= 1
    }

    /// The statement extracting partition `idx` of `base_sql`.
    pub fn partition_query(&self, base_sql: &str, idx: usize) -> String {
        let (Some(column), Some(bounds)) = (self.column.as_deref(), self.partitions.get(idx)) else {
            return base_sql.to_string();
        };
        match *bounds {
            PartitionBounds::Unbounded => base_sql.to_string(),
            PartitionBounds::Range {
                lower,
                upper,
                upper_inclusive,
                include_nulls,
            } => {
                let op = if upper_inclusive { "<=" } else { "<" };
                let mut predicate = format!("{column} >= {lower} AND {column} {op} {upper}");
                if include_nulls {
                    predicate = format!("({predicate}) OR {column} IS NULL");
                }
                format!("SELECT * FROM ({base_sql}) AS _part WHERE {predicate}")
            }
        }
    }
}

/// Statement discovering `MIN`/`MAX` of `column` over `base_sql`.
pub fn bounds_query(base_sql: &str, column: &str) -> Result<String, ConnectorError> {
    validate_identifier(column)?;
    Ok(format!(
        "SELECT MIN({column}) AS lo, MAX({column}) AS hi FROM ({base_sql}) AS _bounds"
    ))
}

fn integer_key(v: &Value) -> Option<i64> {
    match v {
        Value::Int64(i) => Some(*i),
        Value::Float64(f) if f.fract() == 0.0 && f.is_finite() && f.abs() < 9.0e15 => Some(*f as i64),
        Value::Utf8(s) => s.trim().parse().ok(),
        _ => None,
    }
}
