//! Core data model types shared by readers, inference, transformation and output.
//!
//! Every source is read into an in-memory [`DataSet`]: a [`Schema`] (a list of typed [`Field`]s)
//! plus row-major [`Value`] storage.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Column type shared by readers, inference, casting and the Parquet writer.
///
/// Variants are declared in detection precedence order: a column is typed as the first variant
/// every non-null value parses as, so `Bool` is the strictest and `Utf8` accepts everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataType {
    Bool,
    Int64,
    /// IEEE 754 double.
    Float64,
    /// Calendar date without time zone.
    Date,
    /// Date and time without time zone.
    DateTime,
    Utf8,
}

impl DataType {
    /// All types in precedence order (strictest first).
    pub const PRECEDENCE: [DataType; 6] = [
        DataType::Bool,
        DataType::Int64,
        DataType::Float64,
        DataType::Date,
        DataType::DateTime,
        DataType::Utf8,
    ];

    /// Canonical lowercase name used in schemas, warnings and responses.
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Bool => "boolean",
            DataType::Int64 => "integer",
            DataType::Float64 => "float",
            DataType::Date => "date",
            DataType::DateTime => "datetime",
            DataType::Utf8 => "string",
        }
    }

    /// Whether values of this type have a meaningful min/max.
    pub fn is_orderable(self) -> bool {
        matches!(
            self,
            DataType::Int64 | DataType::Float64 | DataType::Date | DataType::DateTime
        )
    }

    /// Whether this is a numeric or temporal type (the types inconsistency warnings care about).
    pub fn is_numeric_or_temporal(self) -> bool {
        self.is_orderable()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a type name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported type '{0}' (expected boolean, integer, float, date, datetime or string)")]
pub struct UnknownDataType(pub String);

impl FromStr for DataType {
    type Err = UnknownDataType;

    /// Accepts canonical names plus the common SQL spellings (`BIGINT`, `DOUBLE`, `VARCHAR`, `TIMESTAMP`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Ok(DataType::Bool),
            "int" | "integer" | "int64" | "bigint" | "smallint" | "tinyint" | "long" | "hugeint" => {
                Ok(DataType::Int64)
            }
            "float" | "float64" | "double" | "real" | "decimal" | "numeric" | "number" => {
                Ok(DataType::Float64)
            }
            "date" => Ok(DataType::Date),
            "datetime" | "timestamp" | "timestamptz" | "timestamp with time zone" => {
                Ok(DataType::DateTime)
            }
            "string" | "str" | "utf8" | "varchar" | "text" => Ok(DataType::Utf8),
            _ => Err(UnknownDataType(s.to_string())),
        }
    }
}

impl Serialize for DataType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One column of a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Column layout of a [`DataSet`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Position of the first column called `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// One cell. `Null` stands for empty cells, JSON nulls and SQL NULLs alike.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int64(i64),
    Float64(f64),
    Bool(bool),
    Utf8(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The type of a non-null value.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Int64(_) => Some(DataType::Int64),
            Value::Float64(_) => Some(DataType::Float64),
            Value::Bool(_) => Some(DataType::Bool),
            Value::Utf8(_) => Some(DataType::Utf8),
            Value::Date(_) => Some(DataType::Date),
            Value::DateTime(_) => Some(DataType::DateTime),
        }
    }

    /// Text rendering of a non-null value, borrowing strings where possible.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Value::Null => None,
            Value::Utf8(s) => Some(Cow::Borrowed(s.as_str())),
            Value::Int64(v) => Some(Cow::Owned(v.to_string())),
            Value::Float64(v) => Some(Cow::Owned(v.to_string())),
            Value::Bool(v) => Some(Cow::Owned(v.to_string())),
            Value::Date(d) => Some(Cow::Owned(d.format("%Y-%m-%d").to_string())),
            Value::DateTime(dt) => Some(Cow::Owned(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string())),
        }
    }

    /// Compare two values of the same orderable type. Mixed or unorderable pairs return `None`.
    pub fn partial_cmp_same_type(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int64(a), Value::Int64(b)) => Some(a.cmp(b)),
            (Value::Float64(a), Value::Float64(b)) => a.partial_cmp(b),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Utf8(a), Value::Utf8(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Int64(v) => serializer.serialize_i64(*v),
            Value::Float64(v) => serializer.serialize_f64(*v),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::Utf8(s) => serializer.serialize_str(s),
            Value::Date(_) | Value::DateTime(_) => {
                serializer.serialize_str(&self.as_text().unwrap_or_default())
            }
        }
    }
}

/// A table held in memory, one `Vec<Value>` per row in schema column order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataSet {
    pub schema: Schema,
    pub rows: Vec<Vec<Value>>,
}

impl DataSet {
    pub fn new(schema: Schema, rows: Vec<Vec<Value>>) -> Self {
        Self { schema, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.schema.len()
    }

    /// Iterate the values of one column in row order. Short rows yield `Null`.
    pub fn column(&self, idx: usize) -> impl Iterator<Item = &Value> + '_ {
        const NULL: &Value = &Value::Null;
        self.rows.iter().map(move |row| row.get(idx).unwrap_or(NULL))
    }

    /// Keep only the first `limit` rows.
    pub fn truncate(&mut self, limit: usize) {
        self.rows.truncate(limit);
    }

    /// Append the rows of `other`, which must share this dataset's column layout.
    ///
    /// Columns are matched by position. When `other` was typed independently (e.g. another
    /// extraction partition) and a column's type differs, the column is widened with
    /// [`widen_column`].
    pub fn append(&mut self, mut other: DataSet) {
        // Column types of a row-less side carry no information.
        if other.rows.is_empty() && !self.schema.is_empty() {
            return;
        }
        if self.rows.is_empty() {
            *self = other;
            return;
        }
        let theirs: Vec<DataType> = other.schema.fields.iter().map(|f| f.data_type).collect();
        for (idx, their_type) in theirs.into_iter().enumerate() {
            let Some(mine) = self.schema.fields.get(idx).map(|f| f.data_type) else {
                continue;
            };
            if mine != their_type {
                let widened = widen(mine, their_type);
                if widened != mine {
                    widen_column(self, idx, widened);
                }
                if widened != their_type {
                    widen_column(&mut other, idx, widened);
                }
            }
        }
        self.rows.append(&mut other.rows);
    }
}

/// The narrowest type both `a` and `b` can be represented in.
pub fn widen(a: DataType, b: DataType) -> DataType {
    match (a, b) {
        _ if a == b => a,
        (DataType::Int64, DataType::Float64) | (DataType::Float64, DataType::Int64) => {
            DataType::Float64
        }
        (DataType::Date, DataType::DateTime) | (DataType::DateTime, DataType::Date) => {
            DataType::DateTime
        }
        _ => DataType::Utf8,
    }
}

/// Convert column `idx` of `ds` in place to `target`, which must be a widening of its current type.
pub fn widen_column(ds: &mut DataSet, idx: usize, target: DataType) {
    for row in &mut ds.rows {
        if let Some(cell) = row.get_mut(idx) {
            let widened = match (&*cell, target) {
                (Value::Null, _) => Value::Null,
                (Value::Int64(v), DataType::Float64) => Value::Float64(*v as f64),
                (Value::Date(d), DataType::DateTime) => Value::DateTime(d.and_time(Default::default())),
                (other, DataType::Utf8) => match other.as_text() {
                    Some(text) => Value::Utf8(text.into_owned()),
                    None => Value::Null,
                },
                (other, _) => other.clone(),
            };
            *cell = widened;
        }
    }
    if let Some(field) = ds.schema.fields.get_mut(idx) {
        field.data_type = target;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_parses_sql_aliases() {
        assert_eq!("BIGINT".parse::<DataType>().unwrap(), DataType::Int64);
        assert_eq!("Double".parse::<DataType>().unwrap(), DataType::Float64);
        assert_eq!("VARCHAR".parse::<DataType>().unwrap(), DataType::Utf8);
        assert_eq!("timestamp".parse::<DataType>().unwrap(), DataType::DateTime);
        assert!("geometry".parse::<DataType>().is_err());
    }

    #[test]
    fn precedence_is_strictest_first() {
        let mut sorted = DataType::PRECEDENCE;
        sorted.sort();
        assert_eq!(sorted, DataType::PRECEDENCE);
        assert!(DataType::Bool < DataType::Utf8);
    }

    #[test]
    fn append_widens_mismatched_partition_columns() {
        let mut a = DataSet::new(
            Schema::new(vec![Field::new("x", DataType::Int64)]),
            vec![vec![Value::Int64(1)]],
        );
        let b = DataSet::new(
            Schema::new(vec![Field::new("x", DataType::Float64)]),
            vec![vec![Value::Float64(2.5)]],
        );
        a.append(b);
        assert_eq!(a.schema.fields[0].data_type, DataType::Float64);
        assert_eq!(a.rows, vec![vec![Value::Float64(1.0)], vec![Value::Float64(2.5)]]);
    }

    #[test]
    fn value_serializes_to_natural_json() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let json = serde_json::to_string(&vec![
            Value::Null,
            Value::Int64(3),
            Value::Utf8("a".into()),
            Value::Date(date),
        ])
        .unwrap();
        assert_eq!(json, r#"[null,3,"a","2024-03-01"]"#);
    }
}
