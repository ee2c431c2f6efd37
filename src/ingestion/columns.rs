//! Column-typing builder shared by readers whose cells already carry scalar types (JSON, Excel).

use std::collections::HashMap;

use chrono::{NaiveDateTime, NaiveTime};

use crate::types::{DataSet, DataType, Field, Schema, Value};

/// One raw cell as a reader saw it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    DateTime(NaiveDateTime),
    /// Structured content (arrays, geometry) kept as JSON text.
    Json(String),
}

impl Cell {
    fn render(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Bool(b) => Some(b.to_string()),
            Cell::Int(v) => Some(v.to_string()),
            Cell::Float(v) => Some(v.to_string()),
            Cell::Text(s) | Cell::Json(s) => Some(s.clone()),
            Cell::DateTime(dt) => Some(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
        }
    }
}

/// Collects rows of named cells, keeping columns in first-seen order.
#[derive(Debug, Default)]
pub(crate) struct ColumnarBuilder {
    names: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<Vec<Cell>>,
}

impl ColumnarBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Index of `name`, registering it as a new column on first sight.
    pub(crate) fn column(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.names.len();
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), idx);
        idx
    }

    pub(crate) fn push_row(&mut self, cells: Vec<(usize, Cell)>) {
        let width = cells.iter().map(|(i, _)| i + 1).max().unwrap_or(0);
        let mut row = vec![Cell::Null; width];
        for (idx, cell) in cells {
            row[idx] = cell;
        }
        self.rows.push(row);
    }

    pub(crate) fn finish(self) -> DataSet {
        let types: Vec<DataType> = (0..self.names.len())
            .map(|idx| decide(self.rows.iter().map(|r| r.get(idx).unwrap_or(&Cell::Null))))
            .collect();

        let fields = self
            .names
            .into_iter()
            .zip(&types)
            .map(|(name, t)| Field::new(name, *t))
            .collect();

        let rows = self
            .rows
            .into_iter()
            .map(|mut row| {
                row.resize(types.len(), Cell::Null);
                row.into_iter()
                    .zip(&types)
                    .map(|(cell, t)| to_value(cell, *t))
                    .collect()
            })
            .collect();

        DataSet::new(Schema::new(fields), rows)
    }
}

fn decide<'a>(cells: impl Iterator<Item = &'a Cell>) -> DataType {
    let (mut bools, mut ints, mut floats, mut texts, mut datetimes, mut midnights, mut other) =
        (0usize, 0usize, 0usize, 0usize, 0usize, 0usize, 0usize);
    for cell in cells {
        match cell {
            Cell::Null => {}
            Cell::Bool(_) => bools += 1,
            Cell::Int(_) => ints += 1,
            Cell::Float(_) => floats += 1,
            Cell::Text(_) => texts += 1,
            Cell::DateTime(dt) => {
                datetimes += 1;
                if dt.time() == NaiveTime::MIN {
                    midnights += 1;
                }
            }
            Cell::Json(_) => other += 1,
        }
    }
    let total = bools + ints + floats + texts + datetimes + other;
    match total {
        0 => DataType::Utf8,
        _ if bools == total => DataType::Bool,
        _ if ints == total => DataType::Int64,
        _ if ints + floats == total => DataType::Float64,
        _ if datetimes == total && midnights == total => DataType::Date,
        _ if datetimes == total => DataType::DateTime,
        _ => DataType::Utf8,
    }
}

fn to_value(cell: Cell, data_type: DataType) -> Value {
    match (cell, data_type) {
        (Cell::Null, _) => Value::Null,
        (Cell::Bool(b), DataType::Bool) => Value::Bool(b),
        (Cell::Int(v), DataType::Int64) => Value::Int64(v),
        (Cell::Int(v), DataType::Float64) => Value::Float64(v as f64),
        (Cell::Float(v), DataType::Float64) => Value::Float64(v),
        (Cell::DateTime(dt), DataType::Date) => Value::Date(dt.date()),
        (Cell::DateTime(dt), DataType::DateTime) => Value::DateTime(dt),
        (cell, _) => cell.render().map_or(Value::Null, Value::Utf8),
    }
}
