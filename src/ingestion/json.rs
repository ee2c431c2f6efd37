//! JSON, NDJSON and GeoJSON reading.
//!
//! Supported inputs:
//! - A JSON array of objects: `[{"a":1}, {"a":2}]`
//! - A single JSON object: `{"a":1}`
//! - Newline-delimited JSON (NDJSON): `{"a":1}\n{"a":2}\n`
//! - A GeoJSON `FeatureCollection` (when read as GeoJSON): each feature's `properties` become
//!   columns and its `geometry` is kept as a JSON text column named `geometry`.
//!
//! Nested objects are flattened into dot-path columns (`user.name`); arrays are kept as JSON text.

use serde_json::{Map, Value as Json};

use crate::error::{IngestionError, IngestionResult};
use crate::types::DataSet;

use super::columns::{Cell, ColumnarBuilder};

/// Read JSON documents (array, object or NDJSON) into a [`DataSet`].
pub fn read_json(text: &str) -> IngestionResult<DataSet> {
    let records = parse_records(text)?;
    let mut builder = ColumnarBuilder::new();
    for (idx0, record) in records.iter().enumerate() {
        let obj = record.as_object().ok_or_else(|| IngestionError::ParseError {
            row: idx0 + 1,
            message: "record is not a json object".to_string(),
        })?;
        let mut cells = Vec::new();
        flatten_into(&mut builder, "", obj, &mut cells);
        builder.push_row(cells);
    }
    Ok(builder.finish())
}

/// Read a GeoJSON `FeatureCollection` into a [`DataSet`].
pub fn read_geojson(text: &str) -> IngestionResult<DataSet> {
    let doc: Json = serde_json::from_str(text.trim()).map_err(|e| IngestionError::ParseError {
        row: 1,
        message: e.to_string(),
    })?;
    let features = match doc.get("type").and_then(Json::as_str) {
        Some("FeatureCollection") => doc
            .get("features")
            .and_then(Json::as_array)
            .ok_or_else(|| IngestionError::SchemaMismatch {
                message: "FeatureCollection has no 'features' array".to_string(),
            })?,
        _ => {
            return Err(IngestionError::SchemaMismatch {
                message: "geojson input must be a FeatureCollection".to_string(),
            });
        }
    };

    let mut builder = ColumnarBuilder::new();
    for feature in features {
        let mut cells = Vec::new();
        if let Some(props) = feature.get("properties").and_then(Json::as_object) {
            flatten_into(&mut builder, "", props, &mut cells);
        }
        let geometry = feature.get("geometry").unwrap_or(&Json::Null);
        let idx = builder.column("geometry");
        let cell = if geometry.is_null() {
            Cell::Null
        } else {
            Cell::Json(geometry.to_string())
        };
        cells.retain(|(i, _)| *i != idx);
        cells.push((idx, cell));
        builder.push_row(cells);
    }
    Ok(builder.finish())
}

fn parse_records(text: &str) -> IngestionResult<Vec<Json>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(IngestionError::SchemaMismatch {
            message: "json input is empty".to_string(),
        });
    }

    // A single JSON value (array or object) first; otherwise NDJSON.
    if let Ok(v) = serde_json::from_str::<Json>(trimmed) {
        return match v {
            Json::Array(items) => Ok(items),
            Json::Object(_) => Ok(vec![v]),
            _ => Err(IngestionError::SchemaMismatch {
                message: "json must be an object, an array of objects, or NDJSON".to_string(),
            }),
        };
    }

    let mut values = Vec::new();
    for (i, line) in trimmed.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let v = serde_json::from_str::<Json>(line).map_err(|e| IngestionError::ParseError {
            row: i + 1,
            message: format!("invalid ndjson: {e}"),
        })?;
        values.push(v);
    }
    Ok(values)
}

fn flatten_into(
    builder: &mut ColumnarBuilder,
    prefix: &str,
    obj: &Map<String, Json>,
    cells: &mut Vec<(usize, Cell)>,
) {
    for (key, value) in obj {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Json::Object(inner) if !inner.is_empty() => flatten_into(builder, &name, inner, cells),
            other => {
                let idx = builder.column(&name);
                cells.push((idx, cell_from_json(other)));
            }
        }
    }
}

fn cell_from_json(v: &Json) -> Cell {
    match v {
        Json::Null => Cell::Null,
        Json::Bool(b) => Cell::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Cell::Int(i),
            None => n.as_f64().map_or(Cell::Json(n.to_string()), Cell::Float),
        },
        Json::String(s) if s.trim().is_empty() => Cell::Null,
        Json::String(s) => Cell::Text(s.clone()),
        other => Cell::Json(other.to_string()),
    }
}
