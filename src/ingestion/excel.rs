#![cfg(feature = "excel")]

use std::io::Cursor;

use calamine::{Data, Reader, open_workbook_auto_from_rs};

use crate::error::{IngestionError, IngestionResult};
use crate::types::DataSet;

use super::columns::{Cell, ColumnarBuilder};
use super::unified::SheetSelection;

/// Read one worksheet of an in-memory workbook (`.xlsx`, `.xls`, `.xlsm`, `.xlsb`, `.ods`).
///
/// Behavior:
/// - The first non-empty row is the header; blank header cells become `column_N`
/// - Empty cells are null; rows that are entirely empty are dropped
/// - Date/time cells are read as datetimes (dates when every value falls on midnight)
pub fn read_excel(bytes: Vec<u8>, sheet: &SheetSelection) -> IngestionResult<DataSet> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))?;
    let names = workbook.sheet_names().to_vec();
    let name = match sheet {
        SheetSelection::First => names.first().cloned(),
        SheetSelection::Name(n) => names.iter().find(|s| *s == n).cloned(),
        SheetSelection::Index(i) => names.get(*i).cloned(),
    }
    .ok_or_else(|| IngestionError::NotFound {
        message: format!("sheet {sheet:?} not found; workbook has {names:?}"),
    })?;

    let range = workbook.worksheet_range(&name)?;
    let mut rows = range.rows().skip_while(|r| r.iter().all(|c| matches!(c, Data::Empty)));
    let header = rows.next().ok_or_else(|| IngestionError::SchemaMismatch {
        message: format!("sheet '{name}' has no non-empty rows (no header row found)"),
    })?;

    let mut builder = ColumnarBuilder::new();
    let columns: Vec<usize> = header
        .iter()
        .enumerate()
        .map(|(idx, c)| {
            let label = header_label(c);
            let label = if label.is_empty() { format!("column_{}", idx + 1) } else { label };
            builder.column(&label)
        })
        .collect();

    for row in rows {
        if row.iter().all(|c| matches!(c, Data::Empty)) {
            continue;
        }
        let cells = columns
            .iter()
            .enumerate()
            .map(|(pos, &col)| (col, to_cell(row.get(pos).unwrap_or(&Data::Empty))))
            .collect();
        builder.push_row(cells);
    }
    Ok(builder.finish())
}

fn header_label(c: &Data) -> String {
    match c {
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) if f.fract() == 0.0 => (*f as i64).to_string(),
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}

fn to_cell(c: &Data) -> Cell {
    match c {
        Data::Empty => Cell::Null,
        Data::Bool(b) => Cell::Bool(*b),
        Data::Int(i) => Cell::Int(*i),
        // Excel stores every number as a double.
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Cell::Int(*f as i64),
        Data::Float(f) => Cell::Float(*f),
        Data::String(s) if s.trim().is_empty() => Cell::Null,
        Data::String(s) => Cell::Text(s.trim().to_string()),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map_or_else(|| Cell::Text(dt.to_string()), Cell::DateTime),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
        Data::Error(e) => Cell::Text(format!("{e:?}")),
    }
}
