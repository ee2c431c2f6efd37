//! Delimited text (CSV/TSV) reading.

use std::borrow::Cow;
use std::collections::HashSet;

use encoding_rs::Encoding;

use crate::error::{IngestionError, IngestionResult};
use crate::types::{DataSet, DataType, Field, Schema, Value};

/// Decode `bytes` to text.
///
/// With no `label`, a byte-order mark selects the encoding and UTF-8 is assumed otherwise.
/// `label` accepts any WHATWG encoding label (`latin1`, `windows-1252`, `utf-16le`, ...).
pub fn decode_text<'a>(bytes: &'a [u8], label: Option<&str>) -> IngestionResult<Cow<'a, str>> {
    let encoding = match label {
        None => encoding_rs::UTF_8,
        Some(label) => Encoding::for_label(label.trim().as_bytes()).ok_or_else(|| {
            IngestionError::Unsupported {
                message: format!("unknown text encoding '{label}'"),
            }
        })?,
    };
    let (text, _used, _had_errors) = encoding.decode(bytes);
    Ok(text)
}

/// Read delimited text into a [`DataSet`] of text columns.
///
/// Rules:
///
/// - The first record is the header; blank or repeated header names are made unique.
/// - Short records are padded with nulls and surplus fields are ignored.
/// - Empty (or whitespace-only) cells are null; everything else is kept as trimmed text for the
///   type detector to refine.
pub fn read_csv(bytes: &[u8], delimiter: u8, encoding: Option<&str>) -> IngestionResult<DataSet> {
    let text = decode_text(bytes, encoding)?;
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    let headers = rdr.headers()?.clone();
    if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
        return Err(IngestionError::SchemaMismatch {
            message: "delimited input has no header row".to_string(),
        });
    }
    let names = unique_headers(headers.iter());
    let width = names.len();

    let mut rows: Vec<Vec<Value>> = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let row = (0..width)
            .map(|idx| match record.get(idx).map(str::trim) {
                None | Some("") => Value::Null,
                Some(raw) => Value::Utf8(raw.to_string()),
            })
            .collect();
        rows.push(row);
    }

    let schema = Schema::new(names.into_iter().map(|n| Field::new(n, DataType::Utf8)).collect());
    Ok(DataSet::new(schema, rows))
}

fn unique_headers<'a>(headers: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    headers
        .enumerate()
        .map(|(idx, raw)| {
            let base = match raw.trim() {
                "" => format!("column_{}", idx + 1),
                name => name.to_string(),
            };
            let mut name = base.clone();
            let mut n = 2;
            while !seen.insert(name.clone()) {
                name = format!("{base}_{n}");
                n += 1;
            }
            name
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_rows_are_padded_and_extra_fields_ignored() {
        let ds = read_csv(b"a,b\n1\n2,3,4\n", b',', None).unwrap();
        assert_eq!(ds.rows[0], vec![Value::Utf8("1".into()), Value::Null]);
        assert_eq!(ds.rows[1], vec![Value::Utf8("2".into()), Value::Utf8("3".into())]);
    }

    #[test]
    fn duplicate_and_blank_headers_are_renamed() {
        let ds = read_csv(b"id,id,\n1,2,3\n", b',', None).unwrap();
        let names: Vec<&str> = ds.schema.field_names().collect();
        assert_eq!(names, vec!["id", "id_2", "column_3"]);
    }

    #[test]
    fn tab_delimited_and_latin1() {
        let bytes = b"name\tcity\nJos\xe9\tS\xe3o Paulo\n";
        let ds = read_csv(bytes, b'\t', Some("latin1")).unwrap();
        assert_eq!(ds.rows[0][0], Value::Utf8("José".into()));
        assert_eq!(ds.rows[0][1], Value::Utf8("São Paulo".into()));
    }

    #[test]
    fn utf8_bom_is_stripped_from_first_header() {
        let ds = read_csv(b"\xef\xbb\xbfid\n7\n", b',', None).unwrap();
        assert_eq!(ds.schema.fields[0].name, "id");
    }

    #[test]
    fn unknown_encoding_is_rejected() {
        assert!(matches!(
            read_csv(b"a\n1\n", b',', Some("klingon")),
            Err(IngestionError::Unsupported { .. })
        ));
    }

    #[test]
    fn empty_input_has_no_header() {
        assert!(matches!(
            read_csv(b"", b',', None),
            Err(IngestionError::SchemaMismatch { .. })
        ));
    }
}
