use bytes::Bytes;
use chrono::NaiveDate;

use tabular_convert::inference::refine_types;
use tabular_convert::ingestion::{ReadOptions, SourceFormat, read_bytes};
use tabular_convert::types::{DataType, Value};

mod common;

fn read_fixture(name: &str, format: SourceFormat) -> tabular_convert::types::DataSet {
    let bytes = std::fs::read(common::fixture(name)).unwrap();
    read_bytes(format, Bytes::from(bytes), &ReadOptions::default()).unwrap()
}

#[test]
fn csv_reads_as_text_then_refines_to_typed_columns() {
    let mut ds = read_fixture("people.csv", SourceFormat::Csv);
    assert_eq!(ds.row_count(), 3);
    assert!(ds.schema.fields.iter().all(|f| f.data_type == DataType::Utf8));
    assert_eq!(ds.rows[2][2], Value::Null);

    refine_types(&mut ds);
    let types: Vec<DataType> = ds.schema.fields.iter().map(|f| f.data_type).collect();
    assert_eq!(
        types,
        vec![
            DataType::Int64,
            DataType::Utf8,
            DataType::Float64,
            DataType::Bool,
            DataType::Date,
        ]
    );
    assert_eq!(
        ds.rows[0],
        vec![
            Value::Int64(1),
            Value::Utf8("Ada".to_string()),
            Value::Float64(98.5),
            Value::Bool(true),
            Value::Date(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()),
        ]
    );
    assert_eq!(ds.rows[2][2], Value::Null);
}

#[test]
fn tsv_defaults_to_tab_delimiter() {
    let mut ds = read_fixture("cities.tsv", SourceFormat::Tsv);
    refine_types(&mut ds);
    let names: Vec<&str> = ds.schema.field_names().collect();
    assert_eq!(names, vec!["id", "city", "population"]);
    assert_eq!(ds.rows[1][2], Value::Int64(232_000));
}

#[test]
fn explicit_delimiter_overrides_the_format_default() {
    let opts = ReadOptions {
        delimiter: Some(b';'),
        ..ReadOptions::default()
    };
    let ds = read_bytes(SourceFormat::Csv, Bytes::from_static(b"a;b\n1;2\n"), &opts).unwrap();
    assert_eq!(ds.column_count(), 2);
    assert_eq!(ds.rows[0][1], Value::Utf8("2".to_string()));
}

#[test]
fn unknown_encoding_label_is_rejected() {
    let opts = ReadOptions {
        encoding: Some("not-a-charset".to_string()),
        ..ReadOptions::default()
    };
    let err = read_bytes(SourceFormat::Csv, Bytes::from_static(b"a\n1\n"), &opts).unwrap_err();
    assert!(err.to_string().contains("unknown text encoding"));
}

#[test]
fn headerless_input_is_a_schema_mismatch() {
    let err = read_bytes(SourceFormat::Csv, Bytes::from_static(b""), &ReadOptions::default()).unwrap_err();
    assert!(err.to_string().contains("schema mismatch"));
}

#[test]
fn mixed_numeric_column_widens_to_float() {
    let mut ds = read_bytes(
        SourceFormat::Csv,
        Bytes::from_static(b"n\n1\n2.5\n3\n"),
        &ReadOptions::default(),
    )
    .unwrap();
    refine_types(&mut ds);
    assert_eq!(ds.schema.fields[0].data_type, DataType::Float64);
    assert_eq!(ds.rows[0][0], Value::Float64(1.0));
}
