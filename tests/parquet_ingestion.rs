use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use chrono::NaiveDate;
use parquet::column::writer::ColumnWriter;
use parquet::data_type::ByteArray;
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::file::writer::SerializedFileWriter;
use parquet::schema::parser::parse_message_type;

use tabular_convert::ingestion::parquet::read_parquet;
use tabular_convert::output::{Compression, encode_parquet};
use tabular_convert::types::{DataSet, DataType, Field, Schema, Value};

mod common;

/// Days from the Unix epoch to 2024-03-01.
const MARCH_FIRST_2024: i32 = 19_783;

fn write_visits_parquet(path: &PathBuf) {
    let schema = r#"
    message schema {
      REQUIRED INT64 id;
      OPTIONAL BINARY name (UTF8);
      REQUIRED INT32 visited (DATE);
      REQUIRED DOUBLE spend;
    }
    "#;
    let schema = Arc::new(parse_message_type(schema).unwrap());
    let props = Arc::new(WriterProperties::builder().build());
    let file = File::create(path).unwrap();
    let mut writer = SerializedFileWriter::new(file, schema, props).unwrap();

    let mut rg = writer.next_row_group().unwrap();
    while let Some(mut col) = rg.next_column().unwrap() {
        match col.untyped() {
            ColumnWriter::Int64ColumnWriter(w) => {
                w.write_batch(&[1_i64, 2_i64], None, None).unwrap();
            }
            ColumnWriter::ByteArrayColumnWriter(w) => {
                // Second row is null: one value, two definition levels.
                w.write_batch(&[ByteArray::from("Ada")], Some(&[1, 0]), None).unwrap();
            }
            ColumnWriter::Int32ColumnWriter(w) => {
                w.write_batch(&[MARCH_FIRST_2024, MARCH_FIRST_2024 + 1], None, None).unwrap();
            }
            ColumnWriter::DoubleColumnWriter(w) => {
                w.write_batch(&[10.5_f64, 0.25_f64], None, None).unwrap();
            }
            _ => panic!("unexpected column writer in test"),
        }
        col.close().unwrap();
    }
    rg.close().unwrap();
    writer.close().unwrap();
}

#[test]
fn stored_parquet_types_are_kept() {
    let dir = common::scratch_dir("parquet-read");
    let path = dir.join("visits.parquet");
    write_visits_parquet(&path);

    let ds = read_parquet(Bytes::from(std::fs::read(&path).unwrap())).unwrap();
    let types: Vec<DataType> = ds.schema.fields.iter().map(|f| f.data_type).collect();
    assert_eq!(
        types,
        vec![DataType::Int64, DataType::Utf8, DataType::Date, DataType::Float64]
    );
    assert_eq!(ds.rows[0][1], Value::Utf8("Ada".to_string()));
    assert_eq!(ds.rows[1][1], Value::Null);
    assert_eq!(
        ds.rows[1][2],
        Value::Date(NaiveDate::from_ymd_opt(2024, 3, 2).unwrap())
    );
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn encoder_honors_row_group_size() {
    let ds = DataSet::new(
        Schema::new(vec![Field::new("n", DataType::Int64)]),
        (0..5).map(|i| vec![Value::Int64(i)]).collect(),
    );
    let bytes = encode_parquet(&ds, Compression::Snappy, 2).unwrap();
    let reader = SerializedFileReader::new(Bytes::from(bytes.clone())).unwrap();
    assert_eq!(reader.metadata().num_row_groups(), 3);
    assert_eq!(reader.metadata().file_metadata().num_rows(), 5);

    let back = read_parquet(Bytes::from(bytes)).unwrap();
    assert_eq!(back.rows[4], vec![Value::Int64(4)]);
}

#[test]
fn zero_column_tables_still_produce_a_readable_file() {
    let bytes = encode_parquet(&DataSet::default(), Compression::Zstd, 100).unwrap();
    let back = read_parquet(Bytes::from(bytes)).unwrap();
    assert_eq!(back.row_count(), 0);
    assert_eq!(back.schema.fields[0].name, tabular_convert::output::EMPTY_COLUMN);
}

#[test]
fn garbage_bytes_are_a_parquet_error() {
    let err = read_parquet(Bytes::from_static(b"definitely not parquet")).unwrap_err();
    assert!(err.to_string().contains("parquet error"));
}
