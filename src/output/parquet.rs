//! Parquet encoding of a [`DataSet`].

use std::sync::Arc;

use chrono::NaiveDate;
use parquet::basic::{Compression as Codec, ConvertedType, LogicalType, Repetition, Type as PhysicalType, ZstdLevel};
use parquet::column::writer::ColumnWriter;
use parquet::data_type::ByteArray;
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use parquet::schema::types::{Type, TypePtr};

use crate::processing::cast_value;
use crate::types::{DataSet, DataType, Value};

use super::{Compression, OutputError};

/// Column written when the table has no columns of its own.
pub const EMPTY_COLUMN: &str = "_empty";

impl Compression {
    fn codec(self) -> Codec {
        match self {
            Compression::Zstd => Codec::ZSTD(ZstdLevel::default()),
            Compression::Snappy => Codec::SNAPPY,
            Compression::None => Codec::UNCOMPRESSED,
        }
    }
}

fn column_type(name: &str, data_type: DataType) -> Result<TypePtr, OutputError> {
    let builder = match data_type {
        DataType::Bool => Type::primitive_type_builder(name, PhysicalType::BOOLEAN),
        DataType::Int64 => Type::primitive_type_builder(name, PhysicalType::INT64),
        DataType::Float64 => Type::primitive_type_builder(name, PhysicalType::DOUBLE),
        DataType::Utf8 => {
            Type::primitive_type_builder(name, PhysicalType::BYTE_ARRAY).with_logical_type(Some(LogicalType::String))
        }
        DataType::Date => {
            Type::primitive_type_builder(name, PhysicalType::INT32).with_logical_type(Some(LogicalType::Date))
        }
        DataType::DateTime => Type::primitive_type_builder(name, PhysicalType::INT64)
            .with_converted_type(ConvertedType::TIMESTAMP_MICROS),
    };
    Ok(Arc::new(builder.with_repetition(Repetition::OPTIONAL).build()?))
}

fn file_schema(ds: &DataSet) -> Result<TypePtr, OutputError> {
    let mut fields = ds
        .schema
        .fields
        .iter()
        .map(|f| column_type(&f.name, f.data_type))
        .collect::<Result<Vec<_>, _>>()?;
    if fields.is_empty() {
        fields.push(column_type(EMPTY_COLUMN, DataType::Utf8)?);
    }
    Ok(Arc::new(Type::group_type_builder("schema").with_fields(fields).build()?))
}

/// Encode `ds` as a Parquet file.
///
/// Every column is nullable. Values that do not match their column type are cast, and a value
/// that cannot be cast is written as null.
pub fn encode_parquet(ds: &DataSet, compression: Compression, row_group_size: usize) -> Result<Vec<u8>, OutputError> {
    let row_group_size = row_group_size.max(1);
    let props = WriterProperties::builder()
        .set_compression(compression.codec())
        .set_max_row_group_size(row_group_size)
        .build();

    let mut buf = Vec::new();
    let mut writer = SerializedFileWriter::new(&mut buf, file_schema(ds)?, Arc::new(props))?;
    let types: Vec<DataType> = ds.schema.fields.iter().map(|f| f.data_type).collect();

    for chunk in ds.rows.chunks(row_group_size) {
        let mut group = writer.next_row_group()?;
        let mut idx = 0;
        while let Some(mut column) = group.next_column()? {
            let data_type = types.get(idx).copied().unwrap_or(DataType::Utf8);
            write_column(column.untyped(), chunk, idx, data_type)?;
            column.close()?;
            idx += 1;
        }
        group.close()?;
    }
    writer.close()?;
    Ok(buf)
}

/// The typed value of column `idx` in `row`, or `None` for null or uncastable values.
fn cell(row: &[Value], idx: usize, data_type: DataType) -> Option<Value> {
    let v = row.get(idx)?;
    match v.data_type() {
        None => None,
        Some(t) if t == data_type => Some(v.clone()),
        Some(_) => cast_value(v, data_type).ok().filter(|v| !v.is_null()),
    }
}

/// Split a column into non-null values and definition levels.
fn levels<T>(rows: &[Vec<Value>], idx: usize, data_type: DataType, extract: impl Fn(Value) -> Option<T>) -> (Vec<T>, Vec<i16>) {
    let mut values = Vec::with_capacity(rows.len());
    let mut defs = Vec::with_capacity(rows.len());
    for row in rows {
        match cell(row, idx, data_type).and_then(&extract) {
            Some(v) => {
                values.push(v);
                defs.push(1);
            }
            None => defs.push(0),
        }
    }
    (values, defs)
}

fn write_column(writer: &mut ColumnWriter<'_>, rows: &[Vec<Value>], idx: usize, data_type: DataType) -> Result<(), OutputError> {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    match writer {
        ColumnWriter::BoolColumnWriter(w) => {
            let (values, defs) = levels(rows, idx, data_type, |v| match v {
                Value::Bool(b) => Some(b),
                _ => None,
            });
            w.write_batch(&values, Some(&defs), None)?;
        }
        ColumnWriter::Int32ColumnWriter(w) => {
            let (values, defs) = levels(rows, idx, data_type, |v| match v {
                Value::Date(d) => i32::try_from((d - epoch).num_days()).ok(),
                _ => None,
            });
            w.write_batch(&values, Some(&defs), None)?;
        }
        ColumnWriter::Int64ColumnWriter(w) => {
            let (values, defs) = levels(rows, idx, data_type, |v| match v {
                Value::Int64(i) => Some(i),
                Value::DateTime(dt) => Some(dt.and_utc().timestamp_micros()),
                _ => None,
            });
            w.write_batch(&values, Some(&defs), None)?;
        }
        ColumnWriter::DoubleColumnWriter(w) => {
            let (values, defs) = levels(rows, idx, data_type, |v| match v {
                Value::Float64(f) => Some(f),
                _ => None,
            });
            w.write_batch(&values, Some(&defs), None)?;
        }
        ColumnWriter::ByteArrayColumnWriter(w) => {
            let (values, defs) = levels(rows, idx, data_type, |v| match v {
                Value::Utf8(s) => Some(ByteArray::from(s.into_bytes())),
                _ => None,
            });
            w.write_batch(&values, Some(&defs), None)?;
        }
        _ => {
            return Err(OutputError::Encode(format!("unexpected physical type for column {idx}")));
        }
    }
    Ok(())
}
