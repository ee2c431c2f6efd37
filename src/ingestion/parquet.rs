//! Parquet reading.

use bytes::Bytes;
use chrono::{DateTime, NaiveDate};
use parquet::basic::{ConvertedType, LogicalType, Type as PhysicalType};
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::Field as ParquetField;
use parquet::schema::types::ColumnDescriptor;

use crate::error::IngestionResult;
use crate::processing::cast_value;
use crate::types::{DataSet, DataType, Field, Schema, Value};

/// Days between 0001-01-01 (CE day 1) and the Unix epoch.
const EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Read an in-memory Parquet file, keeping the file's stored column types.
///
/// Top-level primitive columns map onto [`DataType`]s by their logical annotation first and
/// physical type second. Nested (group/list/map) columns are rendered as text.
pub fn read_parquet(bytes: Bytes) -> IngestionResult<DataSet> {
    let reader = SerializedFileReader::new(bytes)?;
    let metadata = reader.metadata().file_metadata();
    let descr = metadata.schema_descr();

    let fields: Vec<Field> = metadata
        .schema()
        .get_fields()
        .iter()
        .map(|f| {
            let name = f.name().to_string();
            let data_type = if f.is_primitive() {
                descr
                    .columns()
                    .iter()
                    .find(|c| c.path().parts().len() == 1 && c.name() == name)
                    .map_or(DataType::Utf8, |c| column_type(c))
            } else {
                DataType::Utf8
            };
            Field::new(name, data_type)
        })
        .collect();

    let mut rows = Vec::with_capacity(usize::try_from(metadata.num_rows()).unwrap_or(0));
    for row in reader.get_row_iter(None)? {
        let row = row?;
        let values = row
            .get_column_iter()
            .zip(&fields)
            .map(|((_, cell), field)| {
                let v = convert(cell);
                if v.is_null() || v.data_type() == Some(field.data_type) {
                    v
                } else {
                    cast_value(&v, field.data_type).unwrap_or(Value::Null)
                }
            })
            .collect();
        rows.push(values);
    }

    Ok(DataSet::new(Schema::new(fields), rows))
}

fn column_type(col: &ColumnDescriptor) -> DataType {
    match col.logical_type_ref() {
        Some(LogicalType::Date) => return DataType::Date,
        Some(LogicalType::Timestamp { .. }) => return DataType::DateTime,
        Some(LogicalType::Decimal { .. }) => return DataType::Float64,
        Some(LogicalType::String | LogicalType::Json | LogicalType::Enum | LogicalType::Uuid) => {
            return DataType::Utf8;
        }
        _ => {}
    }
    // Files without logical annotations (older writers) carry converted types only.
    match col.converted_type() {
        ConvertedType::DATE => return DataType::Date,
        ConvertedType::TIMESTAMP_MILLIS | ConvertedType::TIMESTAMP_MICROS => return DataType::DateTime,
        ConvertedType::DECIMAL => return DataType::Float64,
        ConvertedType::UTF8 | ConvertedType::JSON | ConvertedType::ENUM => return DataType::Utf8,
        _ => {}
    }
    match col.physical_type() {
        PhysicalType::BOOLEAN => DataType::Bool,
        PhysicalType::INT32 | PhysicalType::INT64 => DataType::Int64,
        PhysicalType::FLOAT | PhysicalType::DOUBLE => DataType::Float64,
        PhysicalType::INT96 => DataType::DateTime,
        PhysicalType::BYTE_ARRAY | PhysicalType::FIXED_LEN_BYTE_ARRAY => DataType::Utf8,
    }
}

fn convert(f: &ParquetField) -> Value {
    match f {
        ParquetField::Null => Value::Null,
        ParquetField::Bool(b) => Value::Bool(*b),
        ParquetField::Byte(v) => Value::Int64(i64::from(*v)),
        ParquetField::Short(v) => Value::Int64(i64::from(*v)),
        ParquetField::Int(v) => Value::Int64(i64::from(*v)),
        ParquetField::Long(v) => Value::Int64(*v),
        ParquetField::UByte(v) => Value::Int64(i64::from(*v)),
        ParquetField::UShort(v) => Value::Int64(i64::from(*v)),
        ParquetField::UInt(v) => Value::Int64(i64::from(*v)),
        ParquetField::ULong(v) => i64::try_from(*v).map_or(Value::Float64(*v as f64), Value::Int64),
        ParquetField::Float(v) => Value::Float64(f64::from(*v)),
        ParquetField::Double(v) => Value::Float64(*v),
        ParquetField::Str(s) => Value::Utf8(s.clone()),
        ParquetField::Bytes(b) => Value::Utf8(String::from_utf8_lossy(b.data()).into_owned()),
        ParquetField::Date(days) => days
            .checked_add(EPOCH_DAYS_FROM_CE)
            .and_then(NaiveDate::from_num_days_from_ce_opt)
            .map_or(Value::Null, Value::Date),
        ParquetField::TimestampMillis(ms) => DateTime::from_timestamp_millis(*ms)
            .map_or(Value::Null, |dt| Value::DateTime(dt.naive_utc())),
        ParquetField::TimestampMicros(us) => DateTime::from_timestamp_micros(*us)
            .map_or(Value::Null, |dt| Value::DateTime(dt.naive_utc())),
        ParquetField::Decimal(_) => f
            .to_string()
            .parse::<f64>()
            .map_or_else(|_| Value::Utf8(f.to_string()), Value::Float64),
        other => Value::Utf8(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{Compression, encode_parquet};

    #[test]
    fn stored_types_survive_a_round_trip_through_the_writer() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let ds = DataSet::new(
            Schema::new(vec![
                Field::new("id", DataType::Int64),
                Field::new("name", DataType::Utf8),
                Field::new("day", DataType::Date),
                Field::new("at", DataType::DateTime),
            ]),
            vec![
                vec![
                    Value::Int64(1),
                    Value::Utf8("a".into()),
                    Value::Date(date),
                    Value::DateTime(date.and_hms_opt(12, 30, 0).unwrap()),
                ],
                vec![Value::Int64(2), Value::Null, Value::Null, Value::Null],
            ],
        );
        let bytes = encode_parquet(&ds, Compression::Snappy, 1).unwrap();
        let back = read_parquet(Bytes::from(bytes)).unwrap();
        assert_eq!(back, ds);
    }

    #[test]
    fn garbage_is_a_parquet_error() {
        let err = read_parquet(Bytes::from_static(b"not parquet")).unwrap_err();
        assert!(matches!(err, crate::error::IngestionError::Parquet(_)));
    }
}
