//! Value casting between [`DataType`]s.

use crate::inference::detect;
use crate::types::{DataType, Value};

/// Cast one value to `target`. Nulls stay null; values that cannot be represented fail with a
/// human-readable reason.
pub fn cast_value(value: &Value, target: DataType) -> Result<Value, String> {
    if value.is_null() || value.data_type() == Some(target) {
        return Ok(value.clone());
    }

    let fail = || {
        let raw = value.as_text().unwrap_or_default();
        format!("cannot cast '{raw}' to {target}")
    };

    let out = match (value, target) {
        (_, DataType::Utf8) => value.as_text().map(|t| Value::Utf8(t.into_owned())),
        (Value::Utf8(s), t) => detect::parse_as(s, t),

        (Value::Int64(v), DataType::Float64) => Some(Value::Float64(*v as f64)),
        (Value::Float64(v), DataType::Int64) => float_to_int(*v).map(Value::Int64),
        (Value::Bool(b), DataType::Int64) => Some(Value::Int64(i64::from(*b))),
        (Value::Bool(b), DataType::Float64) => Some(Value::Float64(if *b { 1.0 } else { 0.0 })),
        (Value::Int64(v), DataType::Bool) => match v {
            0 => Some(Value::Bool(false)),
            1 => Some(Value::Bool(true)),
            _ => None,
        },

        (Value::Date(d), DataType::DateTime) => d.and_hms_opt(0, 0, 0).map(Value::DateTime),
        (Value::DateTime(dt), DataType::Date) => Some(Value::Date(dt.date())),

        _ => None,
    };
    out.ok_or_else(fail)
}

fn float_to_int(v: f64) -> Option<i64> {
    if v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}
