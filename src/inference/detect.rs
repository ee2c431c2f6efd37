//! Scalar type and semantic format detection over text values.
//!
//! Detection is pure: the same values in the same order always produce the same answer.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::Serialize;

use crate::types::{DataType, Value};

/// Share of non-null values that must match a pattern for a format tag to be reported.
pub const FORMAT_MATCH_THRESHOLD: f64 = 0.8;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
];

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid regex"));
static URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^https?://").expect("valid regex"));
static PHONE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+?[\d\s\-\(\)]{10,}$").expect("valid regex"));
static UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").expect("valid regex")
});

/// A value pattern layered on top of a string column's scalar type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticFormat {
    Email,
    Url,
    Phone,
    Uuid,
}

impl SemanticFormat {
    /// Checked in this order; the first format over the threshold wins.
    pub const ALL: [SemanticFormat; 4] = [
        SemanticFormat::Email,
        SemanticFormat::Url,
        SemanticFormat::Phone,
        SemanticFormat::Uuid,
    ];

    pub fn matches(self, value: &str) -> bool {
        match self {
            SemanticFormat::Email => EMAIL.is_match(value),
            SemanticFormat::Url => URL.is_match(value),
            SemanticFormat::Phone => PHONE.is_match(value),
            SemanticFormat::Uuid => UUID.is_match(&value.to_ascii_lowercase()),
        }
    }
}

impl fmt::Display for SemanticFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SemanticFormat::Email => "email",
            SemanticFormat::Url => "url",
            SemanticFormat::Phone => "phone",
            SemanticFormat::Uuid => "uuid",
        };
        f.write_str(s)
    }
}

pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" => Some(true),
        "false" | "f" | "no" | "n" => Some(false),
        _ => None,
    }
}

pub fn parse_int(s: &str) -> Option<i64> {
    s.trim().parse::<i64>().ok()
}

/// Parses finite decimal numbers. Words like `inf` or `NaN` are not numbers here.
pub fn parse_float(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    if !trimmed.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let trimmed = s.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
}

/// Parses naive and RFC 3339 timestamps (offsets are normalized to UTC). A bare date is midnight.
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let trimmed = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.naive_utc());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .or_else(|| parse_date(trimmed).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

/// Parse `raw` as `data_type`. Empty text is null; unparsable text is `None`.
pub fn parse_as(raw: &str, data_type: DataType) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(Value::Null);
    }
    match data_type {
        DataType::Bool => parse_bool(trimmed).map(Value::Bool),
        DataType::Int64 => parse_int(trimmed).map(Value::Int64),
        DataType::Float64 => parse_float(trimmed).map(Value::Float64),
        DataType::Date => parse_date(trimmed).map(Value::Date),
        DataType::DateTime => parse_datetime(trimmed).map(Value::DateTime),
        DataType::Utf8 => Some(Value::Utf8(trimmed.to_string())),
    }
}

/// Per-type match counters for one column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeCandidate {
    non_empty: usize,
    boolean_matches: usize,
    integer_matches: usize,
    float_matches: usize,
    date_matches: usize,
    datetime_matches: usize,
}

impl TypeCandidate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: &str) {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return;
        }
        self.non_empty += 1;
        if parse_bool(trimmed).is_some() {
            self.boolean_matches += 1;
        }
        if parse_int(trimmed).is_some() {
            self.integer_matches += 1;
        }
        if parse_float(trimmed).is_some() {
            self.float_matches += 1;
        }
        if parse_date(trimmed).is_some() {
            self.date_matches += 1;
        }
        if parse_datetime(trimmed).is_some() {
            self.datetime_matches += 1;
        }
    }

    pub fn non_empty(&self) -> usize {
        self.non_empty
    }

    fn matches_for(&self, data_type: DataType) -> usize {
        match data_type {
            DataType::Bool => self.boolean_matches,
            DataType::Int64 => self.integer_matches,
            DataType::Float64 => self.float_matches,
            DataType::Date => self.date_matches,
            DataType::DateTime => self.datetime_matches,
            DataType::Utf8 => self.non_empty,
        }
    }

    /// The strictest type every non-empty value parses as. No values means string.
    pub fn decide(&self) -> DataType {
        if self.non_empty == 0 {
            return DataType::Utf8;
        }
        DataType::PRECEDENCE
            .into_iter()
            .find(|t| self.matches_for(*t) == self.non_empty)
            .unwrap_or(DataType::Utf8)
    }

    /// The numeric or temporal type a strict majority of values conform to, if any.
    pub fn majority_numeric_or_temporal(&self) -> Option<DataType> {
        [DataType::Int64, DataType::Float64, DataType::Date, DataType::DateTime]
            .into_iter()
            .find(|t| {
                let n = self.matches_for(*t);
                n > 0 && n * 2 > self.non_empty
            })
    }
}

/// Narrowest scalar type for a set of text values.
pub fn detect_type<'a>(values: impl IntoIterator<Item = &'a str>) -> DataType {
    let mut candidate = TypeCandidate::new();
    for v in values {
        candidate.update(v);
    }
    candidate.decide()
}

/// Semantic format tag when at least 80% of the non-empty values match one pattern.
pub fn detect_format<'a>(values: impl IntoIterator<Item = &'a str>) -> Option<SemanticFormat> {
    let values: Vec<&str> = values
        .into_iter()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();
    if values.is_empty() {
        return None;
    }
    let total = values.len() as f64;
    SemanticFormat::ALL.into_iter().find(|format| {
        let hits = values.iter().filter(|v| format.matches(v)).count();
        hits as f64 / total >= FORMAT_MATCH_THRESHOLD
    })
}
