//! Format resolution and format-independent reading.
//!
//! Callers hand over the raw bytes of one source file plus a [`SourceFormat`]; [`read_bytes`]
//! dispatches to the matching reader. The format itself is resolved by [`resolve_format`] in a
//! fixed order: explicit override, then the source record's type, then the file extension.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{IngestionError, IngestionResult};
use crate::types::DataSet;

use super::{csv, json, parquet};

/// Supported file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// Comma-separated values.
    Csv,
    /// Tab-separated values.
    Tsv,
    /// JSON array-of-objects, single object, or NDJSON.
    Json,
    /// GeoJSON `FeatureCollection`.
    GeoJson,
    /// Spreadsheet/workbook formats (feature-gated behind `excel`).
    Excel,
    /// Apache Parquet.
    Parquet,
}

impl SourceFormat {
    pub const ALL: [SourceFormat; 6] = [
        SourceFormat::Csv,
        SourceFormat::Tsv,
        SourceFormat::Json,
        SourceFormat::GeoJson,
        SourceFormat::Excel,
        SourceFormat::Parquet,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceFormat::Csv => "csv",
            SourceFormat::Tsv => "tsv",
            SourceFormat::Json => "json",
            SourceFormat::GeoJson => "geojson",
            SourceFormat::Excel => "excel",
            SourceFormat::Parquet => "parquet",
        }
    }

    /// File extensions (lowercase, without the dot) a source file of this format may carry.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            SourceFormat::Csv => &["csv"],
            SourceFormat::Tsv => &["tsv", "tab"],
            SourceFormat::Json => &["json", "ndjson", "jsonl"],
            SourceFormat::GeoJson => &["geojson"],
            SourceFormat::Excel => &["xlsx", "xls", "xlsm", "xlsb", "ods"],
            SourceFormat::Parquet => &["parquet", "pq"],
        }
    }

    /// Parse a format from a file extension (case-insensitive).
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        Self::ALL.into_iter().find(|f| f.extensions().contains(&ext.as_str()))
    }

    /// Format implied by the extension of the last path segment.
    pub fn from_path(path: &str) -> Option<Self> {
        let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
        let (_, ext) = name.rsplit_once('.')?;
        Self::from_extension(ext)
    }

    /// Whether `path` carries one of this format's extensions.
    pub fn matches_path(self, path: &str) -> bool {
        Self::from_path(path) == Some(self)
    }

    /// Whether the reader hands back text columns that still need type refinement.
    pub fn is_text_bearing(self) -> bool {
        !matches!(self, SourceFormat::Parquet)
    }

    /// Whether this build can read the format.
    pub fn is_enabled(self) -> bool {
        match self {
            SourceFormat::Excel => cfg!(feature = "excel"),
            _ => true,
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceFormat {
    type Err = IngestionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        match key.as_str() {
            "csv" => Ok(SourceFormat::Csv),
            "tsv" => Ok(SourceFormat::Tsv),
            "json" | "ndjson" | "jsonl" => Ok(SourceFormat::Json),
            "geojson" => Ok(SourceFormat::GeoJson),
            "excel" | "xlsx" | "xls" => Ok(SourceFormat::Excel),
            "parquet" => Ok(SourceFormat::Parquet),
            _ => Err(IngestionError::Unsupported {
                message: format!("unknown file format '{s}'"),
            }),
        }
    }
}

/// Which worksheet to read from a workbook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetSelection {
    /// The first sheet in workbook order.
    #[default]
    First,
    Name(String),
    /// Zero-based position in workbook order.
    Index(usize),
}

impl SheetSelection {
    /// Build from the optional `sheet_name` / `sheet_index` pair of a request; the name wins.
    pub fn from_parts(name: Option<&str>, index: Option<usize>) -> Self {
        match (name, index) {
            (Some(n), _) => SheetSelection::Name(n.to_string()),
            (None, Some(i)) => SheetSelection::Index(i),
            (None, None) => SheetSelection::First,
        }
    }
}

/// Reader options that are not part of the column transformation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Field delimiter for delimited text. Defaults to `,` (CSV) or tab (TSV).
    pub delimiter: Option<u8>,
    /// WHATWG encoding label. `None` sniffs a BOM and falls back to UTF-8.
    pub encoding: Option<String>,
    pub sheet: SheetSelection,
}

/// Resolve the format to read a source with.
///
/// Order: `requested`, then the source record's type (when it names a file format), then the
/// extension of `path`.
pub fn resolve_format(
    requested: Option<SourceFormat>,
    source_type: Option<&str>,
    path: Option<&str>,
) -> IngestionResult<SourceFormat> {
    if let Some(f) = requested {
        return Ok(f);
    }
    if let Some(f) = source_type.and_then(|t| t.parse::<SourceFormat>().ok()) {
        return Ok(f);
    }
    if let Some(f) = path.and_then(SourceFormat::from_path) {
        return Ok(f);
    }
    Err(IngestionError::Unsupported {
        message: "cannot determine the file format; pass one explicitly".to_string(),
    })
}

/// Read one in-memory source file.
///
/// Text-bearing formats come back with raw text columns; see [`SourceFormat::is_text_bearing`].
pub fn read_bytes(format: SourceFormat, bytes: Bytes, options: &ReadOptions) -> IngestionResult<DataSet> {
    let encoding = options.encoding.as_deref();
    match format {
        SourceFormat::Csv => csv::read_csv(&bytes, options.delimiter.unwrap_or(b','), encoding),
        SourceFormat::Tsv => csv::read_csv(&bytes, options.delimiter.unwrap_or(b'\t'), encoding),
        SourceFormat::Json => json::read_json(&csv::decode_text(&bytes, encoding)?),
        SourceFormat::GeoJson => json::read_geojson(&csv::decode_text(&bytes, encoding)?),
        SourceFormat::Parquet => parquet::read_parquet(bytes),
        SourceFormat::Excel => read_excel_dispatch(bytes, &options.sheet),
    }
}

#[cfg(feature = "excel")]
fn read_excel_dispatch(bytes: Bytes, sheet: &SheetSelection) -> IngestionResult<DataSet> {
    super::excel::read_excel(bytes.to_vec(), sheet)
}

#[cfg(not(feature = "excel"))]
fn read_excel_dispatch(_bytes: Bytes, _sheet: &SheetSelection) -> IngestionResult<DataSet> {
    Err(IngestionError::Unsupported {
        message: "excel reading not enabled (enable cargo feature 'excel')".to_string(),
    })
}
