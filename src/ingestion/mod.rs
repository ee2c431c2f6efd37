//! Source reading: locating a source file, decoding it into a [`crate::types::DataSet`], and
//! reporting conversion outcomes.
//!
//! Most callers go through [`fetch_source`] and [`read_bytes`]:
//!
//! - [`resolve_format`] picks the format (override, source record type, then file extension)
//! - [`fetch_source`] finds the first matching file under a local or object-store [`Location`]
//! - [`read_bytes`] decodes it with the format's reader
//!
//! Format-specific readers are also available under:
//! - [`csv`]
//! - [`json`]
//! - [`parquet`]
//! - `excel` (cargo feature `excel`)

pub(crate) mod columns;
pub mod csv;
#[cfg(feature = "excel")]
pub mod excel;
pub mod json;
pub mod location;
pub mod observability;
pub mod parquet;
pub mod unified;

pub use location::{FetchedSource, Location, fetch_source, parse_location, source_prefix};
pub use observability::{
    CompositeObserver, ConversionContext, ConversionObserver, ConversionStats, FileObserver, Severity,
    TracingObserver, notify, severity_for_error,
};
pub use unified::{ReadOptions, SheetSelection, SourceFormat, read_bytes, resolve_format};
