//! Output writer: encodes a [`DataSet`] as Parquet and stores it on a local path or an object
//! store.
//!
//! Outputs live under `{output_root}/org-{organization_id}/processed/{source_id}/v{version}/data.parquet`
//! (see [`output_location`]).

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::ingestion::Location;
use crate::types::DataSet;

mod parquet;

pub use self::parquet::{EMPTY_COLUMN, encode_parquet};

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Highest ratio.
    #[default]
    Zstd,
    /// Faster, lower ratio.
    Snappy,
    #[serde(alias = "uncompressed")]
    None,
}

impl Compression {
    pub const ALL: [Compression; 3] = [Compression::Zstd, Compression::Snappy, Compression::None];

    pub fn as_str(self) -> &'static str {
        match self {
            Compression::Zstd => "zstd",
            Compression::Snappy => "snappy",
            Compression::None => "none",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = OutputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zstd" => Ok(Compression::Zstd),
            "snappy" => Ok(Compression::Snappy),
            "none" | "uncompressed" => Ok(Compression::None),
            other => Err(OutputError::UnknownCompression(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum OutputError {
    /// The target or an output option is unusable.
    #[error("invalid output: {0}")]
    InvalidLocation(String),

    #[error("unknown compression '{0}' (expected zstd, snappy or none)")]
    UnknownCompression(String),

    #[error("parquet encoding failed: {0}")]
    Parquet(#[from] ::parquet::errors::ParquetError),

    #[error("parquet encoding failed: {0}")]
    Encode(String),

    #[error("output write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("output upload failed: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// The conversion was abandoned before the output was published.
    #[error("output write cancelled")]
    Cancelled,
}

/// Figures reported for one written output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OutputSummary {
    pub rows: usize,
    pub columns: usize,
    pub bytes: u64,
    pub elapsed: Duration,
}

/// `{root}/org-{organization_id}/processed/{source_id}/v{version}/data.parquet`
pub fn output_location(root: &Location, organization_id: &str, source_id: &str, version: u32) -> Location {
    root.join(&format!("org-{organization_id}/processed/{source_id}/v{version}/data.parquet"))
}

/// Store `bytes` at `target`.
///
/// Local targets are written to a temporary sibling and renamed into place, so a reader never
/// sees a partial file. Object-store targets receive a single `put`. Nothing is published once
/// `cancel` has fired; the blocking writer outlives a dropped caller and checks it before the
/// rename.
pub async fn write_bytes(target: &Location, bytes: Bytes, cancel: &CancellationToken) -> Result<u64, OutputError> {
    let size = bytes.len() as u64;
    if cancel.is_cancelled() {
        return Err(OutputError::Cancelled);
    }
    match target {
        Location::Local(path) => {
            let path = path.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || -> Result<(), OutputError> {
                let parent = path
                    .parent()
                    .ok_or_else(|| OutputError::InvalidLocation(format!("'{}' has no parent directory", path.display())))?;
                std::fs::create_dir_all(parent)?;
                let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
                let tmp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
                std::fs::write(&tmp, &bytes)?;
                if cancel.is_cancelled() {
                    let _ = std::fs::remove_file(&tmp);
                    return Err(OutputError::Cancelled);
                }
                if let Err(e) = std::fs::rename(&tmp, &path) {
                    let _ = std::fs::remove_file(&tmp);
                    return Err(e.into());
                }
                Ok(())
            })
            .await
            .map_err(|e| OutputError::Encode(format!("output task failed: {e}")))??;
        }
        Location::Remote { store, path, .. } => {
            store.put(path, bytes.into()).await?;
        }
    }
    Ok(size)
}

/// Encode `ds` off the async runtime and store it at `target` unless `cancel` fires first.
pub async fn write_dataset(
    ds: DataSet,
    target: &Location,
    compression: Compression,
    row_group_size: usize,
    cancel: &CancellationToken,
) -> Result<OutputSummary, OutputError> {
    let started = Instant::now();
    let (rows, columns) = (ds.row_count(), ds.column_count());
    let encoded = tokio::task::spawn_blocking(move || encode_parquet(&ds, compression, row_group_size))
        .await
        .map_err(|e| OutputError::Encode(format!("encoder task failed: {e}")))??;
    let bytes = write_bytes(target, Bytes::from(encoded), cancel).await?;
    let elapsed = started.elapsed();
    info!(location = %target, rows, columns, bytes, compression = %compression, "output written");
    Ok(OutputSummary {
        rows,
        columns,
        bytes,
        elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::parse_location;
    use crate::types::{DataType, Field, Schema, Value};
    use std::collections::HashMap;

    fn tiny() -> DataSet {
        DataSet::new(
            Schema::new(vec![Field::new("a", DataType::Int64)]),
            vec![vec![Value::Int64(1)], vec![Value::Null]],
        )
    }

    #[test]
    fn compression_names() {
        assert_eq!("UNCOMPRESSED".parse::<Compression>().unwrap(), Compression::None);
        assert_eq!(serde_json::from_str::<Compression>("\"uncompressed\"").unwrap(), Compression::None);
        assert_eq!(Compression::default(), Compression::Zstd);
        assert!("lzma".parse::<Compression>().is_err());
    }

    #[test]
    fn output_paths_are_versioned() {
        let root = Location::Local("/data/out".into());
        let loc = output_location(&root, "o1", "s1", 3);
        assert_eq!(loc.to_string(), "/data/out/org-o1/processed/s1/v3/data.parquet");
    }

    #[tokio::test]
    async fn local_writes_leave_only_the_final_file() {
        let root = std::env::temp_dir().join(format!("out-{}", uuid::Uuid::new_v4()));
        let target = output_location(&Location::Local(root.clone()), "o", "s", 1);
        let summary = write_dataset(tiny(), &target, Compression::Zstd, 100, &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.rows, 2);

        let Location::Local(path) = &target else { unreachable!() };
        assert_eq!(std::fs::metadata(path).unwrap().len(), summary.bytes);
        let siblings = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(siblings, 1);
        std::fs::remove_dir_all(root).unwrap();
    }

    #[tokio::test]
    async fn object_store_targets_receive_one_put() {
        let root = parse_location("memory:///", &HashMap::new()).unwrap();
        let target = output_location(&root, "o", "s", 2);
        let summary = write_dataset(tiny(), &target, Compression::Snappy, 100, &CancellationToken::new()).await.unwrap();

        let Location::Remote { store, path, .. } = &target else { unreachable!() };
        let meta = store.head(path).await.unwrap();
        assert_eq!(meta.size as u64, summary.bytes);
        assert_eq!(path.as_ref(), "org-o/processed/s/v2/data.parquet");
    }

    #[tokio::test]
    async fn cancelled_writes_publish_nothing() {
        let root = std::env::temp_dir().join(format!("out-{}", uuid::Uuid::new_v4()));
        let target = output_location(&Location::Local(root.clone()), "o", "s", 4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = write_dataset(tiny(), &target, Compression::Zstd, 100, &cancel).await.unwrap_err();
        assert!(matches!(err, OutputError::Cancelled));

        let Location::Local(path) = &target else { unreachable!() };
        assert!(!path.exists());
        let leftovers = std::fs::read_dir(path.parent().unwrap()).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftovers, 0);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn cancelled_uploads_are_not_put() {
        let root = parse_location("memory:///", &HashMap::new()).unwrap();
        let target = output_location(&root, "o", "s", 5);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = write_dataset(tiny(), &target, Compression::None, 100, &cancel).await.unwrap_err();
        assert!(matches!(err, OutputError::Cancelled));

        let Location::Remote { store, path, .. } = &target else { unreachable!() };
        assert!(store.head(path).await.is_err());
    }
}
