//! Source location resolution and fetching.
//!
//! A location is either a local path (file, directory or glob pattern) or an object-store URI.
//! Sources live under `{source_root}/org-{organization_id}/uploads/{source_id}/`; the first file
//! (lexicographic order) carrying an extension of the requested format is used.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use object_store::ObjectStore;
use object_store::path::Path as StorePath;
use tracing::debug;
use url::Url;
use walkdir::WalkDir;

use crate::error::{IngestionError, IngestionResult};

use super::unified::SourceFormat;

/// A local or remote place sources are read from (or outputs written to).
#[derive(Clone)]
pub enum Location {
    Local(PathBuf),
    Remote {
        store: Arc<dyn ObjectStore>,
        path: StorePath,
        /// Original URI, kept for messages.
        uri: String,
    },
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(p) => f.debug_tuple("Local").field(p).finish(),
            Location::Remote { uri, .. } => f.debug_struct("Remote").field("uri", uri).finish(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(p) => write!(f, "{}", p.display()),
            Location::Remote { uri, .. } => f.write_str(uri),
        }
    }
}

impl Location {
    /// Append `/`-separated segments.
    pub fn join(&self, segments: &str) -> Location {
        let parts = segments.split('/').filter(|s| !s.is_empty());
        match self {
            Location::Local(p) => Location::Local(parts.fold(p.clone(), |acc, s| acc.join(s))),
            Location::Remote { store, path, uri } => {
                let mut uri = uri.clone();
                let mut path = path.clone();
                for s in parts {
                    path = path.child(s);
                    if !uri.ends_with('/') {
                        uri.push('/');
                    }
                    uri.push_str(s);
                }
                Location::Remote {
                    store: Arc::clone(store),
                    path,
                    uri,
                }
            }
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Location::Local(_))
    }
}

/// Parse a root or source location.
///
/// Plain paths and `file://` URIs are local; any other scheme goes through `object_store`, with
/// `storage_options` handed to the store builder (credentials, region, endpoint, ...).
pub fn parse_location(uri: &str, storage_options: &HashMap<String, String>) -> IngestionResult<Location> {
    if !uri.contains("://") {
        return Ok(Location::Local(PathBuf::from(uri)));
    }
    let url = Url::parse(uri).map_err(|e| IngestionError::Unsupported {
        message: format!("invalid location '{uri}': {e}"),
    })?;
    if url.scheme() == "file" {
        let path = url.to_file_path().map_err(|()| IngestionError::Unsupported {
            message: format!("invalid file location '{uri}'"),
        })?;
        return Ok(Location::Local(path));
    }
    let (store, path) = object_store::parse_url_opts(&url, storage_options.iter())?;
    Ok(Location::Remote {
        store: Arc::from(store),
        path,
        uri: uri.strip_suffix('/').unwrap_or(uri).to_string(),
    })
}

/// Where the uploads of one source live.
pub fn source_prefix(root: &Location, organization_id: &str, source_id: &str) -> Location {
    root.join(&format!("org-{organization_id}/uploads/{source_id}"))
}

/// One fetched source file.
#[derive(Debug, Clone)]
pub struct FetchedSource {
    /// Path or URI of the file that was read.
    pub name: String,
    pub bytes: Bytes,
}

impl FetchedSource {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Locate and read the source file for `format` under `location`.
///
/// Files larger than `max_bytes` are rejected before they are read.
pub async fn fetch_source(location: &Location, format: SourceFormat, max_bytes: u64) -> IngestionResult<FetchedSource> {
    match location {
        Location::Local(path) => {
            let path = path.clone();
            tokio::task::spawn_blocking(move || fetch_local(&path, format, max_bytes))
                .await
                .map_err(|e| IngestionError::Io(std::io::Error::other(e)))?
        }
        Location::Remote { store, path, uri } => fetch_remote(store.as_ref(), path, uri, format, max_bytes).await,
    }
}

fn fetch_local(path: &FsPath, format: SourceFormat, max_bytes: u64) -> IngestionResult<FetchedSource> {
    let file = find_local(path, format)?;
    let size = std::fs::metadata(&file)?.len();
    check_size(size, max_bytes)?;
    debug!(path = %file.display(), size, "reading local source");
    let bytes = std::fs::read(&file)?;
    Ok(FetchedSource {
        name: file.display().to_string(),
        bytes: Bytes::from(bytes),
    })
}

fn find_local(path: &FsPath, format: SourceFormat) -> IngestionResult<PathBuf> {
    let matches = |p: &FsPath| p.to_str().is_some_and(|s| format.matches_path(s));
    let text = path.to_string_lossy();

    let mut candidates: Vec<PathBuf> = if text.contains(['*', '?', '[']) {
        glob::glob(&text)
            .map_err(|e| IngestionError::Unsupported {
                message: format!("invalid glob pattern '{text}': {e}"),
            })?
            .filter_map(Result::ok)
            .filter(|p| p.is_file() && matches(p))
            .collect()
    } else if path.is_file() {
        return Ok(path.to_path_buf());
    } else if path.is_dir() {
        WalkDir::new(path)
            .follow_links(true)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file() && matches(e.path()))
            .map(walkdir::DirEntry::into_path)
            .collect()
    } else {
        Vec::new()
    };

    candidates.sort();
    candidates.into_iter().next().ok_or_else(|| IngestionError::NotFound {
        message: format!("no {format} file found at {}", path.display()),
    })
}

async fn fetch_remote(
    store: &dyn ObjectStore,
    path: &StorePath,
    uri: &str,
    format: SourceFormat,
    max_bytes: u64,
) -> IngestionResult<FetchedSource> {
    let meta = match store.head(path).await {
        Ok(meta) if format.matches_path(meta.location.as_ref()) => meta,
        _ => {
            let listing = store.list_with_delimiter(Some(path)).await?;
            let mut objects: Vec<_> = listing
                .objects
                .into_iter()
                .filter(|m| format.matches_path(m.location.as_ref()))
                .collect();
            objects.sort_by_key(|m| m.location.to_string());
            objects.into_iter().next().ok_or_else(|| IngestionError::NotFound {
                message: format!("no {format} file found at {uri}"),
            })?
        }
    };
    check_size(u64::try_from(meta.size).unwrap_or(u64::MAX), max_bytes)?;
    debug!(object = %meta.location, size = meta.size, "reading remote source");
    let bytes = store.get(&meta.location).await?.bytes().await?;
    Ok(FetchedSource {
        name: meta.location.to_string(),
        bytes,
    })
}

fn check_size(size: u64, max_bytes: u64) -> IngestionResult<()> {
    if size > max_bytes {
        return Err(IngestionError::TooLarge {
            size_mb: size as f64 / (1024.0 * 1024.0),
            limit_mb: max_bytes / (1024 * 1024),
        });
    }
    Ok(())
}
