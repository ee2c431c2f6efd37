//! Credential resolution and caching.
//!
//! Credentials are looked up by reference through a [`CredentialResolver`] (a secret store in
//! production). [`CredentialCache`] memoizes resolutions for a TTL; it is constructed once and
//! handed to whoever needs it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use super::ConnectorCredentials;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential '{0}' not found")]
    NotFound(String),
    #[error("access to credential '{0}' denied")]
    PermissionDenied(String),
    /// The store could not be reached or returned something unreadable.
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

/// Resolves a credential reference to connection parameters.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<ConnectorCredentials, CredentialError>;
}

/// In-memory credentials, for embedding and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    entries: HashMap<String, ConnectorCredentials>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reference: impl Into<String>, credentials: ConnectorCredentials) -> Self {
        self.entries.insert(reference.into(), credentials);
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticResolver {
    async fn resolve(&self, reference: &str) -> Result<ConnectorCredentials, CredentialError> {
        self.entries
            .get(reference)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(reference.to_string()))
    }
}

static FILE_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid regex"));

/// Reads `{dir}/{reference}.json` files (e.g. mounted secrets).
#[derive(Debug, Clone)]
pub struct JsonFileResolver {
    dir: PathBuf,
}

impl JsonFileResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl CredentialResolver for JsonFileResolver {
    async fn resolve(&self, reference: &str) -> Result<ConnectorCredentials, CredentialError> {
        if !FILE_REFERENCE.is_match(reference) {
            return Err(CredentialError::NotFound(reference.to_string()));
        }
        let path = self.dir.join(format!("{reference}.json"));
        let reference = reference.to_string();
        tokio::task::spawn_blocking(move || {
            let text = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => CredentialError::NotFound(reference.clone()),
                std::io::ErrorKind::PermissionDenied => CredentialError::PermissionDenied(reference.clone()),
                _ => CredentialError::Unavailable(e.to_string()),
            })?;
            serde_json::from_str(&text)
                .map_err(|e| CredentialError::Unavailable(format!("credential '{reference}' is malformed: {e}")))
        })
        .await
        .map_err(|e| CredentialError::Unavailable(e.to_string()))?
    }
}

struct CacheEntry {
    credentials: Arc<ConnectorCredentials>,
    fetched_at: Instant,
}

/// TTL cache in front of a [`CredentialResolver`].
///
/// Read-mostly; a stale entry may be served until its TTL lapses. Failed resolutions are not
/// cached.
pub struct CredentialCache {
    resolver: Arc<dyn CredentialResolver>,
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl CredentialCache {
    pub fn new(resolver: Arc<dyn CredentialResolver>, ttl: Duration) -> Self {
        Self {
            resolver,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, reference: &str) -> Result<Arc<ConnectorCredentials>, CredentialError> {
        if let Some(entry) = self.entries.read().await.get(reference) {
            if entry.fetched_at.elapsed() < self.ttl {
                debug!(reference, "credential cache hit");
                return Ok(Arc::clone(&entry.credentials));
            }
        }

        let credentials = Arc::new(self.resolver.resolve(reference).await?);
        debug!(reference, "credential resolved");
        self.entries.write().await.insert(
            reference.to_string(),
            CacheEntry {
                credentials: Arc::clone(&credentials),
                fetched_at: Instant::now(),
            },
        );
        Ok(credentials)
    }

    pub async fn invalidate(&self, reference: &str) {
        self.entries.write().await.remove(reference);
    }

    /// Drop expired entries.
    pub async fn purge_expired(&self) {
        let ttl = self.ttl;
        self.entries.write().await.retain(|_, e| e.fetched_at.elapsed() < ttl);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CredentialResolver for Counting {
        async fn resolve(&self, reference: &str) -> Result<ConnectorCredentials, CredentialError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if reference == "missing" {
                return Err(CredentialError::NotFound(reference.into()));
            }
            Ok(ConnectorCredentials {
                host: Some(format!("{reference}.db")),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn hits_are_served_until_the_ttl_lapses() {
        let resolver = Arc::new(Counting { calls: AtomicU32::new(0) });
        let cache = CredentialCache::new(resolver.clone(), Duration::from_secs(3600));
        let a = cache.get("a").await.unwrap();
        let b = cache.get("a").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

        cache.invalidate("a").await;
        cache.get("a").await.unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_ttl_always_resolves_and_errors_are_not_cached() {
        let resolver = Arc::new(Counting { calls: AtomicU32::new(0) });
        let cache = CredentialCache::new(resolver.clone(), Duration::ZERO);
        cache.get("a").await.unwrap();
        cache.get("a").await.unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);

        assert_eq!(
            cache.get("missing").await.unwrap_err(),
            CredentialError::NotFound("missing".into())
        );
        cache.purge_expired().await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn json_files_resolve_by_reference() {
        let dir = std::env::temp_dir().join(format!("creds-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("warehouse.json"), r#"{"host":"db","port":5439,"username":"u"}"#).unwrap();

        let resolver = JsonFileResolver::new(&dir);
        let creds = resolver.resolve("warehouse").await.unwrap();
        assert_eq!(creds.port, Some(5439));
        assert_eq!(creds.host.as_deref(), Some("db"));
        assert!(matches!(resolver.resolve("nope").await, Err(CredentialError::NotFound(_))));
        assert!(matches!(resolver.resolve("../etc/passwd").await, Err(CredentialError::NotFound(_))));
        std::fs::remove_dir_all(dir).unwrap();
    }
}
