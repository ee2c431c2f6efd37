//! Service configuration.
//!
//! Loaded once at startup with `figment` in layers: compiled defaults, then an optional TOML file,
//! then environment variables prefixed `TABULAR_` (nested keys separated by `__`, e.g.
//! `TABULAR_RETRY__MAX_ATTEMPTS=5`).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::output::Compression;
use crate::retry::RetryPolicy;

/// Hard upper bound on partitions per extraction.
pub const PARTITION_CEILING: usize = 16;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Retry settings applied to every remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Relative jitter in `[0, 1]` applied to each backoff.
    pub jitter: f64,
    /// Timeout for a single attempt.
    pub attempt_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            jitter: 0.2,
            attempt_timeout_secs: 300,
        }
    }
}

impl RetryConfig {
    /// Build the backoff policy these settings describe.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.jitter,
            self.max_attempts,
        )
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub max_file_size_mb: u64,
    pub max_processing_time_secs: u64,
    /// Advisory memory ceiling reported through capabilities.
    pub memory_limit_mb: u64,
    /// Worker threads for the CPU-bound pool. `None` uses available parallelism.
    pub worker_threads: Option<usize>,
    pub default_row_limit: usize,
    pub max_row_limit: usize,
    pub default_compression: Compression,
    pub default_row_group_size: usize,
    pub max_partitions: usize,
    pub max_concurrent_conversions: usize,
    pub credential_cache_ttl_secs: u64,
    pub retry: RetryConfig,
    /// Root under which uploaded sources live (local directory or object-store URI).
    pub source_root: String,
    /// Root under which converted outputs are written (local directory or object-store URI).
    pub output_root: String,
    /// Options handed to the object-store builder (region, endpoint, keys, ...).
    pub storage_options: HashMap<String, String>,
    /// Optional path of the lineage log appended to by the file observer.
    pub lineage_log: Option<String>,
    pub log_level: String,
    /// `text` or `json`.
    pub log_format: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 250,
            max_processing_time_secs: 600,
            memory_limit_mb: 6144,
            worker_threads: None,
            default_row_limit: 100_000,
            max_row_limit: 10_000_000,
            default_compression: Compression::Zstd,
            default_row_group_size: 100_000,
            max_partitions: PARTITION_CEILING,
            max_concurrent_conversions: 5,
            credential_cache_ttl_secs: 3600,
            retry: RetryConfig::default(),
            source_root: "data".to_string(),
            output_root: "data".to_string(),
            storage_options: HashMap::new(),
            lineage_log: None,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Load defaults, then `path` (if given and present), then `TABULAR_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(ServiceConfig::default()));
        if let Some(path) = path {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }
        figment = figment.merge(Env::prefixed("TABULAR_").split("__"));
        let config: ServiceConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.max_file_size_mb == 0 {
            return invalid("max_file_size_mb must be > 0");
        }
        if self.max_processing_time_secs == 0 {
            return invalid("max_processing_time_secs must be > 0");
        }
        if self.worker_threads == Some(0) {
            return invalid("worker_threads must be > 0 when set");
        }
        if self.default_row_limit == 0 || self.max_row_limit == 0 {
            return invalid("row limits must be > 0");
        }
        if self.default_row_limit > self.max_row_limit {
            return invalid("default_row_limit must not exceed max_row_limit");
        }
        if self.default_row_group_size == 0 {
            return invalid("default_row_group_size must be > 0");
        }
        if self.max_partitions == 0 || self.max_partitions > PARTITION_CEILING {
            return Err(ConfigError::Invalid(format!(
                "max_partitions must be between 1 and {PARTITION_CEILING}"
            )));
        }
        if self.max_concurrent_conversions == 0 {
            return invalid("max_concurrent_conversions must be > 0");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be > 0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid("retry.jitter must be within [0, 1]");
        }
        if !matches!(self.log_format.as_str(), "text" | "json") {
            return invalid("log_format must be 'text' or 'json'");
        }
        Ok(())
    }

    pub fn max_processing_time(&self) -> Duration {
        Duration::from_secs(self.max_processing_time_secs)
    }

    pub fn credential_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.credential_cache_ttl_secs)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServiceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.default_compression, Compression::Zstd);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn rejects_partitions_above_ceiling() {
        let config = ServiceConfig {
            max_partitions: 17,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_default_row_limit_above_max() {
        let config = ServiceConfig {
            default_row_limit: 20,
            max_row_limit: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!(
            "tabular-convert-config-{}.toml",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(
            &path,
            "max_partitions = 4\ndefault_compression = \"snappy\"\n[retry]\nmax_attempts = 5\n",
        )
        .unwrap();

        let config = ServiceConfig::load(Some(&path)).unwrap();
        assert_eq!(config.max_partitions, 4);
        assert_eq!(config.default_compression, Compression::Snappy);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, 500);

        let _ = std::fs::remove_file(&path);
    }
}
