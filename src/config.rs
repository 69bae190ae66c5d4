//! Pipeline configuration.
//!
//! Tunables for batching, the executor pool, and the retry policy, with
//! sensible defaults, named profiles, TOML file loading, and environment
//! variable overrides (`PENSTOCK_*`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// A configuration value is invalid
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue { key, value, reason } => {
                write!(f, "Invalid configuration for {}: '{}' ({})", key, value, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_flush_interval_ms() -> u64 {
    50
}

/// Tunables for the write pipeline.
///
/// `max_batch_items` and `max_batch_bytes` bound every batch the coordinator
/// assembles. The pool sizes and `queue_depth` bound how many bulk calls can
/// be queued or in flight at once; a full work queue blocks further
/// submission, which is the pipeline's only throttle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum number of items per batch.
    pub max_batch_items: usize,
    /// Maximum cumulative payload bytes per batch. A single item larger than
    /// this bound is still admitted into an otherwise empty batch so an
    /// oversized mutation cannot stall the pipeline.
    pub max_batch_bytes: usize,
    /// Workers the executor keeps ready when idle.
    pub pool_core_size: usize,
    /// Upper bound on concurrent bulk calls.
    pub pool_max_size: usize,
    /// Depth of the bounded work queue in front of the pool.
    pub queue_depth: usize,
    /// Per-call timeout in milliseconds. A timed-out call is a transport
    /// failure and requeues the whole batch.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Computed call timeout Duration (not serialized).
    #[serde(skip)]
    pub call_timeout: Duration,
    /// Backend failures tolerated per item before it is permanently dropped.
    pub max_fail_count: u32,
    /// Interval of the optional background flusher in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Computed flush interval Duration (not serialized).
    #[serde(skip)]
    pub flush_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch_items: 500,
            max_batch_bytes: 5 * 1024 * 1024, // 5 MiB
            pool_core_size: 2,
            pool_max_size: 8,
            queue_depth: 32,
            call_timeout_ms: 30_000,
            call_timeout: Duration::from_millis(30_000),
            max_fail_count: 5,
            flush_interval_ms: 50,
            flush_interval: Duration::from_millis(50),
        }
    }
}

impl PipelineConfig {
    /// Create a config optimized for ingest throughput (bigger batches,
    /// deeper queue, more concurrent calls).
    pub fn high_throughput() -> Self {
        Self {
            max_batch_items: 1000,
            max_batch_bytes: 10 * 1024 * 1024, // 10 MiB
            pool_max_size: 16,
            queue_depth: 64,
            ..Self::default()
        }
    }

    /// Create a config optimized for low latency (small batches flushed
    /// aggressively).
    pub fn low_latency() -> Self {
        Self {
            max_batch_items: 50,
            max_batch_bytes: 512 * 1024, // 512 KiB
            flush_interval_ms: 5,
            flush_interval: Duration::from_millis(5),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables, starting from defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_batch_items: Self::env_usize("PENSTOCK_MAX_BATCH_ITEMS").unwrap_or(defaults.max_batch_items),
            max_batch_bytes: Self::env_usize("PENSTOCK_MAX_BATCH_BYTES").unwrap_or(defaults.max_batch_bytes),
            pool_core_size: Self::env_usize("PENSTOCK_POOL_CORE_SIZE").unwrap_or(defaults.pool_core_size),
            pool_max_size: Self::env_usize("PENSTOCK_POOL_MAX_SIZE").unwrap_or(defaults.pool_max_size),
            queue_depth: Self::env_usize("PENSTOCK_QUEUE_DEPTH").unwrap_or(defaults.queue_depth),
            call_timeout_ms: Self::env_u64("PENSTOCK_CALL_TIMEOUT_MS").unwrap_or(defaults.call_timeout_ms),
            max_fail_count: Self::env_u32("PENSTOCK_MAX_FAIL_COUNT").unwrap_or(defaults.max_fail_count),
            flush_interval_ms: Self::env_u64("PENSTOCK_FLUSH_INTERVAL_MS").unwrap_or(defaults.flush_interval_ms),
            ..defaults
        }
        .finalize()
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|e| ConfigError::InvalidValue {
            key: "config".to_string(),
            value: contents.chars().take(64).collect(),
            reason: format!("Failed to parse TOML: {}", e),
        })?;
        Ok(config.finalize())
    }

    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::InvalidValue {
            key: "config_file".to_string(),
            value: path.as_ref().display().to_string(),
            reason: format!("Failed to read file: {}", e),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Finalize config by computing Durations from their millisecond fields.
    /// Call this after deserializing or editing the `*_ms` fields directly.
    pub fn finalize(mut self) -> Self {
        self.call_timeout = Duration::from_millis(self.call_timeout_ms);
        self.flush_interval = Duration::from_millis(self.flush_interval_ms);
        self
    }

    /// Validate all values, returning the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_items == 0 {
            return Err(Self::invalid("max_batch_items", self.max_batch_items, "must be at least 1"));
        }
        if self.max_batch_bytes == 0 {
            return Err(Self::invalid("max_batch_bytes", self.max_batch_bytes, "must be at least 1"));
        }
        if self.pool_max_size == 0 {
            return Err(Self::invalid("pool_max_size", self.pool_max_size, "must be at least 1"));
        }
        if self.pool_core_size > self.pool_max_size {
            return Err(Self::invalid(
                "pool_core_size",
                self.pool_core_size,
                "must not exceed pool_max_size",
            ));
        }
        if self.queue_depth == 0 {
            return Err(Self::invalid("queue_depth", self.queue_depth, "must be at least 1"));
        }
        if self.call_timeout_ms == 0 {
            return Err(Self::invalid("call_timeout_ms", self.call_timeout_ms, "must be at least 1"));
        }
        if self.max_fail_count == 0 {
            return Err(Self::invalid("max_fail_count", self.max_fail_count, "must be at least 1"));
        }
        if self.flush_interval_ms == 0 {
            return Err(Self::invalid("flush_interval_ms", self.flush_interval_ms, "must be at least 1"));
        }
        Ok(())
    }

    fn invalid(key: &str, value: impl std::fmt::Display, reason: &str) -> ConfigError {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    fn env_usize(key: &str) -> Option<usize> {
        std::env::var(key).ok().and_then(|v| v.parse().ok())
    }

    fn env_u64(key: &str) -> Option<u64> {
        std::env::var(key).ok().and_then(|v| v.parse().ok())
    }

    fn env_u32(key: &str) -> Option<u32> {
        std::env::var(key).ok().and_then(|v| v.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_batch_items, 500);
        assert_eq!(config.max_batch_bytes, 5 * 1024 * 1024);
        assert_eq!(config.call_timeout, Duration::from_millis(30_000));
    }

    #[test]
    fn profiles_are_valid() {
        let high = PipelineConfig::high_throughput();
        assert!(high.validate().is_ok());
        assert_eq!(high.max_batch_items, 1000);
        assert_eq!(high.pool_max_size, 16);

        let low = PipelineConfig::low_latency();
        assert!(low.validate().is_ok());
        assert_eq!(low.max_batch_items, 50);
        assert_eq!(low.flush_interval, Duration::from_millis(5));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let config = PipelineConfig {
            max_batch_items: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_core_larger_than_max() {
        let config = PipelineConfig {
            pool_core_size: 9,
            pool_max_size: 8,
            ..PipelineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pool_core_size"));
    }

    #[test]
    fn toml_round_trip() {
        let toml = r#"
            max_batch_items = 100
            max_batch_bytes = 1048576
            pool_core_size = 1
            pool_max_size = 4
            queue_depth = 16
            call_timeout_ms = 5000
            max_fail_count = 3
        "#;
        let config = PipelineConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.max_batch_items, 100);
        assert_eq!(config.call_timeout, Duration::from_millis(5000));
        // Omitted fields with serde defaults fall back.
        assert_eq!(config.flush_interval_ms, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_file_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("penstock.toml");
        std::fs::write(
            &path,
            "max_batch_items = 7\nmax_batch_bytes = 64\npool_core_size = 1\npool_max_size = 2\nqueue_depth = 4\nmax_fail_count = 2\n",
        )
        .unwrap();
        let config = PipelineConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.max_batch_items, 7);
        assert_eq!(config.max_batch_bytes, 64);
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("PENSTOCK_MAX_BATCH_ITEMS", "42");
        std::env::set_var("PENSTOCK_CALL_TIMEOUT_MS", "1234");
        let config = PipelineConfig::from_env();
        std::env::remove_var("PENSTOCK_MAX_BATCH_ITEMS");
        std::env::remove_var("PENSTOCK_CALL_TIMEOUT_MS");

        assert_eq!(config.max_batch_items, 42);
        assert_eq!(config.call_timeout, Duration::from_millis(1234));
        assert_eq!(config.pool_max_size, PipelineConfig::default().pool_max_size);
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(PipelineConfig::from_toml_str("max_batch_items = \"many\"").is_err());
    }
}
