use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::CacheError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheSettings {
    #[serde(default)]
    pub cache: CacheConfig,
    /// Redis connection for the L2 tier and cross-instance invalidation
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CacheSettings {
    pub fn validate(&self) -> Result<(), CacheError> {
        self.cache.validate()?;
        if self.cache.l2_enabled {
            self.redis.validate()?;
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(CacheError::config(format!(
                "logging.level must be one of {valid_levels:?}"
            )));
        }
        Ok(())
    }
}

/// Cache engine configuration.
///
/// Validated once when the orchestrator is built and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries held by the in-process tier
    #[serde(default = "default_l1_max_entries")]
    pub l1_max_entries: usize,

    /// Maximum resident bytes (keys + serialized payloads) of the in-process tier
    #[serde(default = "default_l1_max_memory_bytes")]
    pub l1_max_memory_bytes: usize,

    /// Largest single item accepted by the in-process tier
    #[serde(default = "default_l1_max_item_bytes")]
    pub l1_max_item_bytes: usize,

    /// Enable the remote (Redis) tier
    /// Default: false (single-instance deployments run L1-only)
    #[serde(default)]
    pub l2_enabled: bool,

    /// Upper bound for every remote call; a timed-out call counts as a failure
    #[serde(default = "default_l2_timeout_ms")]
    pub l2_timeout_ms: u64,

    /// Compress remote payloads larger than `compression_threshold_bytes`
    #[serde(default = "default_compression_enabled")]
    pub compression_enabled: bool,

    #[serde(default = "default_compression_threshold_bytes")]
    pub compression_threshold_bytes: usize,

    /// TTL applied when a call does not specify one (0 = no expiry)
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u64,

    /// Interval of the proactive TTL sweep over the in-process tier
    #[serde(default = "default_sweep_interval_seconds")]
    pub background_sweep_interval_seconds: u64,

    /// Pending remote writes buffered for the write-behind policy
    #[serde(default = "default_write_behind_queue_capacity")]
    pub write_behind_queue_capacity: usize,

    /// Namespace prepended to every remote key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Named invalidation domains, e.g. `appointments` -> tags + key patterns
    #[serde(default)]
    pub invalidation_routes: HashMap<String, InvalidationRoute>,
}

/// What a named invalidation domain expands to.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct InvalidationRoute {
    #[serde(default)]
    pub tags: Vec<String>,
    /// Glob patterns (`*`, `?`) over cache keys
    #[serde(default)]
    pub patterns: Vec<String>,
}

fn default_l1_max_entries() -> usize {
    10_000
}

fn default_l1_max_memory_bytes() -> usize {
    64 * 1024 * 1024 // 64 MiB
}

fn default_l1_max_item_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_l2_timeout_ms() -> u64 {
    500
}

fn default_compression_enabled() -> bool {
    true
}

fn default_compression_threshold_bytes() -> usize {
    1024
}

fn default_ttl_seconds() -> u64 {
    300
}

fn default_sweep_interval_seconds() -> u64 {
    300 // 5 minutes
}

fn default_write_behind_queue_capacity() -> usize {
    1024
}

fn default_key_prefix() -> String {
    "octofhir:cache".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_entries: default_l1_max_entries(),
            l1_max_memory_bytes: default_l1_max_memory_bytes(),
            l1_max_item_bytes: default_l1_max_item_bytes(),
            l2_enabled: false,
            l2_timeout_ms: default_l2_timeout_ms(),
            compression_enabled: default_compression_enabled(),
            compression_threshold_bytes: default_compression_threshold_bytes(),
            default_ttl_seconds: default_ttl_seconds(),
            background_sweep_interval_seconds: default_sweep_interval_seconds(),
            write_behind_queue_capacity: default_write_behind_queue_capacity(),
            key_prefix: default_key_prefix(),
            invalidation_routes: HashMap::new(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.l1_max_entries == 0 {
            return Err(CacheError::config("cache.l1_max_entries must be > 0"));
        }
        if self.l1_max_memory_bytes == 0 {
            return Err(CacheError::config("cache.l1_max_memory_bytes must be > 0"));
        }
        if self.l1_max_item_bytes == 0 {
            return Err(CacheError::config("cache.l1_max_item_bytes must be > 0"));
        }
        if self.l1_max_item_bytes > self.l1_max_memory_bytes {
            return Err(CacheError::config(
                "cache.l1_max_item_bytes must be <= cache.l1_max_memory_bytes",
            ));
        }
        if self.l2_timeout_ms == 0 {
            return Err(CacheError::config("cache.l2_timeout_ms must be > 0"));
        }
        if self.background_sweep_interval_seconds == 0 {
            return Err(CacheError::config(
                "cache.background_sweep_interval_seconds must be > 0",
            ));
        }
        if self.write_behind_queue_capacity == 0 {
            return Err(CacheError::config(
                "cache.write_behind_queue_capacity must be > 0",
            ));
        }
        if self.key_prefix.is_empty() {
            return Err(CacheError::config("cache.key_prefix must not be empty"));
        }
        if self.key_prefix.contains(['*', '?', '[', ']', '\\']) {
            return Err(CacheError::config(
                "cache.key_prefix must not contain glob metacharacters",
            ));
        }
        for (domain, route) in &self.invalidation_routes {
            if route.tags.is_empty() && route.patterns.is_empty() {
                return Err(CacheError::config(format!(
                    "cache.invalidation_routes.{domain} must list at least one tag or pattern"
                )));
            }
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.background_sweep_interval_seconds)
    }

    pub fn l2_timeout(&self) -> Duration {
        Duration::from_millis(self.l2_timeout_ms)
    }
}

/// Redis configuration for the shared tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Broadcast invalidations to other instances over Redis Pub/Sub
    #[serde(default)]
    pub pubsub_enabled: bool,

    #[serde(default = "default_invalidation_channel")]
    pub invalidation_channel: String,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

fn default_invalidation_channel() -> String {
    "cache:invalidate".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            pubsub_enabled: false,
            invalidation_channel: default_invalidation_channel(),
        }
    }
}

impl RedisConfig {
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.url.is_empty() {
            return Err(CacheError::config("redis.url must not be empty"));
        }
        if self.pool_size == 0 {
            return Err(CacheError::config("redis.pool_size must be > 0"));
        }
        if self.pubsub_enabled && self.invalidation_channel.is_empty() {
            return Err(CacheError::config(
                "redis.pubsub_enabled=true requires redis.invalidation_channel",
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::CacheSettings;
    use crate::error::CacheError;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Default settings file looked up in the working directory.
    pub const DEFAULT_CONFIG_FILE: &str = "octofhir-cache.toml";

    pub fn load_settings(path: Option<&str>) -> Result<CacheSettings, CacheError> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., OCTOFHIR_CACHE__CACHE__L1_MAX_ENTRIES=500
        builder = builder.add_source(
            Environment::with_prefix("OCTOFHIR_CACHE")
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| CacheError::config(format!("config build error: {e}")))?;
        let merged: CacheSettings = cfg
            .try_deserialize()
            .map_err(|e| CacheError::config(format!("config deserialize error: {e}")))?;
        merged.validate()?;
        Ok(merged)
    }
}
