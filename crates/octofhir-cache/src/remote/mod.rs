//! Shared remote tier (L2).
//!
//! ## Key Layout
//!
//! ```text
//! {prefix}:k:{key}                   serialized entry envelope
//! {prefix}:t:{urlencoded tag}:{key}  tag marker, same TTL as the entry
//! ```
//!
//! Tag invalidation deletes `{prefix}:t:{tag}:*`. The tag segment is
//! url-encoded, so it contains neither `:` nor glob metacharacters and the
//! pattern only ever matches markers of that exact tag. A tagged entry is
//! served only while all of its markers still exist.
//!
//! ## Graceful Degradation
//!
//! Every store failure or timeout is logged and downgraded to a miss (reads)
//! or "not cached at this tier" (writes). Nothing here returns an error.

pub mod memory;
pub mod redis_store;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::pattern;
use crate::stats::CacheMetrics;

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, create_remote_store};

/// The primitives the engine needs from a shared key/value service.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store `value`; `Duration::ZERO` stores without expiry.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration)
    -> Result<(), CacheError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Delete every key matching a Redis-style glob. Returns the number deleted.
    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError>;
}

/// What the remote tier stores under a data key.
#[derive(Debug, Serialize, Deserialize)]
struct RemoteEnvelope {
    #[serde(default)]
    tags: Vec<String>,
    written_at_ms: u64,
    /// 0 = no expiry
    ttl_ms: u64,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

/// A successful remote lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHit {
    pub data: Vec<u8>,
    pub tags: Vec<String>,
    /// Time left before the entry would expire; `Duration::ZERO` = no expiry
    pub remaining_ttl: Duration,
}

/// Builds namespaced remote keys and patterns.
#[derive(Debug, Clone)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn data_key(&self, key: &str) -> String {
        format!("{}:k:{key}", self.prefix)
    }

    pub fn tag_marker(&self, tag: &str, key: &str) -> String {
        format!("{}:t:{}:{key}", self.prefix, urlencoding::encode(tag))
    }

    pub fn tag_pattern(&self, tag: &str) -> String {
        format!(
            "{}:t:{}:*",
            pattern::escape(&self.prefix),
            urlencoding::encode(tag)
        )
    }

    /// Scope a caller-supplied key glob to the data namespace.
    pub fn data_pattern(&self, key_glob: &str) -> String {
        format!("{}:k:{key_glob}", pattern::escape(&self.prefix))
    }

    pub fn namespace_pattern(&self) -> String {
        format!("{}:*", pattern::escape(&self.prefix))
    }
}

/// Failure-tolerant client for the remote tier with optional compression.
pub struct RemoteCacheAdapter {
    store: Arc<dyn RemoteStore>,
    layout: KeyLayout,
    timeout: Duration,
    compression_enabled: bool,
    compression_threshold: usize,
    metrics: Arc<CacheMetrics>,
}

impl RemoteCacheAdapter {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        config: &CacheConfig,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            store,
            layout: KeyLayout::new(config.key_prefix.clone()),
            timeout: config.l2_timeout(),
            compression_enabled: config.compression_enabled,
            compression_threshold: config.compression_threshold_bytes,
            metrics,
        }
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// Run one store call under the timeout, absorbing any failure.
    async fn call<T, F>(&self, operation: &'static str, key: &str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T, CacheError>>,
    {
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout {
                operation,
                timeout_ms: saturating_millis(self.timeout),
            }),
        };

        match result {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %key, operation, error = %e, "L2 cache operation failed");
                self.metrics.record_l2_error(operation);
                None
            }
        }
    }

    /// Fetch and decode an entry. Any failure is a miss.
    pub async fn get(&self, key: &str) -> Option<RemoteHit> {
        let data_key = self.layout.data_key(key);
        let raw = self.call("get", key, self.store.get(&data_key)).await??;

        let payload = codec::unwrap_payload(raw);
        let envelope: RemoteEnvelope = match codec::decode(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to decode L2 entry");
                self.metrics.record_l2_error("decode");
                self.call("delete", key, self.store.delete(&data_key)).await;
                return None;
            }
        };

        let remaining_ttl = if envelope.ttl_ms == 0 {
            Duration::ZERO
        } else {
            let age = now_millis().saturating_sub(envelope.written_at_ms);
            if age >= envelope.ttl_ms {
                tracing::debug!(key = %key, "L2 entry outlived its TTL");
                return None;
            }
            Duration::from_millis(envelope.ttl_ms - age)
        };

        if !envelope.tags.is_empty() {
            // All markers are checked together under one timeout
            let markers: Vec<String> = envelope
                .tags
                .iter()
                .map(|tag| self.layout.tag_marker(tag, key))
                .collect();
            let checks = try_join_all(markers.iter().map(|marker| self.store.exists(marker)));
            match self.call("exists", key, checks).await {
                Some(found) if found.iter().all(|&present| present) => {}
                Some(_) => {
                    tracing::debug!(key = %key, "L2 entry invalidated by tag");
                    self.call("delete", key, self.store.delete(&data_key)).await;
                    return None;
                }
                // Cannot prove the entry is still valid
                None => return None,
            }
        }

        Some(RemoteHit {
            data: envelope.data,
            tags: envelope.tags,
            remaining_ttl,
        })
    }

    /// Store an already-serialized value. Returns whether the tier accepted it.
    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration, tags: &[String]) -> bool {
        let envelope = RemoteEnvelope {
            tags: tags.to_vec(),
            written_at_ms: now_millis(),
            ttl_ms: ttl_millis(ttl),
            data: value.to_vec(),
        };
        let payload = match codec::encode(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to encode L2 entry");
                self.metrics.record_l2_error("encode");
                return false;
            }
        };
        let payload =
            codec::maybe_compress(payload, self.compression_enabled, self.compression_threshold);

        // Markers first: an entry without its markers reads as invalidated.
        for tag in tags {
            let marker = self.layout.tag_marker(tag, key);
            if self
                .call("set", key, self.store.set_with_ttl(&marker, b"1", ttl))
                .await
                .is_none()
            {
                return false;
            }
        }

        let data_key = self.layout.data_key(key);
        let stored = self
            .call("set", key, self.store.set_with_ttl(&data_key, &payload, ttl))
            .await
            .is_some();
        if stored {
            tracing::debug!(key = %key, size = payload.len(), "cache set (L2)");
        }
        stored
    }

    /// Returns true only if the key existed and was removed.
    pub async fn delete(&self, key: &str) -> bool {
        let data_key = self.layout.data_key(key);
        self.call("delete", key, self.store.delete(&data_key))
            .await
            .unwrap_or(false)
    }

    pub async fn exists(&self, key: &str) -> bool {
        let data_key = self.layout.data_key(key);
        self.call("exists", key, self.store.exists(&data_key))
            .await
            .unwrap_or(false)
    }

    /// Invalidate every entry carrying one of `tags` by deleting its markers.
    pub async fn clear_tags<S: AsRef<str>>(&self, tags: &[S]) -> u64 {
        let mut removed = 0;
        for tag in tags {
            let pattern = self.layout.tag_pattern(tag.as_ref());
            removed += self
                .call("delete_pattern", tag.as_ref(), self.store.delete_pattern(&pattern))
                .await
                .unwrap_or(0);
        }
        removed
    }

    /// Delete entries whose key matches `key_glob`.
    pub async fn clear_pattern(&self, key_glob: &str) -> u64 {
        let pattern = self.layout.data_pattern(key_glob);
        self.call("delete_pattern", key_glob, self.store.delete_pattern(&pattern))
            .await
            .unwrap_or(0)
    }

    /// Delete everything under this adapter's namespace.
    pub async fn clear_all(&self) -> u64 {
        let pattern = self.layout.namespace_pattern();
        self.call("delete_pattern", "*", self.store.delete_pattern(&pattern))
            .await
            .unwrap_or(0)
    }
}

/// Whole milliseconds, never rounding a non-zero TTL down to "no expiry".
/// Saturates at `u64::MAX`.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    if ttl.is_zero() {
        0
    } else {
        saturating_millis(ttl).max(1)
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(saturating_millis)
        .unwrap_or(0)
}
