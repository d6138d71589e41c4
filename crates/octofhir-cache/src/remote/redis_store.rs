//! Redis-backed remote store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Pool, PoolConfig, Runtime};
use redis::AsyncCommands;

use super::RemoteStore;
use crate::config::{CacheSettings, RedisConfig};
use crate::error::CacheError;

/// Keys deleted per DEL command during pattern deletion.
const DELETE_BATCH_SIZE: usize = 500;

/// Redis rejects expirations whose absolute time overflows a signed 64-bit
/// millisecond clock. Longer TTLs are stored without expiry.
const MAX_EXPIRE_MS: u64 = i64::MAX as u64 / 2;

/// Remote store over a deadpool-managed Redis connection pool.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create a pool from configuration and verify the server is reachable.
    pub async fn connect(config: &RedisConfig) -> Result<Self, CacheError> {
        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        let mut pool_config = PoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = Some(config.timeout());
        pool_config.timeouts.create = Some(config.timeout());
        pool_config.timeouts.recycle = Some(config.timeout());
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::transport(format!("failed to create Redis pool: {e}")))?;

        // Test connection
        pool.get().await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Check if Redis is available (for health checks).
    pub async fn is_available(&self) -> bool {
        self.pool.get().await.is_ok()
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.get::<_, Option<Vec<u8>>>(key).await?)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        // Millisecond precision keeps sub-second TTLs meaningful
        let millis = super::ttl_millis(ttl);
        if millis == 0 || millis > MAX_EXPIRE_MS {
            conn.set::<_, _, ()>(key, value).await?;
        } else {
            conn.pset_ex::<_, _, ()>(key, value, millis).await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.pool.get().await?;
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.exists::<_, bool>(key).await?)
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut conn = self.pool.get().await?;

        let mut keys: Vec<String> = Vec::new();
        {
            let mut iter = conn.scan_match::<_, String>(pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }

        let mut removed = 0;
        for batch in keys.chunks(DELETE_BATCH_SIZE) {
            removed += conn.del::<_, u64>(batch).await?;
        }

        tracing::debug!(pattern = %pattern, removed, "Redis pattern delete");
        Ok(removed)
    }
}

/// Create the remote store described by the settings.
///
/// ## Graceful Degradation
///
/// Returns `None` when the remote tier is disabled or Redis cannot be reached,
/// so the engine starts in L1-only mode instead of failing.
pub async fn create_remote_store(settings: &CacheSettings) -> Option<Arc<RedisStore>> {
    if !settings.cache.l2_enabled {
        tracing::info!("L2 cache disabled, using local cache only");
        return None;
    }

    tracing::info!(url = %settings.redis.url, "Connecting to Redis");

    match RedisStore::connect(&settings.redis).await {
        Ok(store) => {
            tracing::info!("✓ Connected to Redis successfully");
            Some(Arc::new(store))
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to local cache."
            );
            None
        }
    }
}
