//! Cross-instance L1 invalidation.
//!
//! ## How It Works
//!
//! 1. Every invalidation on one instance publishes an [`InvalidationEvent`]
//! 2. Listeners on the other instances apply it to their own L1
//! 3. Events carrying the listener's own instance id are skipped
//!
//! ```text
//! Instance 1: orchestrator.invalidate_tags(["patients"])
//!   ↓
//! Redis Pub/Sub: PUBLISH cache:invalidate {"origin":"…","kind":"tags","tags":["patients"]}
//!   ↓
//! Instance 2: listener clears tag "patients" from L1
//! Instance 3: listener clears tag "patients" from L1
//! ```
//!
//! L2 is shared, so only the in-process tier needs the broadcast.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use crate::config::RedisConfig;
use crate::error::CacheError;
use crate::local::BoundedLocalCache;
use crate::maintenance::TaskHandle;
use crate::pattern::Glob;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300); // 5 minutes max

/// An invalidation announced by one orchestrator instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Instance that performed the invalidation
    pub origin: Uuid,
    #[serde(flatten)]
    pub scope: InvalidationScope,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvalidationScope {
    Key { key: String },
    Tags { tags: Vec<String> },
    /// Key globs
    Patterns { patterns: Vec<String> },
    Clear,
}

impl InvalidationEvent {
    pub fn new(origin: Uuid, scope: InvalidationScope) -> Self {
        Self { origin, scope }
    }

    /// Apply the event to a local tier. Returns the number of entries removed.
    pub fn apply(&self, local: &BoundedLocalCache) -> usize {
        match &self.scope {
            InvalidationScope::Key { key } => usize::from(local.remove(key)),
            InvalidationScope::Tags { tags } => local.clear_by_tags(tags),
            InvalidationScope::Patterns { patterns } => patterns
                .iter()
                .filter_map(|pattern| match Glob::new(pattern) {
                    Ok(glob) => Some(local.clear_by_pattern(&glob)),
                    Err(e) => {
                        tracing::warn!(pattern = %pattern, error = %e, "ignoring invalid invalidation pattern");
                        None
                    }
                })
                .sum(),
            InvalidationScope::Clear => {
                let count = local.len();
                local.clear();
                count
            }
        }
    }

    /// Apply the event unless it was published by `instance_id` itself.
    pub fn apply_foreign(&self, local: &BoundedLocalCache, instance_id: Uuid) -> Option<usize> {
        (self.origin != instance_id).then(|| self.apply(local))
    }
}

/// Transport carrying invalidation events between instances.
#[async_trait]
pub trait InvalidationBus: Send + Sync {
    async fn publish(&self, event: &InvalidationEvent) -> Result<(), CacheError>;

    /// Start applying foreign events to `local`. Must be called from within a
    /// Tokio runtime.
    fn subscribe(&self, local: Arc<BoundedLocalCache>, instance_id: Uuid) -> TaskHandle;
}

/// Redis Pub/Sub backed bus.
pub struct RedisInvalidationBus {
    pool: Pool,
    redis_url: String,
    channel: String,
}

impl RedisInvalidationBus {
    /// Reuse the L2 pool for publishing; listeners open a dedicated connection.
    pub fn new(pool: Pool, config: &RedisConfig) -> Self {
        Self {
            pool,
            redis_url: config.url.clone(),
            channel: config.invalidation_channel.clone(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl InvalidationBus for RedisInvalidationBus {
    async fn publish(&self, event: &InvalidationEvent) -> Result<(), CacheError> {
        let payload =
            serde_json::to_string(event).map_err(|e| CacheError::serialization(e.to_string()))?;

        let mut conn = self.pool.get().await?;
        conn.publish::<_, _, ()>(&self.channel, payload).await?;

        tracing::debug!(channel = %self.channel, scope = ?event.scope, "published cache invalidation");
        Ok(())
    }

    fn subscribe(&self, local: Arc<BoundedLocalCache>, instance_id: Uuid) -> TaskHandle {
        let listener = RedisListener {
            redis_url: self.redis_url.clone(),
            channel: self.channel.clone(),
            local,
            instance_id,
        };
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;

            loop {
                tokio::select! {
                    result = listener.run() => match result {
                        Ok(()) => {
                            // Connection closed gracefully, reset backoff
                            backoff = INITIAL_BACKOFF;
                        }
                        Err(e) => {
                            tracing::error!(
                                error = %e,
                                backoff_secs = backoff.as_secs(),
                                "Cache invalidation listener error, reconnecting..."
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = &mut shutdown_rx => break,
                            }
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                    },
                    _ = &mut shutdown_rx => break,
                }
            }
            tracing::debug!("Cache invalidation listener stopped");
        });

        TaskHandle::new(handle, shutdown_tx)
    }
}

struct RedisListener {
    redis_url: String,
    channel: String,
    local: Arc<BoundedLocalCache>,
    instance_id: Uuid,
}

impl RedisListener {
    async fn run(&self) -> Result<(), CacheError> {
        use futures_util::StreamExt;

        // Pub/sub needs a dedicated connection, not a pooled one
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        tracing::info!(channel = %self.channel, "Subscribed to cache invalidation channel");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let event = msg
                .get_payload::<String>()
                .map_err(CacheError::from)
                .and_then(|payload| {
                    serde_json::from_str::<InvalidationEvent>(&payload)
                        .map_err(|e| CacheError::serialization(e.to_string()))
                });

            match event {
                Ok(event) => {
                    if let Some(removed) = event.apply_foreign(&self.local, self.instance_id) {
                        tracing::debug!(scope = ?event.scope, removed, "applied remote cache invalidation");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to parse invalidation message payload");
                }
            }
        }

        Err(CacheError::transport("pub/sub connection closed"))
    }
}

/// Bus connecting orchestrators that share one process.
///
/// Useful for tests and for embedding several independent caches that must
/// stay coherent without Redis.
#[derive(Clone)]
pub struct InProcessBus {
    sender: broadcast::Sender<InvalidationEvent>,
}

impl InProcessBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl InvalidationBus for InProcessBus {
    async fn publish(&self, event: &InvalidationEvent) -> Result<(), CacheError> {
        // No subscribers is not an error
        let _ = self.sender.send(event.clone());
        Ok(())
    }

    fn subscribe(&self, local: Arc<BoundedLocalCache>, instance_id: Uuid) -> TaskHandle {
        let mut rx = self.sender.subscribe();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(event) => {
                            event.apply_foreign(&local, instance_id);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Missed events cannot be replayed; drop everything instead
                            tracing::warn!(skipped, "invalidation listener lagged, clearing L1");
                            local.clear();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        TaskHandle::new(handle, shutdown_tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_with(entries: &[(&str, &[&str])]) -> Arc<BoundedLocalCache> {
        let local = Arc::new(BoundedLocalCache::new(100, 64 * 1024, 1024));
        for (key, tags) in entries {
            let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
            local.set(key, Arc::new(b"v".to_vec()), Duration::ZERO, &tags);
        }
        local
    }

    #[test]
    fn test_event_json_shape() {
        let origin = Uuid::new_v4();
        let event = InvalidationEvent::new(
            origin,
            InvalidationScope::Tags {
                tags: vec!["orders".to_string()],
            },
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "tags");
        assert_eq!(json["tags"][0], "orders");
        assert_eq!(json["origin"], origin.to_string());

        let parsed: InvalidationEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);

        let clear: InvalidationEvent =
            serde_json::from_str(&format!(r#"{{"origin":"{origin}","kind":"clear"}}"#)).unwrap();
        assert_eq!(clear.scope, InvalidationScope::Clear);
    }

    #[test]
    fn test_apply_scopes() {
        let local = local_with(&[
            ("user:1", &["users"]),
            ("user:2", &["users"]),
            ("order:1", &["orders"]),
            ("report:1", &[]),
        ]);
        let origin = Uuid::new_v4();

        let removed = InvalidationEvent::new(
            origin,
            InvalidationScope::Key {
                key: "report:1".to_string(),
            },
        )
        .apply(&local);
        assert_eq!(removed, 1);

        let removed = InvalidationEvent::new(
            origin,
            InvalidationScope::Patterns {
                patterns: vec!["user:*".to_string(), "[invalid".to_string()],
            },
        )
        .apply(&local);
        assert_eq!(removed, 2);
        assert_eq!(local.keys(), vec!["order:1"]);

        InvalidationEvent::new(origin, InvalidationScope::Clear).apply(&local);
        assert!(local.is_empty());
    }

    #[test]
    fn test_own_events_are_skipped() {
        let local = local_with(&[("k", &[])]);
        let me = Uuid::new_v4();
        let event = InvalidationEvent::new(
            me,
            InvalidationScope::Key {
                key: "k".to_string(),
            },
        );

        assert_eq!(event.apply_foreign(&local, me), None);
        assert!(local.contains("k"));
        assert_eq!(event.apply_foreign(&local, Uuid::new_v4()), Some(1));
        assert!(!local.contains("k"));
    }

    #[tokio::test]
    async fn test_in_process_bus_delivers_foreign_events() {
        let bus = InProcessBus::default();
        let local = local_with(&[("a", &["t"]), ("b", &[])]);
        let listener = bus.subscribe(Arc::clone(&local), Uuid::new_v4());

        bus.publish(&InvalidationEvent::new(
            Uuid::new_v4(),
            InvalidationScope::Tags {
                tags: vec!["t".to_string()],
            },
        ))
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(local.keys(), vec!["b"]);

        listener.stop().await;
    }
}
