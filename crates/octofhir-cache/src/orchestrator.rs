//! Single call surface over L1, L2 and the origin.
//!
//! ## Read Path
//!
//! ```text
//! get(key) ──► L1 ──hit──► value
//!               │miss
//!               ▼
//!              L2 ──hit──► write back to L1 (remaining TTL, tags) ──► value
//!               │miss
//!               ▼
//!        origin producer (once per key across concurrent callers)
//!               │Some(value)
//!               ▼
//!        write per strategy ──► value
//! ```
//!
//! ## Write Strategies
//!
//! | Strategy       | L1          | L2                       |
//! |----------------|-------------|--------------------------|
//! | `WriteThrough` | synchronous | synchronous              |
//! | `WriteBehind`  | synchronous | queued, applied in order |
//! | `WriteAround`  | dropped     | synchronous              |
//!
//! A write reports success when at least one targeted tier stored the value.
//!
//! ## Cancellation
//!
//! Dropping a `get_or_load` future never leaves a partial entry. Cancelled
//! before the producer finishes, nothing is cached. Cancelled during a
//! write-through L2 write, L1 keeps the complete new value and L2 holds either
//! the previous entry or the complete new one. An L2 entry becomes readable
//! only once its data key is written, after its tag markers.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::aside::{InvalidateOnCall, KeyTemplate, Memoized};
use crate::codec;
use crate::config::{CacheConfig, CacheSettings};
use crate::error::CacheError;
use crate::local::BoundedLocalCache;
use crate::maintenance::{TaskHandle, spawn_ttl_sweeper};
use crate::pubsub::{InvalidationBus, InvalidationEvent, InvalidationScope, RedisInvalidationBus};
use crate::remote::{RemoteCacheAdapter, RemoteStore, create_remote_store};
use crate::routes::InvalidationRoutes;
use crate::stats::{CacheMetrics, CacheStats, Tier};
use crate::write_behind::{RemoteOp, WriteBehindQueue};

/// How a write propagates across tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum WriteStrategy {
    /// L1 and L2 synchronously
    #[default]
    WriteThrough,
    /// L1 synchronously, L2 through the background queue
    WriteBehind,
    /// L2 only; any L1 copy is dropped
    WriteAround,
}

/// Per-call write options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryOptions {
    /// `None` uses `default_ttl_seconds`; `Some(Duration::ZERO)` never expires
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    pub strategy: WriteStrategy,
}

impl EntryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn no_expiry(self) -> Self {
        self.with_ttl(Duration::ZERO)
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_strategy(mut self, strategy: WriteStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

type FlightMap = DashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Membership in the per-key single-flight group.
///
/// The map entry is removed when the last member leaves, so the map only
/// holds keys with a load in progress.
struct InFlight<'a> {
    map: &'a FlightMap,
    key: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> InFlight<'a> {
    fn join(map: &'a FlightMap, key: &str) -> Self {
        let lock = map
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        Self {
            map,
            key: key.to_string(),
            lock,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        // One reference in the map, one here: nobody else is waiting
        self.map.remove_if(&self.key, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
        });
    }
}

/// Entry point used by the rest of the application.
///
/// Construct once with [`CacheOrchestrator::builder`] and share the returned
/// `Arc`. Call [`shutdown`](Self::shutdown) before exiting so queued remote
/// writes are flushed and background tasks stop.
pub struct CacheOrchestrator {
    config: Arc<CacheConfig>,
    local: Arc<BoundedLocalCache>,
    remote: Option<Arc<RemoteCacheAdapter>>,
    write_behind: Option<WriteBehindQueue>,
    bus: Option<Arc<dyn InvalidationBus>>,
    instance_id: Uuid,
    metrics: Arc<CacheMetrics>,
    in_flight: FlightMap,
    routes: InvalidationRoutes,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl CacheOrchestrator {
    pub fn builder(config: CacheConfig) -> CacheOrchestratorBuilder {
        CacheOrchestratorBuilder::new(config)
    }

    /// Build from loaded settings, connecting to Redis when enabled.
    ///
    /// An unreachable Redis degrades to L1-only mode instead of failing.
    pub async fn from_settings(settings: &CacheSettings) -> Result<Arc<Self>, CacheError> {
        settings.validate()?;

        let mut builder = Self::builder(settings.cache.clone());
        if let Some(store) = create_remote_store(settings).await {
            if settings.redis.pubsub_enabled {
                let bus = RedisInvalidationBus::new(store.pool().clone(), &settings.redis);
                tracing::info!(channel = %bus.channel(), "Cross-instance cache invalidation enabled");
                builder = builder.with_invalidation_bus(Arc::new(bus));
            }
            builder = builder.with_remote(store);
        }
        builder.build()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The in-process tier.
    pub fn local(&self) -> &Arc<BoundedLocalCache> {
        &self.local
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    // ---------------------------------------------------------------------
    // Read path
    // ---------------------------------------------------------------------

    /// Look a key up in L1, then L2. Never consults an origin.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let started = Instant::now();
        let value = self.lookup(key).await;
        if value.is_none() {
            self.metrics.record_miss();
            tracing::debug!(key = %key, "cache miss");
        }
        self.metrics.record_get_latency(started.elapsed());
        value
    }

    /// Read through to `producer` on a miss and populate the tiers with its
    /// result according to `options.strategy`.
    ///
    /// Concurrent misses for one key run the producer once; the others wait
    /// and read the populated value. Producer errors are returned unchanged
    /// and nothing is cached. `Ok(None)` from the producer is not cached.
    pub async fn get_or_load<T, E, F, Fut>(
        &self,
        key: &str,
        options: EntryOptions,
        producer: F,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let started = Instant::now();
        let result = self.load_through(key, &options, producer).await;
        self.metrics.record_get_latency(started.elapsed());
        result
    }

    async fn load_through<T, E, F, Fut>(
        &self,
        key: &str,
        options: &EntryOptions,
        producer: F,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        if let Some(value) = self.lookup(key).await {
            return Ok(Some(value));
        }

        let flight = InFlight::join(&self.in_flight, key);
        let (_permit, waited) = match flight.lock.try_lock() {
            Ok(permit) => (permit, false),
            Err(_) => (flight.lock.lock().await, true),
        };

        // Another caller may have finished loading since our miss
        if self.local.contains(key)
            && let Some(value) = self.lookup_local(key)
        {
            return Ok(Some(value));
        }
        if waited && let Some(value) = self.lookup_remote(key).await {
            return Ok(Some(value));
        }

        let loaded = match producer().await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.metrics.record_miss();
                return Err(e);
            }
        };

        match &loaded {
            Some(value) => {
                self.metrics.record_hit(Tier::Origin);
                tracing::debug!(key = %key, "loaded from origin");
                match codec::encode(value) {
                    Ok(payload) => {
                        self.store(key, Arc::new(payload), options).await;
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Failed to serialize origin value, not caching");
                        self.metrics.record_write_failure();
                    }
                }
            }
            None => {
                self.metrics.record_miss();
                tracing::debug!(key = %key, "origin has no value");
            }
        }

        Ok(loaded)
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(value) = self.lookup_local(key) {
            return Some(value);
        }
        self.lookup_remote(key).await
    }

    fn lookup_local<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.local.get(key)?;
        match codec::decode(&bytes) {
            Ok(value) => {
                self.metrics.record_hit(Tier::L1);
                tracing::debug!(key = %key, tier = "L1", "cache hit");
                Some(value)
            }
            Err(e) => {
                // Invalidate on decode failure (likely stored as another type)
                tracing::warn!(key = %key, error = %e, "Failed to decode L1 entry");
                self.local.remove(key);
                None
            }
        }
    }

    async fn lookup_remote<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let remote = self.remote.as_ref()?;
        // Taken before the read so a concurrent write or invalidation wins
        let seen = self.local.generation(key);
        let Some(hit) = remote.get(key).await else {
            self.metrics.record_l2_miss();
            return None;
        };

        let value = match codec::decode(&hit.data) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to decode L2 entry");
                self.metrics.record_l2_error("decode");
                self.metrics.record_l2_miss();
                return None;
            }
        };

        // Populate L1 so the next read stays in-process
        if !self.local.set_if_unchanged(
            key,
            Arc::new(hit.data),
            hit.remaining_ttl,
            &hit.tags,
            seen,
        ) {
            tracing::debug!(key = %key, "L2 value not promoted to L1");
        }
        self.metrics.record_hit(Tier::L2);
        tracing::debug!(key = %key, tier = "L2", "cache hit");
        Some(value)
    }

    // ---------------------------------------------------------------------
    // Write path
    // ---------------------------------------------------------------------

    /// Store a value. Returns true if at least one targeted tier accepted it.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: EntryOptions,
    ) -> bool {
        match codec::encode(value) {
            Ok(payload) => self.store(key, Arc::new(payload), &options).await,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to serialize cache value");
                self.metrics.record_write_failure();
                false
            }
        }
    }

    async fn store(&self, key: &str, payload: Arc<Vec<u8>>, options: &EntryOptions) -> bool {
        let ttl = options.ttl.unwrap_or_else(|| self.config.default_ttl());
        let tags = &options.tags;

        let stored = match options.strategy {
            WriteStrategy::WriteThrough => {
                let l1 = self.store_local(key, Arc::clone(&payload), ttl, tags);
                match &self.remote {
                    Some(remote) => {
                        let l2 = remote.set(key, &payload, ttl, tags).await;
                        if l1 != l2 {
                            tracing::warn!(key = %key, l1, l2, "write-through stored in one tier only");
                            self.metrics.record_write_failure();
                        }
                        l1 || l2
                    }
                    None => l1,
                }
            }
            WriteStrategy::WriteBehind => {
                let l1 = self.store_local(key, Arc::clone(&payload), ttl, tags);
                let queued = match &self.write_behind {
                    Some(queue) => queue.enqueue(RemoteOp::Set {
                        key: key.to_string(),
                        value: payload,
                        ttl,
                        tags: tags.clone(),
                    }),
                    None => false,
                };
                l1 || queued
            }
            WriteStrategy::WriteAround => {
                let stored = match &self.remote {
                    Some(remote) => remote.set(key, &payload, ttl, tags).await,
                    None => false,
                };
                // After the remote write, so a racing read cannot promote the old value
                self.local.remove(key);
                stored
            }
        };

        if stored {
            tracing::debug!(key = %key, strategy = ?options.strategy, ttl_secs = ttl.as_secs(), "cache set");
        } else {
            tracing::debug!(key = %key, strategy = ?options.strategy, "cache set rejected by every tier");
            self.metrics.record_write_failure();
        }
        stored
    }

    fn store_local(&self, key: &str, payload: Arc<Vec<u8>>, ttl: Duration, tags: &[String]) -> bool {
        if self.local.set(key, payload, ttl, tags) {
            return true;
        }
        // A rejected write must not leave the previous value readable
        self.local.remove(key);
        false
    }

    // ---------------------------------------------------------------------
    // Invalidation
    // ---------------------------------------------------------------------

    /// Remove a key from every tier. Returns whether any tier held it.
    ///
    /// Each invalidation clears L2 before L1: a read that fetched the old
    /// value from L2 meanwhile finds L1 changed and does not promote it.
    pub async fn delete(&self, key: &str) -> bool {
        let l2 = self
            .invalidate_remote(RemoteOp::Delete {
                key: key.to_string(),
            })
            .await
            > 0;
        let l1 = self.local.remove(key);

        self.broadcast(InvalidationScope::Key {
            key: key.to_string(),
        })
        .await;
        tracing::debug!(key = %key, l1, l2, "cache delete");
        l1 || l2
    }

    /// Remove a key from every tier.
    pub async fn invalidate_key(&self, key: &str) {
        self.delete(key).await;
    }

    /// Remove every entry carrying any of `tags` from every tier.
    pub async fn invalidate_tags<S: AsRef<str>>(&self, tags: &[S]) {
        if tags.is_empty() {
            return;
        }
        let tags: Vec<String> = tags.iter().map(|t| t.as_ref().to_string()).collect();

        self.invalidate_remote(RemoteOp::ClearTags { tags: tags.clone() })
            .await;
        let removed = self.local.clear_by_tags(&tags);

        tracing::debug!(tags = ?tags, removed_l1 = removed, "invalidated tags");
        self.broadcast(InvalidationScope::Tags { tags }).await;
    }

    /// Invalidate a named domain from `cache.invalidation_routes`.
    ///
    /// Unknown domains are treated as a tag of the same name.
    pub async fn invalidate_pattern(&self, domain: &str) {
        let route = self.routes.resolve(domain);

        if !route.tags.is_empty() {
            self.invalidate_tags(&route.tags).await;
        }
        if route.patterns.is_empty() {
            return;
        }

        let mut removed = 0;
        for glob in &route.patterns {
            self.invalidate_remote(RemoteOp::ClearPattern {
                pattern: glob.as_str().to_string(),
            })
            .await;
            removed += self.local.clear_by_pattern(glob);
        }

        tracing::debug!(domain = %domain, removed_l1 = removed, "invalidated domain patterns");
        self.broadcast(InvalidationScope::Patterns {
            patterns: route.pattern_sources(),
        })
        .await;
    }

    /// Drop every entry from every tier.
    pub async fn clear(&self) {
        self.invalidate_remote(RemoteOp::ClearAll).await;
        self.local.clear();
        tracing::info!("cache cleared");
        self.broadcast(InvalidationScope::Clear).await;
    }

    /// Apply an invalidation to L2 and wait for it. Returns the number of keys
    /// removed.
    ///
    /// With write-behind writes pending, the invalidation is queued behind them
    /// so it cannot be overtaken, and the result is awaited from the worker.
    async fn invalidate_remote(&self, op: RemoteOp) -> u64 {
        let Some(remote) = &self.remote else {
            return 0;
        };
        let op = match &self.write_behind {
            Some(queue) if queue.has_pending() => match queue.submit(op).await {
                Ok(applied) => return applied.await.unwrap_or(0),
                // Shut down, so nothing is left to overtake it
                Err(op) => op,
            },
            _ => op,
        };
        op.apply(remote).await
    }

    async fn broadcast(&self, scope: InvalidationScope) {
        let Some(bus) = &self.bus else {
            return;
        };
        let event = InvalidationEvent::new(self.instance_id, scope);
        match tokio::time::timeout(self.config.l2_timeout(), bus.publish(&event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to publish cache invalidation");
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.l2_timeout_ms,
                    "Publishing cache invalidation timed out"
                );
            }
        }
    }

    // ---------------------------------------------------------------------
    // Cache-aside helpers
    // ---------------------------------------------------------------------

    /// Wrap a read function so its results are cached under `key_template`.
    pub fn memoize<F>(self: &Arc<Self>, key_template: &str, func: F) -> Result<Memoized<F>, CacheError> {
        let template = KeyTemplate::parse(key_template)?;
        Ok(Memoized::new(Arc::clone(self), template, func))
    }

    /// Wrap a write function so `domains` are invalidated after it succeeds.
    pub fn invalidate_on_call<I, S, F>(self: &Arc<Self>, domains: I, func: F) -> InvalidateOnCall<F>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        InvalidateOnCall::new(
            Arc::clone(self),
            domains.into_iter().map(Into::into).collect(),
            func,
        )
    }

    // ---------------------------------------------------------------------
    // Observability and lifecycle
    // ---------------------------------------------------------------------

    pub fn get_stats(&self) -> CacheStats {
        let local = self.local.stats();
        crate::metrics::set_cache_usage(Tier::L1.as_str(), local.entries, local.memory_bytes);
        self.metrics.snapshot(local)
    }

    /// Stop background tasks and flush queued remote writes. Idempotent.
    pub async fn shutdown(&self) {
        let tasks: Vec<TaskHandle> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.stop().await;
        }
        if let Some(queue) = &self.write_behind {
            let pending = queue.pending();
            if pending > 0 {
                tracing::info!(pending, "Flushing write-behind queue");
            }
            queue.shutdown().await;
        }
        tracing::info!(instance_id = %self.instance_id, "Cache orchestrator shut down");
    }
}

/// Builder for [`CacheOrchestrator`].
pub struct CacheOrchestratorBuilder {
    config: CacheConfig,
    remote: Option<Arc<dyn RemoteStore>>,
    bus: Option<Arc<dyn InvalidationBus>>,
}

impl CacheOrchestratorBuilder {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            remote: None,
            bus: None,
        }
    }

    /// Remote store for the L2 tier. Ignored unless `l2_enabled` is set.
    pub fn with_remote(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(store);
        self
    }

    pub fn with_invalidation_bus(mut self, bus: Arc<dyn InvalidationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Validate the configuration and start background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<Arc<CacheOrchestrator>, CacheError> {
        self.config.validate()?;
        let routes = InvalidationRoutes::from_config(&self.config)?;
        let config = Arc::new(self.config);
        let metrics = Arc::new(CacheMetrics::new());
        let local = Arc::new(BoundedLocalCache::from_config(&config));
        let instance_id = Uuid::new_v4();

        let remote = match self.remote {
            Some(store) if config.l2_enabled => Some(Arc::new(RemoteCacheAdapter::new(
                store,
                &config,
                Arc::clone(&metrics),
            ))),
            Some(_) => {
                tracing::info!("Remote store provided but cache.l2_enabled=false; running L1-only");
                None
            }
            None => None,
        };
        let write_behind = remote.as_ref().map(|remote| {
            WriteBehindQueue::spawn(
                Arc::clone(remote),
                config.write_behind_queue_capacity,
                Arc::clone(&metrics),
            )
        });

        let mut tasks = vec![spawn_ttl_sweeper(Arc::clone(&local), config.sweep_interval())];
        if let Some(bus) = &self.bus {
            tasks.push(bus.subscribe(Arc::clone(&local), instance_id));
        }

        tracing::info!(
            instance_id = %instance_id,
            l1_max_entries = config.l1_max_entries,
            l1_max_memory_bytes = config.l1_max_memory_bytes,
            l2 = remote.is_some(),
            pubsub = self.bus.is_some(),
            "Cache orchestrator started"
        );

        Ok(Arc::new(CacheOrchestrator {
            config,
            local,
            remote,
            write_behind,
            bus: self.bus,
            instance_id,
            metrics,
            in_flight: DashMap::new(),
            routes,
            tasks: Mutex::new(tasks),
        }))
    }
}
