//! Multi-tier caching engine for OctoFHIR.
//!
//! ## Architecture
//!
//! - **L1 (`BoundedLocalCache`)**: in-process LRU, bounded by entry count and bytes
//! - **L2 (`RemoteCacheAdapter`)**: Redis (or any `RemoteStore`), shared across instances
//! - **`CacheOrchestrator`**: read-through, write strategies, invalidation, stats
//! - **Pub/Sub**: optional cross-instance L1 invalidation
//!
//! ## Cache Hierarchy
//!
//! ```text
//! get → L1 (LRU) → L2 (Redis) → Origin (DB/API)
//!         ↓            ↓             ↓
//!     <1µs latency  ~ms latency  slowest, authoritative
//! ```
//!
//! ## Graceful Degradation
//!
//! Remote failures and timeouts are logged and treated as misses. If Redis is
//! unavailable or disabled, the engine runs L1-only. Only errors from the
//! origin producer reach the caller.
//!
//! ## Example
//!
//! ```ignore
//! let settings = octofhir_cache::config::loader::load_settings(None)?;
//! let cache = CacheOrchestrator::from_settings(&settings).await?;
//!
//! let patient: Option<Patient> = cache
//!     .get_or_load("patient:123", EntryOptions::new().with_tag("patients"), || async {
//!         repo.find_patient("123").await
//!     })
//!     .await?;
//!
//! cache.invalidate_tags(&["patients"]).await;
//! cache.shutdown().await;
//! ```

pub mod aside;
pub mod codec;
pub mod config;
pub mod error;
pub mod local;
pub mod maintenance;
pub mod metrics;
pub mod observability;
pub mod orchestrator;
pub mod pattern;
pub mod pubsub;
pub mod remote;
pub mod routes;
pub mod stats;
pub mod write_behind;

pub use aside::{Args, InvalidateOnCall, KeyArgs, KeyTemplate, Memoized};
pub use config::{CacheConfig, CacheSettings, InvalidationRoute, LoggingConfig, RedisConfig};
pub use error::{CacheError, CacheResult};
pub use local::{BoundedLocalCache, CacheEntry, Generation};
pub use maintenance::TaskHandle;
pub use orchestrator::{CacheOrchestrator, CacheOrchestratorBuilder, EntryOptions, WriteStrategy};
pub use pattern::Glob;
pub use pubsub::{
    InProcessBus, InvalidationBus, InvalidationEvent, InvalidationScope, RedisInvalidationBus,
};
pub use remote::{
    MemoryStore, RedisStore, RemoteCacheAdapter, RemoteHit, RemoteStore, create_remote_store,
};
pub use stats::{CacheStats, LocalStats, Tier};
