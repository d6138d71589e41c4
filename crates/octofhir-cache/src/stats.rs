//! In-process counters behind `CacheOrchestrator::get_stats`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Cache tier an entry or a counter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    L1,
    L2,
    Origin,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::L1 => "L1",
            Tier::L2 => "L2",
            Tier::Origin => "origin",
        }
    }
}

/// Monotonic counters for the read and write paths.
///
/// Every counter only grows for the lifetime of the orchestrator; the memory
/// gauge lives in the local tier and is sampled when a snapshot is taken.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    origin_hits: AtomicU64,
    misses: AtomicU64,
    l2_errors: AtomicU64,
    write_failures: AtomicU64,
    write_behind_dropped: AtomicU64,
    get_count: AtomicU64,
    get_latency_nanos: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, tier: Tier) {
        let counter = match tier {
            Tier::L1 => &self.l1_hits,
            Tier::L2 => &self.l2_hits,
            Tier::Origin => &self.origin_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_hit(tier.as_str());
    }

    pub fn record_l2_miss(&self) {
        self.l2_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A lookup that no tier (nor the origin) could answer.
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_miss();
    }

    pub fn record_l2_error(&self, operation: &'static str) {
        self.l2_errors.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_l2_error(operation);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_behind_dropped(&self) {
        self.write_behind_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get_latency(&self, elapsed: Duration) {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.get_latency_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        crate::metrics::record_get_duration(elapsed);
    }

    pub fn l2_errors(&self) -> u64 {
        self.l2_errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, local: LocalStats) -> CacheStats {
        let get_count = self.get_count.load(Ordering::Relaxed);
        let latency = self.get_latency_nanos.load(Ordering::Relaxed);
        let average_latency_micros = if get_count == 0 {
            0.0
        } else {
            latency as f64 / get_count as f64 / 1_000.0
        };

        CacheStats {
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l1_misses: local.misses,
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            l2_misses: self.l2_misses.load(Ordering::Relaxed),
            origin_hits: self.origin_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: local.evictions,
            expirations: local.expirations,
            l2_errors: self.l2_errors.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            write_behind_dropped: self.write_behind_dropped.load(Ordering::Relaxed),
            l1_entries: local.entries,
            memory_bytes: local.memory_bytes,
            average_latency_micros,
        }
    }
}

/// Counters kept by the in-process tier itself.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LocalStats {
    pub entries: usize,
    pub memory_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    /// Entries removed by LRU pressure
    pub evictions: u64,
    /// Entries removed because their TTL elapsed (lazily or by the sweeper)
    pub expirations: u64,
}

/// Point-in-time view returned by `get_stats()`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    /// Lookups answered by the origin producer
    pub origin_hits: u64,
    /// Lookups nobody could answer
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub l2_errors: u64,
    pub write_failures: u64,
    pub write_behind_dropped: u64,
    pub l1_entries: usize,
    pub memory_bytes: usize,
    pub average_latency_micros: f64,
}

impl CacheStats {
    /// Share of lookups served from any cache tier, as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.l1_hits + self.l2_hits;
        let total = hits + self.origin_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}
