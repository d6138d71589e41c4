//! Bounded in-process tier (L1).
//!
//! A single mutex guards the recency list, the tag index and the byte total
//! so the three never disagree. The critical sections only move pointers:
//! callers hand in already-serialized payloads and receive `Arc` clones.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::CacheConfig;
use crate::pattern::Glob;
use crate::stats::{LocalStats, Tier};

/// A cached payload with its bookkeeping.
///
/// The data is wrapped in `Arc` to allow cheap cloning on cache hits and to
/// share one buffer between the local and remote write paths.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub key: String,
    pub value: Arc<Vec<u8>>,
    pub created_at: Instant,
    pub accessed_at: Instant,
    pub access_count: u64,
    /// `Duration::ZERO` means the entry never expires
    pub ttl: Duration,
    pub size_bytes: usize,
    pub tags: Vec<String>,
    pub tier: Tier,
}

impl CacheEntry {
    fn new(key: String, value: Arc<Vec<u8>>, ttl: Duration, tags: Vec<String>) -> Self {
        let now = Instant::now();
        Self {
            size_bytes: entry_size(&key, &value),
            key,
            value,
            created_at: now,
            accessed_at: now,
            access_count: 0,
            ttl,
            tags,
            tier: Tier::L1,
        }
    }

    /// Check if this entry has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    fn is_expired_at(&self, now: Instant) -> bool {
        !self.ttl.is_zero() && now.saturating_duration_since(self.created_at) > self.ttl
    }
}

/// Bytes an entry counts against the pool budget.
#[inline]
pub fn entry_size(key: &str, value: &[u8]) -> usize {
    key.len() + value.len()
}

const GENERATION_STRIPES: usize = 64;

/// Write/invalidation state a key was observed under.
///
/// Taken before a slow read from another tier and handed back to
/// [`BoundedLocalCache::set_if_unchanged`], which refuses the write if the key
/// was written or invalidated in between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Generation {
    epoch: u64,
    stripe: u64,
}

struct Pool {
    /// Least-recently-used entry at the tail, pushes and hits go to the head
    entries: LruCache<String, CacheEntry>,
    /// tag -> keys currently carrying that tag
    tag_index: HashMap<String, HashSet<String>>,
    total_bytes: usize,
    /// Bumped by bulk invalidations (tags, patterns, clear)
    epoch: u64,
    /// Bumped by writes and removals of any key hashing to the stripe
    stripes: [u64; GENERATION_STRIPES],
}

impl Pool {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            tag_index: HashMap::new(),
            total_bytes: 0,
            epoch: 0,
            stripes: [0; GENERATION_STRIPES],
        }
    }

    fn stripe_of(key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % GENERATION_STRIPES as u64) as usize
    }

    fn generation(&self, key: &str) -> Generation {
        Generation {
            epoch: self.epoch,
            stripe: self.stripes[Self::stripe_of(key)],
        }
    }

    fn touch(&mut self, key: &str) {
        let stripe = &mut self.stripes[Self::stripe_of(key)];
        *stripe = stripe.wrapping_add(1);
    }

    fn bump_epoch(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
    }

    fn insert(&mut self, entry: CacheEntry) {
        for tag in &entry.tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(entry.key.clone());
        }
        self.total_bytes += entry.size_bytes;
        self.entries.push(entry.key.clone(), entry);
    }

    fn detach(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.forget(&entry);
        Some(entry)
    }

    fn detach_lru(&mut self) -> Option<CacheEntry> {
        let (_, entry) = self.entries.pop_lru()?;
        self.forget(&entry);
        Some(entry)
    }

    fn forget(&mut self, entry: &CacheEntry) {
        self.total_bytes -= entry.size_bytes;
        for tag in &entry.tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(&entry.key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.tag_index.clear();
        self.total_bytes = 0;
        self.bump_epoch();
    }
}

/// Thread-safe, recency-ordered store bounded by entry count and bytes.
///
/// Every failure is reported as `false`/`None`; callers fall through to the
/// next tier.
pub struct BoundedLocalCache {
    pool: Mutex<Pool>,
    max_entries: usize,
    max_bytes: usize,
    max_item_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl BoundedLocalCache {
    /// Create a pool holding at most `max_entries` entries and `max_bytes` bytes,
    /// rejecting single items above `max_item_bytes`.
    pub fn new(max_entries: usize, max_bytes: usize, max_item_bytes: usize) -> Self {
        Self {
            pool: Mutex::new(Pool::new()),
            max_entries,
            max_bytes,
            max_item_bytes: max_item_bytes.min(max_bytes),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            config.l1_max_entries,
            config.l1_max_memory_bytes,
            config.l1_max_item_bytes,
        )
    }

    /// Look up a key, promoting it to most-recently-used on a hit.
    ///
    /// An expired entry is dropped on the spot and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let now = Instant::now();
        let mut pool = self.pool.lock();

        let Some(expired) = pool.entries.peek(key).map(|entry| entry.is_expired_at(now)) else {
            drop(pool);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if expired {
            pool.detach(key);
            drop(pool);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, "L1 entry expired");
            return None;
        }

        let value = pool.entries.get_mut(key).map(|entry| {
            entry.accessed_at = now;
            entry.access_count += 1;
            Arc::clone(&entry.value)
        });
        drop(pool);

        self.hits.fetch_add(1, Ordering::Relaxed);
        value
    }

    /// Insert or replace an entry.
    ///
    /// Returns `false` without touching the pool when the item exceeds the
    /// per-item cap or the whole budget. Otherwise least-recently-used entries
    /// are evicted until the item fits under both bounds.
    pub fn set(&self, key: &str, value: Arc<Vec<u8>>, ttl: Duration, tags: &[String]) -> bool {
        self.insert(key, value, ttl, tags, None)
    }

    /// Current generation of `key`, to be passed to [`Self::set_if_unchanged`].
    pub fn generation(&self, key: &str) -> Generation {
        self.pool.lock().generation(key)
    }

    /// Like [`Self::set`], but only if `key` has not been written or
    /// invalidated since `seen` was taken.
    pub fn set_if_unchanged(
        &self,
        key: &str,
        value: Arc<Vec<u8>>,
        ttl: Duration,
        tags: &[String],
        seen: Generation,
    ) -> bool {
        self.insert(key, value, ttl, tags, Some(seen))
    }

    fn insert(
        &self,
        key: &str,
        value: Arc<Vec<u8>>,
        ttl: Duration,
        tags: &[String],
        seen: Option<Generation>,
    ) -> bool {
        let size = entry_size(key, &value);
        if size > self.max_item_bytes {
            tracing::debug!(
                key = %key,
                size,
                max_item_bytes = self.max_item_bytes,
                "L1 rejected oversized item"
            );
            return false;
        }

        let mut tags = tags.to_vec();
        tags.sort_unstable();
        tags.dedup();
        let entry = CacheEntry::new(key.to_string(), value, ttl, tags);

        let mut evicted = 0u64;
        {
            let mut pool = self.pool.lock();
            if let Some(seen) = seen
                && pool.generation(key) != seen
            {
                drop(pool);
                tracing::debug!(key = %key, "L1 write skipped, key changed since read");
                return false;
            }
            pool.touch(key);
            pool.detach(key);
            while pool.entries.len() + 1 > self.max_entries
                || pool.total_bytes + size > self.max_bytes
            {
                if pool.detach_lru().is_none() {
                    break;
                }
                evicted += 1;
            }
            pool.insert(entry);
        }

        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            crate::metrics::record_cache_evictions(evicted);
            tracing::debug!(key = %key, evicted, "L1 evicted entries to make room");
        }
        true
    }

    /// Remove a key. Returns whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        let mut pool = self.pool.lock();
        pool.touch(key);
        pool.detach(key).is_some()
    }

    pub fn clear(&self) {
        self.pool.lock().clear();
    }

    /// Remove every entry carrying at least one of `tags`.
    pub fn clear_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        let mut pool = self.pool.lock();
        pool.bump_epoch();
        let keys: HashSet<String> = tags
            .iter()
            .filter_map(|tag| pool.tag_index.get(tag.as_ref()))
            .flat_map(|keys| keys.iter().cloned())
            .collect();

        keys.iter().filter(|key| pool.detach(key).is_some()).count()
    }

    /// Remove every entry whose key matches `glob`.
    pub fn clear_by_pattern(&self, glob: &Glob) -> usize {
        let mut pool = self.pool.lock();
        pool.bump_epoch();
        let keys: Vec<String> = pool
            .entries
            .iter()
            .filter(|(key, _)| glob.is_match(key))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            pool.detach(key);
        }
        keys.len()
    }

    /// Drop every entry whose TTL has elapsed. Returns the number removed.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let removed = {
            let mut pool = self.pool.lock();
            let expired: Vec<String> = pool
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired_at(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                pool.detach(key);
            }
            expired.len()
        };

        if removed > 0 {
            self.expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Non-expired presence check that leaves recency untouched.
    pub fn contains(&self, key: &str) -> bool {
        self.pool
            .lock()
            .entries
            .peek(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    /// Copy of an entry's bookkeeping without promoting it.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.pool.lock().entries.peek(key).cloned()
    }

    /// Keys ordered from most- to least-recently used.
    pub fn keys(&self) -> Vec<String> {
        self.pool
            .lock()
            .entries
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Keys currently indexed under `tag`.
    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        self.pool
            .lock()
            .tag_index
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.pool.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.pool.lock().total_bytes
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn stats(&self) -> LocalStats {
        let (entries, memory_bytes) = {
            let pool = self.pool.lock();
            (pool.entries.len(), pool.total_bytes)
        };
        LocalStats {
            entries,
            memory_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Arc<Vec<u8>> {
        Arc::new(s.as_bytes().to_vec())
    }

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    fn cache(max_entries: usize) -> BoundedLocalCache {
        BoundedLocalCache::new(max_entries, 1024 * 1024, 64 * 1024)
    }

    #[test]
    fn test_set_and_get() {
        let cache = cache(10);
        assert!(cache.set("k", bytes("v"), Duration::ZERO, &[]));

        assert_eq!(cache.get("k"), Some(bytes("v")));
        let entry = cache.peek("k").unwrap();
        assert_eq!(entry.access_count, 1);
        assert_eq!(entry.size_bytes, 2);
        assert_eq!(entry.tier, Tier::L1);

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_miss() {
        let cache = cache(10);
        assert!(cache.get("nonexistent").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_lru_evicts_head_when_count_exceeded() {
        let cache = cache(2);
        cache.set("a", bytes("1"), Duration::ZERO, &[]);
        cache.set("b", bytes("2"), Duration::ZERO, &[]);
        cache.set("c", bytes("3"), Duration::ZERO, &[]);

        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b"), Some(bytes("2")));
        assert_eq!(cache.get("c"), Some(bytes("3")));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_get_refreshes_recency() {
        let cache = cache(2);
        cache.set("a", bytes("1"), Duration::ZERO, &[]);
        cache.set("b", bytes("2"), Duration::ZERO, &[]);
        assert!(cache.get("a").is_some());
        cache.set("c", bytes("3"), Duration::ZERO, &[]);

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert_eq!(cache.keys(), vec!["c", "a"]);
    }

    #[test]
    fn test_retains_most_recent_keys() {
        let cache = cache(5);
        for i in 0..20 {
            cache.set(&format!("k{i}"), bytes("v"), Duration::ZERO, &[]);
        }
        assert_eq!(cache.len(), 5);
        assert_eq!(cache.keys(), vec!["k19", "k18", "k17", "k16", "k15"]);
    }

    #[test]
    fn test_memory_bound_evicts_until_fit() {
        // Each entry is 1 (key) + 10 (value) = 11 bytes
        let cache = BoundedLocalCache::new(100, 33, 33);
        for key in ["a", "b", "c"] {
            assert!(cache.set(key, bytes("0123456789"), Duration::ZERO, &[]));
        }
        assert_eq!(cache.total_bytes(), 33);

        // 1 + 20 bytes needs two evictions
        assert!(cache.set("d", bytes("01234567890123456789"), Duration::ZERO, &[]));
        assert_eq!(cache.keys(), vec!["d", "c"]);
        assert!(cache.total_bytes() <= 33);
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_oversized_item_rejected_without_side_effect() {
        let cache = BoundedLocalCache::new(10, 1024, 8);
        cache.set("a", bytes("1"), Duration::ZERO, &tags(&["t"]));

        assert!(!cache.set("big", bytes("way too large"), Duration::ZERO, &[]));
        assert_eq!(cache.keys(), vec!["a"]);
        assert_eq!(cache.keys_for_tag("t"), vec!["a"]);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_overwrite_replaces_bytes_and_tags() {
        let cache = cache(10);
        cache.set("k", bytes("short"), Duration::ZERO, &tags(&["old"]));
        cache.set("k", bytes("much longer value"), Duration::ZERO, &tags(&["new"]));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 1 + "much longer value".len());
        assert!(cache.keys_for_tag("old").is_empty());
        assert_eq!(cache.keys_for_tag("new"), vec!["k"]);
    }

    #[test]
    fn test_expiration_is_lazy_miss() {
        let cache = cache(10);
        cache.set("k", bytes("v"), Duration::from_millis(10), &tags(&["t"]));
        assert!(cache.get("k").is_some());

        std::thread::sleep(Duration::from_millis(20));

        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
        assert!(cache.keys_for_tag("t").is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_remove_expired() {
        let cache = cache(10);
        for i in 0..3 {
            cache.set(&format!("short-{i}"), bytes("v"), Duration::from_millis(10), &[]);
        }
        cache.set("forever", bytes("v"), Duration::ZERO, &[]);

        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cache.remove_expired(), 3);
        assert_eq!(cache.keys(), vec!["forever"]);
        assert_eq!(cache.stats().expirations, 3);
    }

    #[test]
    fn test_clear_by_tags_keeps_index_consistent() {
        let cache = cache(10);
        cache.set("o1", bytes("v"), Duration::ZERO, &tags(&["orders"]));
        cache.set("o2", bytes("v"), Duration::ZERO, &tags(&["orders", "users"]));
        cache.set("u1", bytes("v"), Duration::ZERO, &tags(&["users"]));
        cache.set("plain", bytes("v"), Duration::ZERO, &[]);

        assert_eq!(cache.clear_by_tags(&["orders"]), 2);
        assert_eq!(cache.keys_for_tag("users"), vec!["u1"]);
        assert!(cache.keys_for_tag("orders").is_empty());

        // Idempotent
        assert_eq!(cache.clear_by_tags(&["orders"]), 0);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_eviction_drops_tag_references() {
        let cache = cache(1);
        cache.set("a", bytes("1"), Duration::ZERO, &tags(&["t"]));
        cache.set("b", bytes("2"), Duration::ZERO, &[]);
        assert!(cache.keys_for_tag("t").is_empty());
    }

    #[test]
    fn test_clear_by_pattern() {
        let cache = cache(10);
        cache.set("user:1", bytes("v"), Duration::ZERO, &[]);
        cache.set("user:2", bytes("v"), Duration::ZERO, &[]);
        cache.set("org:1", bytes("v"), Duration::ZERO, &[]);

        let glob = Glob::new("user:*").unwrap();
        assert_eq!(cache.clear_by_pattern(&glob), 2);
        assert_eq!(cache.keys(), vec!["org:1"]);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = cache(10);
        cache.set("a", bytes("1"), Duration::ZERO, &[]);
        cache.set("b", bytes("2"), Duration::ZERO, &[]);

        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_set_if_unchanged_after_remove() {
        let cache = cache(10);
        let seen = cache.generation("k");
        assert!(cache.set_if_unchanged("k", bytes("v1"), Duration::ZERO, &[], seen));

        // A removal between the read and the write-back wins
        let seen = cache.generation("k");
        cache.remove("k");
        assert!(!cache.set_if_unchanged("k", bytes("stale"), Duration::ZERO, &[], seen));
        assert!(!cache.contains("k"));
    }

    #[test]
    fn test_set_if_unchanged_after_newer_write() {
        let cache = cache(10);
        let seen = cache.generation("k");
        cache.set("k", bytes("new"), Duration::ZERO, &[]);

        assert!(!cache.set_if_unchanged("k", bytes("old"), Duration::ZERO, &[], seen));
        assert_eq!(cache.get("k"), Some(bytes("new")));
    }

    #[test]
    fn test_bulk_invalidation_changes_generation() {
        let cache = cache(10);
        let glob = Glob::new("user:*").unwrap();

        let seen = cache.generation("k");
        cache.clear_by_tags(&["unrelated"]);
        assert_ne!(cache.generation("k"), seen);

        let seen = cache.generation("k");
        cache.clear_by_pattern(&glob);
        assert_ne!(cache.generation("k"), seen);

        let seen = cache.generation("k");
        cache.clear();
        assert_ne!(cache.generation("k"), seen);

        // Reads and evictions leave it alone
        let seen = cache.generation("k");
        cache.get("k");
        cache.remove_expired();
        assert_eq!(cache.generation("k"), seen);
    }

    #[test]
    fn test_concurrent_writers_respect_bounds() {
        let cache = Arc::new(BoundedLocalCache::new(50, 2_000, 100));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let key = format!("t{t}-k{i}");
                        cache.set(&key, bytes("payload"), Duration::ZERO, &[]);
                        cache.get(&key);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(cache.len() <= 50);
        assert!(cache.total_bytes() <= 2_000);
    }
}
