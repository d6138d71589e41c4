//! Process-local remote store.
//!
//! Implements the remote primitives over a `DashMap`, for tests and for
//! single-node deployments that still want the L2 code path.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::RemoteStore;
use crate::error::CacheError;
use crate::pattern::Glob;

#[derive(Debug)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored bytes, bypassing expiry.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).map(|entry| entry.data.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Ok(Some(entry.data.clone()));
            }
            // Remove expired entry
            drop(entry);
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        // A TTL past the end of `Instant`'s range never expires
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Instant::now().checked_add(ttl)
        };
        self.entries.insert(
            key.to_string(),
            StoredValue {
                data: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired()))
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.contains(key))
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let glob = Glob::new(pattern)?;
        let mut removed = 0;
        self.entries.retain(|key, entry| {
            if glob.is_match(key) {
                if !entry.is_expired() {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}
