//! In-process TTL cache backed by DashMap for lock-free concurrent access.
//! Sits in front of the document store to absorb hot experiment and flag
//! reads; every write to an entity must invalidate its entry synchronously.

use dashmap::DashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// Short-TTL read cache owned by a service instance. Deliberately not a
/// module-level singleton so tests run in isolation and multiple service
/// instances never share stale state.
pub struct TtlCache<K, V> {
    store: DashMap<K, CacheEntry<V>>,
    ttl: Duration,
    max_entries: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl_secs: u64, max_entries: usize) -> Self {
        Self {
            store: DashMap::with_capacity(max_entries.min(1024)),
            ttl: Duration::from_secs(ttl_secs),
            max_entries,
        }
    }

    /// Get a value, returns None if expired or missing.
    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.store.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            drop(entry);
            self.store.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Insert or refresh a value.
    pub fn put(&self, key: K, value: V) {
        // Simple eviction: if over capacity, skip insert (periodic cleanup
        // handles the rest)
        if self.store.len() >= self.max_entries && !self.store.contains_key(&key) {
            return;
        }
        self.store.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop a single entry. Must be called on every write to the cached
    /// entity.
    pub fn invalidate(&self, key: &K) {
        self.store.remove(key);
    }

    /// Remove expired entries. Call periodically from a background task.
    pub fn evict_expired(&self) -> usize {
        let before = self.store.len();
        self.store
            .retain(|_, entry| entry.inserted_at.elapsed() <= self.ttl);
        before - self.store.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}
