//! Bounded LRU cache of identity records.
//!
//! Entries are snapshots of the identity store. A record changed by another
//! writer stays stale here until it is evicted or refreshed by a local
//! enrollment.

use crate::config::CacheConfig;
use crate::store::IdentityRecord;
use linked_hash_map::LinkedHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time view of cache usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

pub struct IdentityCache {
    entries: Mutex<LinkedHashMap<String, IdentityRecord>>,
    capacity: usize,
    counters: Counters,
}

impl IdentityCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LinkedHashMap::new()),
            capacity: capacity.max(1),
            counters: Counters::default(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity)
    }

    fn lock(&self) -> MutexGuard<'_, LinkedHashMap<String, IdentityRecord>> {
        // Entries are plain snapshots, so a poisoned map is still consistent
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up a record, marking it most recently used.
    pub fn get(&self, identity_id: &str) -> Option<IdentityRecord> {
        let mut entries = self.lock();
        match entries.get_refresh(identity_id) {
            Some(record) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(record.clone())
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace a record. Returns the identity evicted to make room.
    pub fn put(&self, identity_id: impl Into<String>, record: IdentityRecord) -> Option<String> {
        let identity_id = identity_id.into();
        let mut entries = self.lock();

        entries.remove(&identity_id);
        entries.insert(identity_id, record);

        if entries.len() <= self.capacity {
            return None;
        }

        let (evicted, _) = entries.pop_front()?;
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        log::debug!("Evicted identity {} from cache", evicted);
        Some(evicted)
    }

    pub fn contains(&self, identity_id: &str) -> bool {
        self.lock().contains_key(identity_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            len: self.len(),
            capacity: self.capacity,
        }
    }
}
