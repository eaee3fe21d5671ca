//! In-process L1 cache: LRU with per-entry TTL

use crate::{CacheEntry, CacheKey};
use chrono::Utc;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Counters exposed by every cache layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: u64,
    pub evictions: u64,
    pub expired: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Inner {
    entries: LruCache<CacheKey, CacheEntry>,
    stats: CacheStats,
}

/// The L1 cache. LRU eviction on size overflow, lazy TTL expiry on access,
/// both amortised O(1). Safe under concurrent get/set from parallel builds;
/// a single mutex is enough because every operation is a short map touch.
pub struct MemoryCache {
    inner: Mutex<Inner>,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).expect("capacity is at least 1");
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
        }
    }

    /// Look up a key. Expired entries are removed on the way and count as
    /// misses.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = Utc::now();
        let mut guard = self.inner.lock().expect("cache lock poisoned");
        let inner = &mut *guard;

        let expired = matches!(inner.entries.peek(key), Some(entry) if entry.is_expired(now));
        if expired {
            inner.entries.pop(key);
            inner.stats.expired += 1;
            inner.stats.misses += 1;
            return None;
        }

        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.touch(now);
                let found = entry.clone();
                inner.stats.hits += 1;
                Some(found)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Insert or replace. Evicting the LRU entry on overflow is handled by
    /// the underlying map.
    pub fn set(&self, key: CacheKey, entry: CacheEntry) {
        let mut guard = self.inner.lock().expect("cache lock poisoned");
        let inner = &mut *guard;
        let at_capacity = inner.entries.len() == usize::from(inner.entries.cap());
        let replacing = inner.entries.contains(&key);
        if at_capacity && !replacing {
            inner.stats.evictions += 1;
        }
        inner.entries.put(key, entry);
    }

    pub fn delete(&self, key: &CacheKey) -> bool {
        self.inner
            .lock()
            .expect("cache lock poisoned")
            .entries
            .pop(key)
            .is_some()
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .expect("cache lock poisoned")
            .entries
            .clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache lock poisoned");
        let mut stats = inner.stats.clone();
        stats.entry_count = inner.entries.len() as u64;
        stats
    }
}
