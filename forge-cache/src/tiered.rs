//! Tiered cache manager: L1 read-through to an optional L2

use crate::{CacheBackend, CacheEntry, CacheKey, CacheStats, MemoryCache};
use std::sync::Arc;
use tracing::warn;

/// L1-over-L2 composition. On L1 miss the backend is consulted and a hit is
/// back-filled into L1; writes go through to both. Backend failures are
/// logged and treated as misses so a broken L2 can never fail a build - a
/// miss costs at most one backend round-trip.
pub struct TieredCache {
    l1: MemoryCache,
    l2: Option<Arc<dyn CacheBackend>>,
    default_ttl_seconds: Option<u64>,
}

impl TieredCache {
    pub fn new(max_entries: usize, default_ttl_seconds: Option<u64>) -> Self {
        Self {
            l1: MemoryCache::new(max_entries),
            l2: None,
            default_ttl_seconds,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.l2 = Some(backend);
        self
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        if let Some(entry) = self.l1.get(key) {
            return Some(entry);
        }

        let backend = self.l2.as_ref()?;
        match backend.get(key).await {
            Ok(Some(entry)) => {
                // Back-fill so the next lookup stays in-process.
                self.l1.set(key.clone(), entry.clone());
                Some(entry)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(backend = backend.name(), key = %key, error = %err, "L2 get failed, treating as miss");
                None
            }
        }
    }

    pub async fn set(&self, key: CacheKey, value: Vec<u8>) {
        let entry = CacheEntry::new(value, self.default_ttl_seconds);
        self.l1.set(key.clone(), entry.clone());
        if let Some(backend) = &self.l2 {
            if let Err(err) = backend.set(&key, entry, self.default_ttl_seconds).await {
                warn!(backend = backend.name(), key = %key, error = %err, "L2 set failed, entry is L1-only");
            }
        }
    }

    pub async fn delete(&self, key: &CacheKey) {
        self.l1.delete(key);
        if let Some(backend) = &self.l2 {
            if let Err(err) = backend.delete(key).await {
                warn!(backend = backend.name(), key = %key, error = %err, "L2 delete failed");
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.l1.stats()
    }
}
