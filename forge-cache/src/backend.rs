//! L2 cache backend trait

use crate::{CacheEntry, CacheKey};
use async_trait::async_trait;
use dashmap::DashMap;
use forge_core::ForgeResult;

/// Out-of-process cache protocol. Implementations (Redis, memcached, a
/// sidecar) live outside the engine; values are opaque bytes and the engine
/// owns serialization. Implementations must be safe under concurrent calls.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &CacheKey) -> ForgeResult<Option<CacheEntry>>;

    async fn set(&self, key: &CacheKey, entry: CacheEntry, ttl_seconds: Option<u64>)
        -> ForgeResult<()>;

    async fn delete(&self, key: &CacheKey) -> ForgeResult<()>;

    async fn exists(&self, key: &CacheKey) -> ForgeResult<bool>;

    async fn clear(&self) -> ForgeResult<()>;

    /// Backend identifier for warnings and stats.
    fn name(&self) -> &str;
}

/// Reference backend over a concurrent map. Stands in for an external store
/// in tests and single-process deployments.
pub struct InMemoryBackend {
    entries: DashMap<CacheKey, CacheEntry>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &CacheKey) -> ForgeResult<Option<CacheEntry>> {
        let now = chrono::Utc::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired(now) {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.clone()));
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &CacheKey,
        mut entry: CacheEntry,
        ttl_seconds: Option<u64>,
    ) -> ForgeResult<()> {
        if let Some(secs) = ttl_seconds {
            entry.expires_at = Some(
                chrono::Utc::now()
                    + chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX)),
            );
        }
        self.entries.insert(key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> ForgeResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &CacheKey) -> ForgeResult<bool> {
        Ok(self.entries.contains_key(key))
    }

    async fn clear(&self) -> ForgeResult<()> {
        self.entries.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment_key;

    #[tokio::test]
    async fn test_backend_round_trip() {
        let backend = InMemoryBackend::new();
        let key = segment_key("a", "m");
        backend
            .set(&key, CacheEntry::new(b"v".to_vec(), None), None)
            .await
            .unwrap();
        assert!(backend.exists(&key).await.unwrap());
        let entry = backend.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.value, b"v");
        backend.delete(&key).await.unwrap();
        assert!(!backend.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_backend_ttl_override() {
        let backend = InMemoryBackend::new();
        let key = segment_key("a", "m");
        let mut entry = CacheEntry::new(b"v".to_vec(), None);
        entry.expires_at = None;
        backend.set(&key, entry, Some(0)).await.unwrap();
        // TTL of zero expires immediately.
        assert!(backend.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backend_clear() {
        let backend = InMemoryBackend::new();
        backend
            .set(&segment_key("a", "m"), CacheEntry::new(vec![1], None), None)
            .await
            .unwrap();
        backend.clear().await.unwrap();
        assert!(backend.is_empty());
    }
}
