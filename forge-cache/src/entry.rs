//! Cache entry value type

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One cached value plus its bookkeeping. Values are opaque bytes; the
/// engine owns serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Vec<u8>,
    pub hit_count: u64,
    pub created_at: DateTime<Utc>,
    /// None means no expiry.
    pub expires_at: Option<DateTime<Utc>>,
    pub last_access_at: DateTime<Utc>,
    pub size_bytes: usize,
}

impl CacheEntry {
    pub fn new(value: Vec<u8>, ttl_seconds: Option<u64>) -> Self {
        let now = Utc::now();
        let size_bytes = value.len();
        Self {
            value,
            hit_count: 0,
            created_at: now,
            expires_at: ttl_seconds
                .map(|secs| now + Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))),
            last_access_at: now,
            size_bytes,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }

    /// Record a hit: bump the counter and the access time.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.hit_count += 1;
        self.last_access_at = now;
    }
}
