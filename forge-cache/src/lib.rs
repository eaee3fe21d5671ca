//! FORGE Cache - Content-Addressed Multi-Tier Caching
//!
//! Three logical layers share one mechanism: segment-level entries skip the
//! sanitize chain for repeated content, prefix-level entries reuse token-
//! counted static heads, and package-level entries skip the whole pipeline.
//! Keys are deterministic hashes over content, model, and policy version.
//!
//! L1 is an in-process LRU with per-entry TTL. L2 is an optional external
//! backend behind an async trait with read-through and write-through. Cache
//! errors are warnings, never fatal: the engine treats any failure as a miss.

mod key;
mod entry;
mod memory;
mod backend;
mod tiered;

pub use key::{package_key, package_key_model_agnostic, prefix_key, segment_key, CacheKey};

pub use entry::CacheEntry;

pub use memory::{CacheStats, MemoryCache};

pub use backend::{CacheBackend, InMemoryBackend};

pub use tiered::TieredCache;
