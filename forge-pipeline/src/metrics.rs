//! In-memory build metrics

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Aggregated timing for one stage across builds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub count: u64,
    pub total_ms: f64,
    pub max_ms: f64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub builds: u64,
    pub build_failures: u64,
    pub package_cache_hits: u64,
    pub package_cache_misses: u64,
    pub segments_dropped: u64,
    pub stages: BTreeMap<String, StageTiming>,
}

/// Process-wide counters for the facade. No exporters; callers scrape the
/// snapshot and feed whatever system they run.
#[derive(Debug, Default)]
pub struct Metrics {
    builds: AtomicU64,
    build_failures: AtomicU64,
    package_cache_hits: AtomicU64,
    package_cache_misses: AtomicU64,
    segments_dropped: AtomicU64,
    stages: Mutex<BTreeMap<String, StageTiming>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_build(&self) {
        self.builds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.build_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.package_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.package_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: u64) {
        self.segments_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_stage(&self, name: &str, elapsed_ms: f64) {
        let mut stages = self.stages.lock().expect("metrics lock poisoned");
        let timing = stages.entry(name.to_string()).or_default();
        timing.count += 1;
        timing.total_ms += elapsed_ms;
        if elapsed_ms > timing.max_ms {
            timing.max_ms = elapsed_ms;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            builds: self.builds.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            package_cache_hits: self.package_cache_hits.load(Ordering::Relaxed),
            package_cache_misses: self.package_cache_misses.load(Ordering::Relaxed),
            segments_dropped: self.segments_dropped.load(Ordering::Relaxed),
            stages: self.stages.lock().expect("metrics lock poisoned").clone(),
        }
    }
}
