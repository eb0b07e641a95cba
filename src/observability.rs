//! Metrics hooks for cache traffic.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Receives cache events. Every method defaults to a no-op.
///
/// Implementations must be cheap: they are called on every region access.
pub trait CacheMetrics: Send + Sync {
    fn record_hit(&self, _region: &str, _key: &str, _duration: Duration) {}

    fn record_miss(&self, _region: &str, _key: &str, _duration: Duration) {}

    fn record_put(&self, _region: &str, _key: &str) {}

    /// An unlock was attempted with a token that does not own the lock.
    fn record_lock_mismatch(&self, _region: &str, _key: &str) {}

    fn record_error(&self, _key: &str, _error: &str) {}
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {}

#[derive(Debug, Default)]
struct RegionCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    lock_mismatches: AtomicU64,
}

/// Snapshot of one region's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionStatistics {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub lock_mismatches: u64,
}

/// Per-region hit / miss / put / lock-mismatch counters.
///
/// # Example
///
/// ```
/// use orm_cache::observability::{CacheMetrics, StatisticsMetrics};
/// use std::time::Duration;
///
/// let stats = StatisticsMetrics::new();
/// stats.record_hit("orders", "Order_id=1", Duration::ZERO);
/// stats.record_miss("orders", "Order_id=2", Duration::ZERO);
///
/// assert_eq!(stats.region("orders").hits, 1);
/// assert_eq!(stats.miss_count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct StatisticsMetrics {
    regions: DashMap<String, RegionCounters>,
    errors: AtomicU64,
}

impl StatisticsMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, region: &str, pick: impl Fn(&RegionCounters) -> &AtomicU64) {
        if let Some(counters) = self.regions.get(region) {
            pick(counters.value()).fetch_add(1, Ordering::Relaxed);
            return;
        }
        let counters = self.regions.entry(region.to_string()).or_default();
        pick(counters.value()).fetch_add(1, Ordering::Relaxed);
    }

    pub fn region(&self, region: &str) -> RegionStatistics {
        self.regions
            .get(region)
            .map(|c| RegionStatistics {
                hits: c.hits.load(Ordering::Relaxed),
                misses: c.misses.load(Ordering::Relaxed),
                puts: c.puts.load(Ordering::Relaxed),
                lock_mismatches: c.lock_mismatches.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    pub fn hit_count(&self) -> u64 {
        self.sum(|c| &c.hits)
    }

    pub fn miss_count(&self) -> u64 {
        self.sum(|c| &c.misses)
    }

    pub fn put_count(&self) -> u64 {
        self.sum(|c| &c.puts)
    }

    pub fn lock_mismatch_count(&self) -> u64 {
        self.sum(|c| &c.lock_mismatches)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.regions.clear();
        self.errors.store(0, Ordering::Relaxed);
    }

    fn sum(&self, pick: impl Fn(&RegionCounters) -> &AtomicU64) -> u64 {
        self.regions
            .iter()
            .map(|c| pick(c.value()).load(Ordering::Relaxed))
            .sum()
    }
}

impl CacheMetrics for StatisticsMetrics {
    fn record_hit(&self, region: &str, _key: &str, _duration: Duration) {
        self.bump(region, |c| &c.hits);
    }

    fn record_miss(&self, region: &str, _key: &str, _duration: Duration) {
        self.bump(region, |c| &c.misses);
    }

    fn record_put(&self, region: &str, _key: &str) {
        self.bump(region, |c| &c.puts);
    }

    fn record_lock_mismatch(&self, region: &str, _key: &str) {
        self.bump(region, |c| &c.lock_mismatches);
    }

    fn record_error(&self, _key: &str, _error: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}
