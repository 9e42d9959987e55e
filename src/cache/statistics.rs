//! Cache Statistics
//!
//! Lock-free counters aggregated by the cache engine, and the snapshot
//! handed to callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Counters for one cache
#[derive(Debug, Default)]
pub struct CacheStatistics {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses_not_found: AtomicU64,
    misses_expired: AtomicU64,

    puts: AtomicU64,
    updates: AtomicU64,
    removals: AtomicU64,

    evictions: AtomicU64,
    expirations: AtomicU64,

    // Overflow path
    overflow_writes: AtomicU64,
    overflow_discards: AtomicU64,
    disk_write_failures: AtomicU64,

    // Exponential moving average, microseconds
    average_get_time_us: AtomicU64,
}

impl CacheStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    // Lookups
    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_hit(&self) {
        self.disk_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss_not_found(&self) {
        self.misses_not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss_expired(&self) {
        self.misses_expired.fetch_add(1, Ordering::Relaxed);
    }

    // Mutations
    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_removal(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, count: u64) {
        self.expirations.fetch_add(count, Ordering::Relaxed);
    }

    // Overflow
    pub fn record_overflow_write(&self) {
        self.overflow_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow_discard(&self) {
        self.overflow_discards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_write_failure(&self) {
        self.disk_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get_time(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = self.average_get_time_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .average_get_time_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn memory_hits(&self) -> u64 {
        self.memory_hits.load(Ordering::Relaxed)
    }

    pub fn disk_hits(&self) -> u64 {
        self.disk_hits.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.memory_hits() + self.disk_hits()
    }

    pub fn misses_not_found(&self) -> u64 {
        self.misses_not_found.load(Ordering::Relaxed)
    }

    pub fn misses_expired(&self) -> u64 {
        self.misses_expired.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses_not_found() + self.misses_expired()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn overflow_discards(&self) -> u64 {
        self.overflow_discards.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn average_get_time(&self) -> Duration {
        Duration::from_micros(self.average_get_time_us.load(Ordering::Relaxed))
    }

    /// Snapshot the counters together with the live tier sizes
    pub fn snapshot(&self, sizes: TierSizes) -> StatisticsSnapshot {
        StatisticsSnapshot {
            cache_name: sizes.cache_name,
            hits: self.hits(),
            memory_hits: self.memory_hits(),
            disk_hits: self.disk_hits(),
            misses: self.misses(),
            misses_not_found: self.misses_not_found(),
            misses_expired: self.misses_expired(),
            hit_ratio: self.hit_ratio(),
            puts: self.puts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            evictions: self.evictions(),
            expirations: self.expirations.load(Ordering::Relaxed),
            overflow_writes: self.overflow_writes.load(Ordering::Relaxed),
            overflow_discards: self.overflow_discards(),
            disk_write_failures: self.disk_write_failures.load(Ordering::Relaxed),
            memory_store_size: sizes.memory,
            disk_store_size: sizes.disk,
            size: sizes.memory + sizes.disk,
            average_get_time: self.average_get_time(),
        }
    }

    /// Reset every counter
    pub fn clear(&self) {
        for counter in [
            &self.memory_hits,
            &self.disk_hits,
            &self.misses_not_found,
            &self.misses_expired,
            &self.puts,
            &self.updates,
            &self.removals,
            &self.evictions,
            &self.expirations,
            &self.overflow_writes,
            &self.overflow_discards,
            &self.disk_write_failures,
            &self.average_get_time_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Live tier sizes merged into a snapshot
#[derive(Debug, Clone, Default)]
pub struct TierSizes {
    pub cache_name: String,
    pub memory: usize,
    pub disk: usize,
}

/// Point-in-time view of a cache's statistics
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsSnapshot {
    pub cache_name: String,

    // Lookups
    pub hits: u64,
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub misses_not_found: u64,
    pub misses_expired: u64,
    pub hit_ratio: f64,

    // Mutations
    pub puts: u64,
    pub updates: u64,
    pub removals: u64,
    pub evictions: u64,
    pub expirations: u64,

    // Overflow
    pub overflow_writes: u64,
    pub overflow_discards: u64,
    pub disk_write_failures: u64,

    // Sizes
    pub memory_store_size: usize,
    pub disk_store_size: usize,
    pub size: usize,

    pub average_get_time: Duration,
}

/// Get latency helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_miss_tracking() {
        let stats = CacheStatistics::new();

        stats.record_memory_hit();
        stats.record_disk_hit();
        stats.record_miss_not_found();
        stats.record_miss_expired();

        assert_eq!(stats.hits(), 2);
        assert_eq!(stats.misses(), 2);
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_hit_ratio() {
        assert_eq!(CacheStatistics::new().hit_ratio(), 0.0);
    }

    #[test]
    fn test_get_time_average() {
        let stats = CacheStatistics::new();

        stats.record_get_time(Duration::from_micros(100));
        assert_eq!(stats.average_get_time(), Duration::from_micros(100));

        stats.record_get_time(Duration::from_micros(200));
        let avg = stats.average_get_time().as_micros();
        assert!(avg > 100 && avg < 200);
    }

    #[test]
    fn test_snapshot_merges_sizes() {
        let stats = CacheStatistics::new();
        stats.record_put();
        stats.record_eviction();

        let snapshot = stats.snapshot(TierSizes {
            cache_name: "c".into(),
            memory: 3,
            disk: 4,
        });

        assert_eq!(snapshot.cache_name, "c");
        assert_eq!(snapshot.puts, 1);
        assert_eq!(snapshot.evictions, 1);
        assert_eq!(snapshot.size, 7);
    }

    #[test]
    fn test_clear() {
        let stats = CacheStatistics::new();
        stats.record_memory_hit();
        stats.record_overflow_discard();
        stats.record_get_time(Duration::from_micros(5));

        stats.clear();

        assert_eq!(stats.hits(), 0);
        assert_eq!(stats.overflow_discards(), 0);
        assert_eq!(stats.average_get_time(), Duration::ZERO);
    }
}
