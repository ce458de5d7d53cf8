//! Metrics Collection Module
//!
//! Lock-free counters for the read cache and a serializable snapshot of them.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Point-in-time view of the cache counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub cache_size_bytes: u64,
    pub max_cache_size_bytes: u64,
    pub entry_count: u64,
    pub cache_hit_rate_percent: f32,
    /// Reads fully covered by the watermark when they arrived
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Reads served from cache after waiting on a running download
    pub wait_hits: u64,
    /// Reads that fell back to a direct store read after trying the cache
    pub fallback_reads: u64,
    /// Reads served directly because the handle was classified random
    pub random_reads: u64,
    pub bytes_served_from_cache: u64,
    pub bytes_served_from_store: u64,
    pub bytes_downloaded: u64,
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub evictions: u64,
    pub bytes_evicted: u64,
    pub invalidations: u64,
    pub no_cache_resolutions: u64,
}

impl CacheMetrics {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }
}

/// Counters shared by the manager, download jobs, and handles
#[derive(Debug, Default)]
pub struct CacheCounters {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    wait_hits: AtomicU64,
    fallback_reads: AtomicU64,
    random_reads: AtomicU64,
    bytes_served_from_cache: AtomicU64,
    bytes_served_from_store: AtomicU64,
    bytes_downloaded: AtomicU64,
    jobs_started: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    evictions: AtomicU64,
    bytes_evicted: AtomicU64,
    invalidations: AtomicU64,
    no_cache_resolutions: AtomicU64,
}

impl CacheCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self, bytes: u64) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_served_from_cache
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_wait_hit(&self, bytes: u64) {
        self.wait_hits.fetch_add(1, Ordering::Relaxed);
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.bytes_served_from_cache
            .fetch_add(bytes, Ordering::Relaxed);
    }

    /// A read served partly or wholly from the store after trying the cache
    pub fn record_fallback(&self, cached_bytes: u64, store_bytes: u64) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.fallback_reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_served_from_cache
            .fetch_add(cached_bytes, Ordering::Relaxed);
        self.bytes_served_from_store
            .fetch_add(store_bytes, Ordering::Relaxed);
    }

    pub fn record_random_read(&self, bytes: u64) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.random_reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_served_from_store
            .fetch_add(bytes, Ordering::Relaxed);
    }

    /// A read on a handle that never had a cache entry
    pub fn record_uncached_read(&self, bytes: u64) {
        self.bytes_served_from_store
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_job_started(&self) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_cancelled(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, bytes: u64) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.bytes_evicted.fetch_add(bytes, Ordering::Relaxed);
        debug!(
            "Recorded eviction of {} bytes (total evictions: {})",
            bytes,
            self.evictions.load(Ordering::Relaxed)
        );
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_no_cache(&self) {
        self.no_cache_resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn jobs_started(&self) -> u64 {
        self.jobs_started.load(Ordering::Relaxed)
    }

    /// Snapshot the counters. Size fields are filled in by the caller.
    pub fn snapshot(&self) -> CacheMetrics {
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);
        let total = cache_hits + cache_misses;
        let cache_hit_rate_percent = if total > 0 {
            (cache_hits as f32 / total as f32) * 100.0
        } else {
            0.0
        };

        CacheMetrics {
            cache_size_bytes: 0,
            max_cache_size_bytes: 0,
            entry_count: 0,
            cache_hit_rate_percent,
            cache_hits,
            cache_misses,
            wait_hits: self.wait_hits.load(Ordering::Relaxed),
            fallback_reads: self.fallback_reads.load(Ordering::Relaxed),
            random_reads: self.random_reads.load(Ordering::Relaxed),
            bytes_served_from_cache: self.bytes_served_from_cache.load(Ordering::Relaxed),
            bytes_served_from_store: self.bytes_served_from_store.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            bytes_evicted: self.bytes_evicted.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            no_cache_resolutions: self.no_cache_resolutions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let counters = CacheCounters::new();
        counters.record_cache_hit(100);
        counters.record_cache_hit(100);
        counters.record_cache_hit(100);
        counters.record_random_read(50);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.cache_hits, 3);
        assert_eq!(snapshot.cache_misses, 1);
        assert!((snapshot.cache_hit_rate_percent - 75.0).abs() < 0.01);
        assert_eq!(snapshot.bytes_served_from_cache, 300);
        assert_eq!(snapshot.bytes_served_from_store, 50);
    }

    #[test]
    fn test_fallback_splits_bytes() {
        let counters = CacheCounters::new();
        counters.record_fallback(10, 90);
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.fallback_reads, 1);
        assert_eq!(snapshot.bytes_served_from_cache, 10);
        assert_eq!(snapshot.bytes_served_from_store, 90);
    }

    #[test]
    fn test_snapshot_serializes() {
        let counters = CacheCounters::new();
        counters.record_eviction(4096);
        let json = counters.snapshot().to_json();
        assert!(json.contains("\"evictions\": 1"));
        assert!(json.contains("\"bytes_evicted\": 4096"));
    }
}
