// # Cache Entries
//
// Value object wrapping a cached payload with the timestamps, TTL
// parameters and reference count that drive staleness, GC and eviction.

use crate::common::CachedValue;
use std::time::{Duration, Instant};

/// A single cached value with its lifecycle metadata.
///
/// Invariants: `access_count` is monotonically non-decreasing,
/// `last_accessed_at >= created_at`, and an entry is evictable iff
/// `reference_count == 0`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    value: CachedValue,

    /// When this entry was created
    created_at: Instant,

    /// Last read access (for LRU ordering and GC inactivity)
    last_accessed_at: Instant,

    /// Read access count (for LFU ordering)
    access_count: u64,

    /// Data is fresh while `age < stale_time`
    stale_time: Duration,

    /// Unreferenced entries become GC-eligible after this much inactivity
    cache_time: Duration,

    /// Number of live subscribers
    reference_count: u32,
}

impl CacheEntry {
    /// Create a new entry.
    pub fn create(value: CachedValue, stale_time: Duration, cache_time: Duration) -> Self {
        let now = Instant::now();
        CacheEntry {
            value,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            stale_time,
            cache_time,
            reference_count: 0,
        }
    }

    pub fn value(&self) -> &CachedValue {
        &self.value
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_accessed_at(&self) -> Instant {
        self.last_accessed_at
    }

    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    pub fn stale_time(&self) -> Duration {
        self.stale_time
    }

    pub fn cache_time(&self) -> Duration {
        self.cache_time
    }

    pub fn reference_count(&self) -> u32 {
        self.reference_count
    }

    /// Update access time and increment the access counter.
    pub fn mark_accessed(&mut self) {
        self.last_accessed_at = Instant::now();
        self.access_count += 1;
    }

    /// Fresh while the entry's age is below its stale time.
    pub fn is_fresh(&self) -> bool {
        self.created_at.elapsed() < self.stale_time
    }

    /// Mark stale without discarding data, so active queries keep serving
    /// the old value while a refresh runs.
    pub fn invalidate(&mut self) {
        self.stale_time = Duration::ZERO;
    }

    /// Only unreferenced entries may be evicted.
    pub fn is_evictable(&self) -> bool {
        self.reference_count == 0
    }

    /// How long since the last access.
    pub fn inactive_for(&self) -> Duration {
        self.last_accessed_at.elapsed()
    }

    /// Unreferenced and inactive beyond `cache_time`.
    pub fn is_gc_eligible(&self) -> bool {
        self.reference_count == 0 && self.inactive_for() > self.cache_time
    }

    pub fn add_reference(&mut self) {
        self.reference_count += 1;
    }

    pub fn add_references(&mut self, count: u32) {
        self.reference_count += count;
    }

    pub fn remove_reference(&mut self) {
        self.reference_count = self.reference_count.saturating_sub(1);
    }

    /// Approximate memory footprint for budget accounting.
    pub fn estimated_size(&self) -> usize {
        self.value.estimated_size()
    }
}
