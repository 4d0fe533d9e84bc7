// # Caching Layer
//
// The in-memory store backing the query engine: bounded key→entry map
// with reference counting, staleness, pluggable eviction, periodic GC,
// per-key change events and memory-pressure trimming.
//
// - **Query Cache**: the map itself, with budget-triggered eviction
// - **Eviction**: LRU / LFU / FIFO / adaptive victim selection
// - **Statistics**: hit/miss counters, latency histograms, throughput
// - **Memory pressure**: process-wide debounced trim dispatch

pub mod cache_statistics;
pub mod entry;
pub mod eviction;
pub mod memory_pressure;
pub mod query_cache;

pub use cache_statistics::{CacheMetrics, CacheStatistics, EvictionReason, LatencySummary};
pub use entry::CacheEntry;
pub use eviction::{EvictionCandidate, EvictionStrategy};
pub use memory_pressure::{MemoryPressure, MemoryPressureHandler, PRESSURE_DEBOUNCE};
pub use query_cache::{
    CacheConfig, CacheEvent, CacheGuard, CacheHit, EntryInfo, QueryCache,
};
