// # Cache Statistics and Monitoring
//
// Counters, latency histograms and per-key throughput windows for cache
// performance analysis.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Bound on retained latency samples.
const MAX_LATENCY_SAMPLES: usize = 10_000;

/// Default rolling throughput window.
pub const DEFAULT_THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

/// Reason for cache entry eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionReason {
    /// Inactive past its cache time (GC sweep)
    Expired,

    /// Removed to restore the entry or memory budget
    Capacity,

    /// Removed by a memory-pressure trim
    MemoryPressure,

    /// Explicit removal
    Manual,

    /// Cache cleared
    CacheCleared,
}

/// Cache performance counters
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheMetrics {
    /// Total number of cache hits
    pub hits: u64,

    /// Total number of cache misses
    pub misses: u64,

    /// Total number of cache puts
    pub puts: u64,

    /// Total number of evictions
    pub evictions: u64,

    /// Evictions by reason
    pub evictions_by_reason: HashMap<String, u64>,

    /// Total number of invalidations
    pub total_invalidations: u64,

    /// Current memory usage in bytes
    pub current_memory_bytes: usize,

    /// Peak memory usage in bytes
    pub peak_memory_bytes: usize,
}

impl CacheMetrics {
    /// Calculate hit rate as percentage (0.0 - 100.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Calculate miss rate as percentage (0.0 - 100.0)
    pub fn miss_rate(&self) -> f64 {
        100.0 - self.hit_rate()
    }

    /// Get total number of requests
    pub fn total_requests(&self) -> u64 {
        self.hits + self.misses
    }

    /// Get eviction count for a specific reason
    pub fn evictions_for_reason(&self, reason: EvictionReason) -> u64 {
        let key = format!("{:?}", reason);
        *self.evictions_by_reason.get(&key).unwrap_or(&0)
    }
}

/// Latency percentile summary (microseconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LatencySummary {
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub samples: usize,
}

/// Cache statistics with latency and throughput tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatistics {
    /// Current counters
    pub metrics: CacheMetrics,

    /// When statistics tracking started
    #[serde(skip)]
    start_time: Option<Instant>,

    /// Lookup latency samples (microseconds)
    lookup_latencies_us: Vec<u64>,

    /// Fetch latency samples (microseconds)
    fetch_latencies_us: Vec<u64>,

    /// Per-key request timestamps within the throughput window
    #[serde(skip)]
    key_requests: HashMap<String, Vec<Instant>>,

    /// Rolling throughput window
    #[serde(skip, default = "default_window")]
    throughput_window: Duration,

    /// Whether histogram and throughput detail is recorded
    detailed: bool,
}

fn default_window() -> Duration {
    DEFAULT_THROUGHPUT_WINDOW
}

impl CacheStatistics {
    /// Create statistics; `detailed` enables histogram and throughput
    /// sampling on top of the always-on counters.
    pub fn new(detailed: bool) -> Self {
        CacheStatistics {
            metrics: CacheMetrics::default(),
            start_time: Some(Instant::now()),
            lookup_latencies_us: Vec::new(),
            fetch_latencies_us: Vec::new(),
            key_requests: HashMap::new(),
            throughput_window: DEFAULT_THROUGHPUT_WINDOW,
            detailed,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.throughput_window = window;
        self
    }

    /// Record a cache hit
    pub fn record_hit(&mut self, key: &str) {
        self.metrics.hits += 1;
        self.record_key_request(key);
    }

    /// Record a cache miss
    pub fn record_miss(&mut self, key: &str) {
        self.metrics.misses += 1;
        self.record_key_request(key);
    }

    /// Record a cache put operation
    pub fn record_put(&mut self) {
        self.metrics.puts += 1;
    }

    /// Record a cache eviction
    pub fn record_eviction(&mut self, reason: EvictionReason) {
        self.metrics.evictions += 1;
        let key = format!("{:?}", reason);
        *self.metrics.evictions_by_reason.entry(key).or_insert(0) += 1;
    }

    /// Record cache invalidations
    pub fn record_invalidation(&mut self, count: u64) {
        self.metrics.total_invalidations += count;
    }

    /// Record a map lookup latency
    pub fn record_lookup_latency(&mut self, latency: Duration) {
        if !self.detailed {
            return;
        }
        push_bounded(&mut self.lookup_latencies_us, latency.as_micros() as u64);
    }

    /// Record an end-to-end fetch latency
    pub fn record_fetch_latency(&mut self, latency: Duration) {
        if !self.detailed {
            return;
        }
        push_bounded(&mut self.fetch_latencies_us, latency.as_micros() as u64);
    }

    /// Update current memory usage and the peak gauge
    pub fn update_memory_usage(&mut self, current_bytes: usize) {
        self.metrics.current_memory_bytes = current_bytes;
        if current_bytes > self.metrics.peak_memory_bytes {
            self.metrics.peak_memory_bytes = current_bytes;
        }
    }

    /// Lookup latency percentiles
    pub fn lookup_latency(&self) -> LatencySummary {
        summarize(&self.lookup_latencies_us)
    }

    /// Fetch latency percentiles
    pub fn fetch_latency(&self) -> LatencySummary {
        summarize(&self.fetch_latencies_us)
    }

    /// Requests per second for a key over the rolling window
    pub fn key_throughput(&self, key: &str) -> f64 {
        let Some(timestamps) = self.key_requests.get(key) else {
            return 0.0;
        };
        let now = Instant::now();
        let count = timestamps
            .iter()
            .filter(|&&ts| now.duration_since(ts) <= self.throughput_window)
            .count();
        count as f64 / self.throughput_window.as_secs_f64()
    }

    /// Get uptime duration
    pub fn uptime(&self) -> Duration {
        self.start_time.map(|s| s.elapsed()).unwrap_or_default()
    }

    /// Reset all statistics
    pub fn reset(&mut self) {
        self.metrics = CacheMetrics::default();
        self.start_time = Some(Instant::now());
        self.lookup_latencies_us.clear();
        self.fetch_latencies_us.clear();
        self.key_requests.clear();
    }

    /// Get a summary report as a formatted string
    pub fn summary(&self) -> String {
        let lookup = self.lookup_latency();
        let fetch = self.fetch_latency();
        format!(
            "Cache Statistics:\n\
             - Uptime: {:?}\n\
             - Hit Rate: {:.2}%\n\
             - Total Requests: {}\n\
             - Hits: {}, Misses: {}\n\
             - Puts: {}, Evictions: {}\n\
             - Invalidations: {}\n\
             - Current Memory: {} bytes\n\
             - Peak Memory: {} bytes\n\
             - Lookup P50/P95/P99: {}/{}/{} μs\n\
             - Fetch P50/P95/P99: {}/{}/{} μs",
            self.uptime(),
            self.metrics.hit_rate(),
            self.metrics.total_requests(),
            self.metrics.hits,
            self.metrics.misses,
            self.metrics.puts,
            self.metrics.evictions,
            self.metrics.total_invalidations,
            self.metrics.current_memory_bytes,
            self.metrics.peak_memory_bytes,
            lookup.p50_us,
            lookup.p95_us,
            lookup.p99_us,
            fetch.p50_us,
            fetch.p95_us,
            fetch.p99_us,
        )
    }

    /// Record a per-key request timestamp, pruning samples outside the
    /// window on each write.
    fn record_key_request(&mut self, key: &str) {
        if !self.detailed {
            return;
        }
        let now = Instant::now();
        let window = self.throughput_window;
        let timestamps = self.key_requests.entry(key.to_string()).or_default();
        timestamps.push(now);
        timestamps.retain(|&ts| now.duration_since(ts) <= window);
    }
}

impl Default for CacheStatistics {
    fn default() -> Self {
        Self::new(false)
    }
}

fn push_bounded(samples: &mut Vec<u64>, value: u64) {
    samples.push(value);
    if samples.len() > MAX_LATENCY_SAMPLES {
        samples.drain(0..MAX_LATENCY_SAMPLES / 10);
    }
}

fn summarize(samples: &[u64]) -> LatencySummary {
    if samples.is_empty() {
        return LatencySummary::default();
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    LatencySummary {
        p50_us: percentile(&sorted, 0.50),
        p95_us: percentile(&sorted, 0.95),
        p99_us: percentile(&sorted, 0.99),
        samples: sorted.len(),
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    let index = (sorted.len() as f64 * p) as usize;
    sorted[index.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_metrics_default() {
        let metrics = CacheMetrics::default();
        assert_eq!(metrics.hits, 0);
        assert_eq!(metrics.misses, 0);
        assert_eq!(metrics.hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_calculation() {
        let mut metrics = CacheMetrics::default();
        metrics.hits = 75;
        metrics.misses = 25;

        assert_eq!(metrics.hit_rate(), 75.0);
        assert_eq!(metrics.miss_rate(), 25.0);
        assert_eq!(metrics.total_requests(), 100);
    }

    #[test]
    fn test_eviction_tracking() {
        let mut stats = CacheStatistics::new(true);

        stats.record_eviction(EvictionReason::Expired);
        stats.record_eviction(EvictionReason::Expired);
        stats.record_eviction(EvictionReason::Capacity);

        assert_eq!(stats.metrics.evictions, 3);
        assert_eq!(stats.metrics.evictions_for_reason(EvictionReason::Expired), 2);
        assert_eq!(stats.metrics.evictions_for_reason(EvictionReason::Capacity), 1);
    }

    #[test]
    fn test_memory_tracking() {
        let mut stats = CacheStatistics::new(true);

        stats.update_memory_usage(1000);
        assert_eq!(stats.metrics.current_memory_bytes, 1000);
        assert_eq!(stats.metrics.peak_memory_bytes, 1000);

        stats.update_memory_usage(2000);
        stats.update_memory_usage(1500);
        assert_eq!(stats.metrics.current_memory_bytes, 1500);
        assert_eq!(stats.metrics.peak_memory_bytes, 2000);
    }

    #[test]
    fn test_latency_percentiles() {
        let mut stats = CacheStatistics::new(true);
        for i in 1..=100 {
            stats.record_lookup_latency(Duration::from_micros(i * 10));
        }

        let summary = stats.lookup_latency();
        assert_eq!(summary.samples, 100);
        assert!(summary.p50_us >= 500);
        assert!(summary.p95_us > summary.p50_us);
        assert!(summary.p99_us >= summary.p95_us);
        assert!(summary.p99_us <= 1000);
    }

    #[test]
    fn test_detail_disabled_skips_histograms() {
        let mut stats = CacheStatistics::new(false);
        stats.record_lookup_latency(Duration::from_micros(100));
        stats.record_hit("k");
        assert_eq!(stats.lookup_latency().samples, 0);
        assert_eq!(stats.key_throughput("k"), 0.0);
        // Counters stay on regardless.
        assert_eq!(stats.metrics.hits, 1);
    }

    #[test]
    fn test_key_throughput_window() {
        let mut stats = CacheStatistics::new(true).with_window(Duration::from_secs(60));
        for _ in 0..30 {
            stats.record_hit("users:1");
        }
        assert!((stats.key_throughput("users:1") - 0.5).abs() < 0.01);
        assert_eq!(stats.key_throughput("users:2"), 0.0);
    }

    #[test]
    fn test_reset_statistics() {
        let mut stats = CacheStatistics::new(true);
        stats.record_hit("k");
        stats.record_miss("k");
        stats.record_lookup_latency(Duration::from_micros(100));

        stats.reset();

        assert_eq!(stats.metrics.hits, 0);
        assert_eq!(stats.metrics.misses, 0);
        assert_eq!(stats.lookup_latency().samples, 0);
    }

    #[test]
    fn test_summary_report() {
        let mut stats = CacheStatistics::new(true);
        stats.record_hit("k");
        stats.record_miss("k");

        let summary = stats.summary();
        assert!(summary.contains("Hit Rate"));
        assert!(summary.contains("Total Requests"));
    }
}
