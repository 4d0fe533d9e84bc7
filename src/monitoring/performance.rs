// # Performance Snapshots
//
// `PerformanceMonitor` aggregates a point-in-time view of the client;
// `MetricsStream` broadcasts snapshots on an interval, skipping the work
// entirely while no subscriber is attached.

use crate::cache::cache_statistics::LatencySummary;
use crate::client::QueryClient;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Default interval between emitted snapshots.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);

const SNAPSHOT_CHANNEL_CAPACITY: usize = 16;

/// Point-in-time aggregate of cache and query-engine health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    /// Epoch milliseconds at capture
    pub timestamp_ms: i64,

    pub entry_count: usize,
    pub registered_queries: usize,

    pub memory_bytes: usize,
    pub peak_memory_bytes: usize,

    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub invalidations: u64,

    pub lookup_latency: LatencySummary,
    pub fetch_latency: LatencySummary,
}

/// Aggregates snapshots from a client.
#[derive(Clone)]
pub struct PerformanceMonitor {
    client: QueryClient,
}

impl PerformanceMonitor {
    pub fn new(client: &QueryClient) -> Self {
        PerformanceMonitor {
            client: client.clone(),
        }
    }

    /// Capture a snapshot now.
    pub fn snapshot(&self) -> PerformanceSnapshot {
        let stats = self.client.metrics();
        PerformanceSnapshot {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            entry_count: self.client.cache().entry_count(),
            registered_queries: self.client.query_count(),
            memory_bytes: stats.metrics.current_memory_bytes,
            peak_memory_bytes: stats.metrics.peak_memory_bytes,
            hits: stats.metrics.hits,
            misses: stats.metrics.misses,
            hit_rate: stats.metrics.hit_rate(),
            evictions: stats.metrics.evictions,
            invalidations: stats.metrics.total_invalidations,
            lookup_latency: stats.lookup_latency(),
            fetch_latency: stats.fetch_latency(),
        }
    }
}

/// Periodic snapshot broadcast. Snapshots are captured and sent only
/// while at least one subscriber is attached.
pub struct MetricsStream {
    tx: broadcast::Sender<PerformanceSnapshot>,
    task: JoinHandle<()>,
}

impl MetricsStream {
    pub fn new(monitor: PerformanceMonitor, interval: Duration) -> Self {
        let (tx, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let sender = tx.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if sender.receiver_count() == 0 {
                    continue;
                }
                let _ = sender.send(monitor.snapshot());
            }
        });
        MetricsStream { tx, task }
    }

    pub fn with_default_interval(monitor: PerformanceMonitor) -> Self {
        Self::new(monitor, DEFAULT_SNAPSHOT_INTERVAL)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PerformanceSnapshot> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Drop for MetricsStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::QueryClientConfig;

    #[tokio::test]
    async fn test_snapshot_reflects_cache_state() {
        let client = QueryClient::new(QueryClientConfig::default()).unwrap();
        client.set_query_data("a", 1u64, None).unwrap();
        client.get_query_data::<u64>("a").unwrap();
        client.get_query_data::<u64>("missing").unwrap();

        let snapshot = PerformanceMonitor::new(&client).snapshot();
        assert_eq!(snapshot.entry_count, 1);
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 1);
        assert!((snapshot.hit_rate - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_emits_only_with_subscribers() {
        let client = QueryClient::new(QueryClientConfig::default()).unwrap();
        let stream = MetricsStream::new(
            PerformanceMonitor::new(&client),
            Duration::from_secs(5),
        );

        // Nothing listening: ticks pass without snapshots being sent.
        tokio::time::sleep(Duration::from_secs(11)).await;

        let mut rx = stream.subscribe();
        tokio::time::sleep(Duration::from_secs(6)).await;

        let snapshot = rx.try_recv().unwrap();
        assert_eq!(snapshot.entry_count, 0);
        // Only post-subscription ticks produced snapshots.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_snapshot_serializes() {
        let client = QueryClient::new(QueryClientConfig::default()).unwrap();
        let snapshot = PerformanceMonitor::new(&client).snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("hit_rate"));
    }
}
