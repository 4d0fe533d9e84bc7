// # Performance Monitoring
//
// Snapshot aggregation over the cache statistics and a periodic
// broadcast stream that only does work while someone is listening.

pub mod performance;

pub use performance::{
    MetricsStream, PerformanceMonitor, PerformanceSnapshot, DEFAULT_SNAPSHOT_INTERVAL,
};
