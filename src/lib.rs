// FASQ - Async stale-while-revalidate query engine
// Core library module

pub mod cache;
pub mod client;
pub mod codec;
pub mod common;
pub mod error;
pub mod monitoring;
pub mod offline;
pub mod persist;
pub mod query;

pub use cache::{
    CacheConfig, CacheEvent, CacheGuard, CacheHit, CacheMetrics, CacheStatistics,
    EvictionReason, EvictionStrategy, MemoryPressure, MemoryPressureHandler, QueryCache,
};
pub use client::{QueryClient, QueryClientConfig};
pub use codec::CodecRegistry;
pub use common::{CachedValue, QueryKey};
pub use error::{FasqError, FetchErrorKind, Result};
pub use monitoring::{MetricsStream, PerformanceMonitor, PerformanceSnapshot};
pub use offline::{NetworkStatus, OfflineQueueManager};
pub use persist::{
    AesGcmEncryptor, Encryptor, ExpiresAtPolicy, MemoryPersistentStore, MemorySecureKeyStore,
    PersistedRecord, PersistenceConfig, PersistenceOptions, PersistentStore, SecureKeyStore,
};
pub use query::{
    InfiniteQuery, InfiniteQueryOptions, InfiniteQueryState, Mutation, MutationOptions,
    MutationState, Query, QueryObserver, QueryOptions, QueryState, RetryPolicy,
};
