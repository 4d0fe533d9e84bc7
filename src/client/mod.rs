// # Query Client
//
// Process-wide registry keying query machines by cache key. Owns the
// cache, the codec registry, the network status, the offline queue and
// the optional persistence pipeline; components borrow the cache
// through the client rather than reaching for ambient state.

use crate::cache::memory_pressure::MemoryPressureHandler;
use crate::cache::query_cache::{CacheConfig, QueryCache};
use crate::cache::CacheStatistics;
use crate::codec::CodecRegistry;
use crate::common::key::{key_matches_prefix, validate_key};
use crate::common::QueryKey;
use crate::error::{FasqError, Result};
use crate::offline::{NetworkStatus, OfflineQueueManager};
use crate::persist::{PersistenceConfig, PersistenceManager, RotationProgress, KEY_SIZE};
use crate::query::infinite::{InfiniteQuery, InfiniteQueryOptions};
use crate::query::mutation::Mutation;
use crate::query::options::{MutationOptions, QueryOptions};
use crate::query::query::Query;
use dashmap::DashMap;
use futures::FutureExt;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Client configuration.
#[derive(Debug, Clone, Default)]
pub struct QueryClientConfig {
    pub cache: CacheConfig,

    /// Encrypted persistence providers; None disables persistence
    pub persistence: Option<PersistenceConfig>,

    /// Stop draining the offline queue on the first failed mutation
    pub offline_stop_on_error: bool,

    /// Pre-populated codec registry. Required when eager restore must
    /// decode rows before the application gets a chance to call
    /// `register_codec`.
    pub codecs: Option<Arc<CodecRegistry>>,
}

/// A registered query machine, type-erased for the registry.
struct RegisteredQuery {
    type_name: &'static str,
    handle: Box<dyn Any + Send + Sync>,
    refetch: Arc<dyn Fn() + Send + Sync>,
    dispose: Arc<dyn Fn() + Send + Sync>,
}

static GLOBAL_CLIENT: Lazy<RwLock<Option<QueryClient>>> = Lazy::new(|| RwLock::new(None));

/// The client registry. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct QueryClient {
    shared: Arc<ClientShared>,
}

struct ClientShared {
    cache: QueryCache,
    codecs: Arc<CodecRegistry>,
    queries: DashMap<String, RegisteredQuery>,
    network: Arc<NetworkStatus>,
    offline_queue: Arc<OfflineQueueManager>,
    persistence: Option<Arc<PersistenceManager>>,
}

impl QueryClient {
    /// Build a client. Persistence (when configured) requires a running
    /// tokio runtime for its write-behind worker.
    pub fn new(config: QueryClientConfig) -> Result<Self> {
        let codecs = config
            .codecs
            .unwrap_or_else(|| Arc::new(CodecRegistry::new()));
        let persistence = match config.persistence {
            Some(persistence_config) => {
                Some(PersistenceManager::new(persistence_config, codecs.clone())?)
            }
            None => None,
        };
        let cache = QueryCache::with_parts(config.cache, codecs.clone(), persistence.clone())?;
        MemoryPressureHandler::global().register(Arc::downgrade(&cache.shared));

        let network = NetworkStatus::new(true);
        let offline_queue =
            OfflineQueueManager::new(network.clone(), config.offline_stop_on_error);

        Ok(QueryClient {
            shared: Arc::new(ClientShared {
                cache,
                codecs,
                queries: DashMap::new(),
                network,
                offline_queue,
                persistence,
            }),
        })
    }

    /// Build a client and run the eager startup restore when configured.
    pub async fn initialize(config: QueryClientConfig) -> Result<Self> {
        let client = Self::new(config)?;
        if let Some(persistence) = &client.shared.persistence {
            if persistence.eager_restore() {
                let restored = persistence.restore_all(&client.shared.cache).await;
                debug!(restored, "eager restore complete");
            }
        }
        Ok(client)
    }

    /// Install a process-wide client.
    pub async fn initialize_global(config: QueryClientConfig) -> Result<Self> {
        let client = Self::initialize(config).await?;
        *GLOBAL_CLIENT.write() = Some(client.clone());
        Ok(client)
    }

    /// The process-wide client, if one was installed.
    pub fn global() -> Option<QueryClient> {
        GLOBAL_CLIENT.read().clone()
    }

    /// Tear down the process-wide client and all its state.
    pub fn reset_for_testing() {
        if let Some(client) = GLOBAL_CLIENT.write().take() {
            client.clear();
        }
        MemoryPressureHandler::global().reset_for_testing();
    }

    /// Register a serde codec so values of `T` persist across restarts.
    pub fn register_codec<T>(&self, tag: &str) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.shared.codecs.register::<T>(tag)
    }

    /// Return the query for `key`, creating it on first use. The
    /// first-registered fetch function wins for the life of the query;
    /// reusing a key with a different value type is a validation error.
    pub fn get_query<T, F, Fut>(
        &self,
        key: &str,
        fetch_fn: F,
        options: QueryOptions<T>,
    ) -> Result<Query<T>>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        validate_key(key)?;
        match self.shared.queries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                let registered = entry.get();
                match registered.handle.downcast_ref::<Query<T>>() {
                    Some(query) => Ok(query.clone()),
                    None => Err(FasqError::Validation(format!(
                        "query {:?} already registered with type {}",
                        key, registered.type_name
                    ))),
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let query = Query::new(
                    QueryKey::new(key)?,
                    self.shared.cache.clone(),
                    Arc::new(move || fetch_fn().boxed()),
                    options,
                );
                let refetch = {
                    let query = query.clone();
                    Arc::new(move || query.refetch_if_observed()) as Arc<dyn Fn() + Send + Sync>
                };
                let dispose = {
                    let query = query.clone();
                    Arc::new(move || query.dispose()) as Arc<dyn Fn() + Send + Sync>
                };
                entry.insert(RegisteredQuery {
                    type_name: std::any::type_name::<Query<T>>(),
                    handle: Box::new(query.clone()),
                    refetch,
                    dispose,
                });
                Ok(query)
            }
        }
    }

    /// Return the infinite query for `key`, creating it on first use.
    pub fn get_infinite_query<TData, TParam, F, Fut>(
        &self,
        key: &str,
        fetch_page: F,
        options: InfiniteQueryOptions<TData, TParam>,
    ) -> Result<InfiniteQuery<TData, TParam>>
    where
        TData: Send + Sync + 'static,
        TParam: Clone + Send + Sync + 'static,
        F: Fn(Option<TParam>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TData>> + Send + 'static,
    {
        validate_key(key)?;
        match self.shared.queries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                let registered = entry.get();
                match registered.handle.downcast_ref::<InfiniteQuery<TData, TParam>>() {
                    Some(query) => Ok(query.clone()),
                    None => Err(FasqError::Validation(format!(
                        "query {:?} already registered with type {}",
                        key, registered.type_name
                    ))),
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let query = InfiniteQuery::new(
                    QueryKey::new(key)?,
                    self.shared.cache.clone(),
                    Arc::new(move |param| fetch_page(param).boxed()),
                    options,
                );
                let refetch = {
                    let query = query.clone();
                    Arc::new(move || query.refetch_if_observed()) as Arc<dyn Fn() + Send + Sync>
                };
                let dispose = {
                    let query = query.clone();
                    Arc::new(move || query.dispose()) as Arc<dyn Fn() + Send + Sync>
                };
                entry.insert(RegisteredQuery {
                    type_name: std::any::type_name::<InfiniteQuery<TData, TParam>>(),
                    handle: Box::new(query.clone()),
                    refetch,
                    dispose,
                });
                Ok(query)
            }
        }
    }

    /// Build a mutation wired to this client's network status and
    /// offline queue.
    pub fn mutation<TData, TVars, F, Fut>(
        &self,
        mutation_fn: F,
        options: MutationOptions<TData, TVars>,
    ) -> Mutation<TData, TVars>
    where
        TData: Send + Sync + 'static,
        TVars: Clone + Send + Sync + 'static,
        F: Fn(TVars) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TData>> + Send + 'static,
    {
        Mutation::new(
            Arc::new(move |vars| mutation_fn(vars).boxed()),
            options,
            self.shared.network.clone(),
            Some(self.shared.offline_queue.clone()),
        )
    }

    /// Direct cache write; the staple of optimistic updates and
    /// post-mutation fan-out.
    pub fn set_query_data<T: Send + Sync + 'static>(
        &self,
        key: &str,
        value: T,
        stale_time: Option<Duration>,
    ) -> Result<()> {
        self.shared.cache.set(key, value, stale_time, None)
    }

    /// Direct cache read.
    pub fn get_query_data<T: Send + Sync + 'static>(&self, key: &str) -> Result<Option<Arc<T>>> {
        Ok(self.shared.cache.get::<T>(key)?.map(|hit| hit.data))
    }

    /// Mark one entry stale; an observed query for the key refreshes in
    /// the background.
    pub fn invalidate_query(&self, key: &str) -> bool {
        let existed = self.shared.cache.invalidate(key);
        if let Some(registered) = self.shared.queries.get(key) {
            (registered.refetch)();
        }
        existed
    }

    /// Mark all entries sharing a `:`-segment prefix stale and refresh
    /// every observed matching query. Returns the affected cache keys.
    pub fn invalidate_queries_with_prefix(&self, prefix: &str) -> Vec<String> {
        let affected = self.shared.cache.invalidate_with_prefix(prefix);
        for registered in self.shared.queries.iter() {
            if key_matches_prefix(registered.key(), prefix) {
                (registered.refetch)();
            }
        }
        affected
    }

    /// Run a fetch off the critical path and seed the cache. Fresh
    /// cached data short-circuits; fetch failures are logged rather than
    /// returned, since prefetching is advisory.
    pub async fn prefetch_query<T, F, Fut>(
        &self,
        key: &str,
        fetch_fn: F,
        options: QueryOptions<T>,
    ) -> Result<()>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if let Ok(Some(hit)) = self.shared.cache.get::<T>(key) {
            if hit.is_fresh {
                return Ok(());
            }
        }
        let query = self.get_query(key, fetch_fn, options)?;
        let state = query.fetch().await;
        if let Some(error) = state.error() {
            warn!(key, error = %error, "prefetch failed");
        }
        Ok(())
    }

    /// Prefetch a batch concurrently; individual failures are logged and
    /// do not abort the batch.
    pub async fn prefetch_queries<T, F, Fut>(
        &self,
        entries: Vec<(String, F)>,
        options: QueryOptions<T>,
    ) where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let prefetches = entries.into_iter().map(|(key, fetch_fn)| {
            let options = options.clone();
            async move {
                if let Err(error) = self.prefetch_query(&key, fetch_fn, options).await {
                    warn!(key = %key, error = %error, "prefetch rejected");
                }
            }
        });
        futures::future::join_all(prefetches).await;
    }

    /// Dispose and deregister the query and drop its cache entry.
    pub fn remove_query(&self, key: &str) -> bool {
        let removed = self.shared.queries.remove(key);
        if let Some((_, registered)) = &removed {
            (registered.dispose)();
        }
        let had_entry = self.shared.cache.remove(key);
        removed.is_some() || had_entry
    }

    /// Dispose every query and clear the cache.
    pub fn clear(&self) {
        for registered in self.shared.queries.iter() {
            (registered.dispose)();
        }
        self.shared.queries.clear();
        self.shared.cache.clear();
    }

    pub fn query_count(&self) -> usize {
        self.shared.queries.len()
    }

    pub fn cache(&self) -> &QueryCache {
        &self.shared.cache
    }

    pub fn metrics(&self) -> CacheStatistics {
        self.shared.cache.metrics()
    }

    pub fn network(&self) -> Arc<NetworkStatus> {
        self.shared.network.clone()
    }

    pub fn offline_queue(&self) -> Arc<OfflineQueueManager> {
        self.shared.offline_queue.clone()
    }

    /// Restore all persisted rows into the cache now. Returns how many
    /// entries were seeded.
    pub async fn restore_persisted(&self) -> usize {
        match &self.shared.persistence {
            Some(persistence) => persistence.restore_all(&self.shared.cache).await,
            None => 0,
        }
    }

    /// Re-encrypt all persisted rows under a new key.
    pub async fn rotate_encryption_key(
        &self,
        new_key: [u8; KEY_SIZE],
        progress: Option<&RotationProgress>,
    ) -> Result<usize> {
        match &self.shared.persistence {
            Some(persistence) => persistence.rotate_encryption_key(new_key, progress).await,
            None => Err(FasqError::Persistence(
                "persistence is not configured".to_string(),
            )),
        }
    }

    /// Await durability of scheduled persistence writes (shutdown path).
    pub async fn flush(&self) {
        self.shared.cache.flush().await;
    }
}
