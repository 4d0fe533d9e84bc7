// # Query State Machine
//
// A per-key machine driven by a fetch function. Observers subscribe to
// an ordered state stream; concurrent fetches for the key coalesce into
// a single flight, and stale cached data keeps serving while a refresh
// runs in the background.

use crate::cache::query_cache::QueryCache;
use crate::common::{CachedValue, QueryKey};
use crate::error::Result;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use super::options::{run_with_retry, QueryOptions};
use super::state::QueryState;

/// Capacity of the per-query state channel.
const STATE_CHANNEL_CAPACITY: usize = 64;

/// Fetch function: produces a fresh value for the query's key.
pub type FetchFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Handle to a per-key query. Cheap to clone; clones share the machine.
pub struct Query<T: Send + Sync + 'static> {
    shared: Arc<QueryShared<T>>,
}

impl<T: Send + Sync + 'static> Clone for Query<T> {
    fn clone(&self) -> Self {
        Query {
            shared: self.shared.clone(),
        }
    }
}

struct QueryShared<T: Send + Sync + 'static> {
    key: QueryKey,
    cache: QueryCache,
    fetch_fn: FetchFn<T>,
    options: RwLock<QueryOptions<T>>,
    state: RwLock<QueryState<T>>,
    state_tx: broadcast::Sender<QueryState<T>>,

    /// Single-flight slot: present while a fetch task runs. The slot is
    /// cleared before the final state is emitted so a cascaded refetch
    /// from an `on_success` hook can start a new flight.
    in_flight: Mutex<Option<watch::Receiver<bool>>>,

    observer_count: AtomicU32,
    disposed: AtomicBool,
}

impl<T: Send + Sync + 'static> QueryShared<T> {
    fn set_state(&self, state: QueryState<T>) {
        *self.state.write() = state.clone();
        let _ = self.state_tx.send(state);
    }

    fn clear_flight(&self) {
        *self.in_flight.lock() = None;
    }
}

impl<T: Send + Sync + 'static> Query<T> {
    pub fn new(
        key: QueryKey,
        cache: QueryCache,
        fetch_fn: FetchFn<T>,
        options: QueryOptions<T>,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Query {
            shared: Arc::new(QueryShared {
                key,
                cache,
                fetch_fn,
                options: RwLock::new(options),
                state: RwLock::new(QueryState::Idle),
                state_tx,
                in_flight: Mutex::new(None),
                observer_count: AtomicU32::new(0),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.shared.key
    }

    /// Current state snapshot.
    pub fn state(&self) -> QueryState<T> {
        self.shared.state.read().clone()
    }

    pub fn is_fetching(&self) -> bool {
        self.shared.in_flight.lock().is_some()
    }

    pub fn observer_count(&self) -> u32 {
        self.shared.observer_count.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Attach an observer. The entry's reference count is held for the
    /// observer's lifetime; cached data is served immediately and a
    /// background refresh starts when the entry is stale or
    /// `refetch_on_mount` is set.
    pub fn subscribe(&self) -> QueryObserver<T> {
        let rx = self.shared.state_tx.subscribe();
        let guard = self.shared.cache.acquire(self.shared.key.as_str());
        self.shared.observer_count.fetch_add(1, Ordering::AcqRel);

        self.on_observer_attached();

        QueryObserver {
            query: self.clone(),
            rx,
            _guard: guard,
        }
    }

    /// Raw state stream. Unlike `subscribe`, no cache reference count is
    /// held, so a stream alone does not keep the entry alive.
    pub fn stream(&self) -> tokio_stream::wrappers::BroadcastStream<QueryState<T>> {
        tokio_stream::wrappers::BroadcastStream::new(self.shared.state_tx.subscribe())
    }

    /// Fetch (or join the in-flight fetch) and await its completion.
    pub async fn fetch(&self) -> QueryState<T> {
        if self.is_disposed() || !self.shared.options.read().enabled {
            return self.state();
        }
        let mut rx = self.ensure_flight();
        let _ = rx.wait_for(|done| *done).await;
        self.state()
    }

    /// Mark the cached entry stale; observed queries refresh in the
    /// background while continuing to serve the stale value.
    pub fn invalidate(&self) {
        self.shared.cache.invalidate(self.shared.key.as_str());
        self.refetch_if_observed();
    }

    /// Start a background refresh if anyone is watching.
    pub(crate) fn refetch_if_observed(&self) {
        if self.is_disposed() || !self.shared.options.read().enabled {
            return;
        }
        if self.observer_count() > 0 {
            let _ = self.ensure_flight();
        }
    }

    /// Toggle `enabled`. Enabling an observed query with no usable data
    /// starts a fetch.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.options.write().enabled = enabled;
        if enabled && !self.is_disposed() {
            self.on_observer_attached();
        }
    }

    /// Terminal: the query stops starting new fetches. An in-flight
    /// fetch still completes and writes into the cache.
    pub fn dispose(&self) {
        self.shared.disposed.store(true, Ordering::Release);
    }

    /// Attach-time behavior: serve cached data and decide whether a
    /// refresh is due.
    fn on_observer_attached(&self) {
        if self.is_disposed() {
            return;
        }
        let options = self.shared.options.read().clone();
        if !options.enabled || self.observer_count() == 0 {
            return;
        }

        match self.shared.cache.get::<T>(self.shared.key.as_str()) {
            Ok(Some(hit)) => {
                // Stale data is served through the refresh itself:
                // Idle goes straight to Loading carrying the previous
                // value. Only a fresh hit with no refresh due settles
                // to Success directly.
                if !hit.is_fresh || options.refetch_on_mount {
                    self.ensure_flight();
                } else if self.shared.state.read().is_idle() {
                    self.shared.set_state(QueryState::Success { data: hit.data });
                }
            }
            Ok(None) => {
                // Try a lazy restore from persistence before fetching;
                // restored entries seed stale, so the refresh that
                // follows serves them as Loading data.
                if let Some(persistence) = self.shared.cache.persistence() {
                    let query = self.clone();
                    tokio::spawn(async move {
                        persistence
                            .restore_into(query.shared.key.as_str(), &query.shared.cache)
                            .await;
                        query.ensure_flight();
                    });
                } else {
                    self.ensure_flight();
                }
            }
            Err(e) => {
                warn!(key = %self.shared.key, error = %e, "cached value unusable for this query");
                self.shared.set_state(QueryState::Error {
                    error: Arc::new(e),
                    data: None,
                });
            }
        }
    }

    /// Start a fetch task unless one is already in flight; returns a
    /// completion signal either way.
    fn ensure_flight(&self) -> watch::Receiver<bool> {
        let mut slot = self.shared.in_flight.lock();
        if let Some(rx) = slot.as_ref() {
            return rx.clone();
        }

        let (tx, rx) = watch::channel(false);
        *slot = Some(rx.clone());
        drop(slot);

        let query = self.clone();
        tokio::spawn(async move {
            query.run_fetch().await;
            let _ = tx.send(true);
        });
        rx
    }

    async fn run_fetch(&self) {
        let shared = &self.shared;
        let options = shared.options.read().clone();
        // Previous data for stale-while-revalidate: whatever the state
        // machine holds, falling back to the cache when the first
        // observer lands on an Idle query over an existing entry.
        let previous = shared.state.read().data().or_else(|| {
            shared
                .cache
                .get::<T>(shared.key.as_str())
                .ok()
                .flatten()
                .map(|hit| hit.data)
        });

        shared.set_state(QueryState::Loading {
            data: previous.clone(),
        });

        let started = Instant::now();
        let fetch_fn = shared.fetch_fn.clone();
        let outcome = run_with_retry(
            move || fetch_fn(),
            &options.retry,
            options.classifier.as_ref(),
            options.timeout,
        )
        .await;
        shared.cache.record_fetch_latency(started.elapsed());

        match outcome {
            Ok(value) => {
                let data = Arc::new(value);
                let cached =
                    CachedValue::from_arc(data.clone(), shared.cache.codecs().tag_for::<T>());
                if let Err(e) = shared.cache.set_value(
                    shared.key.as_str(),
                    cached,
                    options.stale_time,
                    options.cache_time,
                ) {
                    warn!(key = %shared.key, error = %e, "failed to cache fetched value");
                }

                shared.clear_flight();
                shared.set_state(QueryState::Success { data: data.clone() });
                if let Some(on_success) = &options.on_success {
                    on_success(&data);
                }
            }
            Err(error) => {
                debug!(key = %shared.key, error = %error, "fetch failed");
                let error = Arc::new(error);
                shared.clear_flight();
                shared.set_state(QueryState::Error {
                    error: error.clone(),
                    data: previous,
                });
                if let Some(on_error) = &options.on_error {
                    on_error(&error);
                }
            }
        }
    }
}

/// An attached observer: an ordered stream of states plus a reference
/// count hold on the cache entry. Dropping the observer releases both.
pub struct QueryObserver<T: Send + Sync + 'static> {
    query: Query<T>,
    rx: broadcast::Receiver<QueryState<T>>,
    _guard: crate::cache::query_cache::CacheGuard,
}

impl<T: Send + Sync + 'static> QueryObserver<T> {
    /// Current state snapshot.
    pub fn current(&self) -> QueryState<T> {
        self.query.state()
    }

    pub fn query(&self) -> &Query<T> {
        &self.query
    }

    /// Next state transition, in emit order. Returns None when the query
    /// is gone. A lagged observer skips to the most recent states rather
    /// than erroring.
    pub async fn next(&mut self) -> Option<QueryState<T>> {
        loop {
            match self.rx.recv().await {
                Ok(state) => return Some(state),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(key = %self.query.key(), skipped, "observer lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Await the next settled (success or error) state.
    pub async fn settled(&mut self) -> QueryState<T> {
        let current = self.current();
        if !current.is_fetching() && !current.is_idle() {
            return current;
        }
        loop {
            match self.next().await {
                Some(state) if !state.is_fetching() && !state.is_idle() => return state,
                Some(_) => continue,
                None => return self.current(),
            }
        }
    }
}

impl<T: Send + Sync + 'static> Drop for QueryObserver<T> {
    fn drop(&mut self) {
        self.query
            .shared
            .observer_count
            .fetch_sub(1, Ordering::AcqRel);
    }
}
