// # Infinite Query State Machine
//
// Ordered, append-only pagination over a fetch function keyed by a page
// parameter. Forward and backward fetches coalesce per direction, page
// refetches coalesce per index, and page appends are atomic with respect
// to observers.

use crate::cache::query_cache::QueryCache;
use crate::common::{CachedValue, QueryKey};
use crate::error::Result;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use super::options::{run_with_retry, ErrorClassifier, RetryPolicy};
use super::state::{InfiniteQueryState, PageState};

const STATE_CHANNEL_CAPACITY: usize = 64;

/// Fetches one page for the given parameter (None = initial page).
pub type PageFetchFn<TData, TParam> =
    Arc<dyn Fn(Option<TParam>) -> BoxFuture<'static, Result<TData>> + Send + Sync>;

/// Derives the next/previous page parameter from the pages fetched so
/// far; None means there is nothing further to fetch.
pub type PageParamFn<TData, TParam> =
    Arc<dyn Fn(&[PageState<TData>]) -> Option<TParam> + Send + Sync>;

/// Options for an infinite query.
pub struct InfiniteQueryOptions<TData, TParam> {
    pub retry: RetryPolicy,
    pub classifier: Option<ErrorClassifier>,
    pub timeout: Option<std::time::Duration>,
    pub stale_time: Option<std::time::Duration>,
    pub cache_time: Option<std::time::Duration>,
    pub get_next_param: PageParamFn<TData, TParam>,
    pub get_prev_param: Option<PageParamFn<TData, TParam>>,
}

impl<TData, TParam> Clone for InfiniteQueryOptions<TData, TParam> {
    fn clone(&self) -> Self {
        InfiniteQueryOptions {
            retry: self.retry.clone(),
            classifier: self.classifier.clone(),
            timeout: self.timeout,
            stale_time: self.stale_time,
            cache_time: self.cache_time,
            get_next_param: self.get_next_param.clone(),
            get_prev_param: self.get_prev_param.clone(),
        }
    }
}

/// Where a finished page fetch lands in the page vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FlightSlot {
    Next,
    Previous,
    Page(usize),
}

/// Handle to a per-key infinite query. Cheap to clone.
pub struct InfiniteQuery<TData, TParam>
where
    TData: Send + Sync + 'static,
    TParam: Clone + Send + Sync + 'static,
{
    shared: Arc<InfiniteShared<TData, TParam>>,
}

impl<TData, TParam> Clone for InfiniteQuery<TData, TParam>
where
    TData: Send + Sync + 'static,
    TParam: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        InfiniteQuery {
            shared: self.shared.clone(),
        }
    }
}

struct InfiniteShared<TData, TParam>
where
    TData: Send + Sync + 'static,
    TParam: Clone + Send + Sync + 'static,
{
    key: QueryKey,
    cache: QueryCache,
    fetch_page: PageFetchFn<TData, TParam>,
    options: InfiniteQueryOptions<TData, TParam>,
    state: RwLock<InfiniteQueryState<TData>>,

    /// Parameter each page was fetched with, index-aligned with `pages`.
    params: Mutex<Vec<Option<TParam>>>,

    state_tx: broadcast::Sender<InfiniteQueryState<TData>>,
    flights: Mutex<HashMap<FlightSlot, watch::Receiver<bool>>>,

    /// Bumped by `reset`; in-flight results from an older generation are
    /// discarded instead of appended.
    generation: AtomicU64,

    observer_count: AtomicU32,
    disposed: AtomicBool,
}

impl<TData, TParam> InfiniteQuery<TData, TParam>
where
    TData: Send + Sync + 'static,
    TParam: Clone + Send + Sync + 'static,
{
    pub fn new(
        key: QueryKey,
        cache: QueryCache,
        fetch_page: PageFetchFn<TData, TParam>,
        options: InfiniteQueryOptions<TData, TParam>,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        InfiniteQuery {
            shared: Arc::new(InfiniteShared {
                key,
                cache,
                fetch_page,
                options,
                state: RwLock::new(InfiniteQueryState::default()),
                params: Mutex::new(Vec::new()),
                state_tx,
                flights: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                observer_count: AtomicU32::new(0),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.shared.key
    }

    pub fn state(&self) -> InfiniteQueryState<TData> {
        self.shared.state.read().clone()
    }

    pub fn observer_count(&self) -> u32 {
        self.shared.observer_count.load(Ordering::Acquire)
    }

    /// Attach an observer holding a reference count on the cache entry.
    pub fn subscribe(&self) -> InfiniteQueryObserver<TData, TParam> {
        let rx = self.shared.state_tx.subscribe();
        let guard = self.shared.cache.acquire(self.shared.key.as_str());
        self.shared.observer_count.fetch_add(1, Ordering::AcqRel);
        InfiniteQueryObserver {
            query: self.clone(),
            rx,
            _guard: guard,
        }
    }

    /// Fetch the next page. With no explicit parameter the next one is
    /// derived from the pages fetched so far; a derived `None` is a
    /// no-op. Concurrent calls for the same direction coalesce.
    pub async fn fetch_next(&self, param: Option<TParam>) -> InfiniteQueryState<TData> {
        let param = match param {
            Some(param) => Some(param),
            None => {
                let state = self.shared.state.read();
                (self.shared.options.get_next_param)(&state.pages)
            }
        };
        let Some(param) = param else {
            debug!(key = %self.shared.key, "no next page parameter, fetch_next is a no-op");
            return self.state();
        };
        self.run_flight(FlightSlot::Next, Some(param)).await;
        self.state()
    }

    /// Fetch the previous page, deriving its parameter from the hook; a
    /// missing hook or a derived `None` is a no-op.
    pub async fn fetch_previous(&self) -> InfiniteQueryState<TData> {
        let param = {
            let state = self.shared.state.read();
            self.shared
                .options
                .get_prev_param
                .as_ref()
                .and_then(|get| get(&state.pages))
        };
        let Some(param) = param else {
            debug!(key = %self.shared.key, "no previous page parameter, fetch_previous is a no-op");
            return self.state();
        };
        self.run_flight(FlightSlot::Previous, Some(param)).await;
        self.state()
    }

    /// Re-run the fetch for one page and replace it in place on success.
    /// Out-of-range indexes are a no-op.
    pub async fn refetch_page(&self, index: usize) -> InfiniteQueryState<TData> {
        let param = {
            let params = self.shared.params.lock();
            match params.get(index) {
                Some(param) => param.clone(),
                None => {
                    debug!(key = %self.shared.key, index, "refetch_page out of range");
                    return self.state();
                }
            }
        };
        self.run_flight(FlightSlot::Page(index), param).await;
        self.state()
    }

    /// Clear all pages atomically and return to the empty state.
    pub fn reset(&self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        self.shared.flights.lock().clear();
        {
            let mut state = self.shared.state.write();
            *state = InfiniteQueryState::default();
        }
        self.shared.params.lock().clear();
        self.shared.cache.remove(self.shared.key.as_str());
        self.shared.emit();
    }

    pub fn dispose(&self) {
        self.shared.disposed.store(true, Ordering::Release);
    }

    /// Refetch the first page in the background when observed (driven by
    /// invalidation).
    pub(crate) fn refetch_if_observed(&self) {
        if self.shared.disposed.load(Ordering::Acquire) || self.observer_count() == 0 {
            return;
        }
        if self.shared.state.read().pages.is_empty() {
            return;
        }
        let query = self.clone();
        tokio::spawn(async move {
            query.refetch_page(0).await;
        });
    }
}

impl<TData, TParam> InfiniteShared<TData, TParam>
where
    TData: Send + Sync + 'static,
    TParam: Clone + Send + Sync + 'static,
{
    fn emit(&self) {
        let snapshot = self.state.read().clone();
        let _ = self.state_tx.send(snapshot);
    }
}

impl<TData, TParam> InfiniteQuery<TData, TParam>
where
    TData: Send + Sync + 'static,
    TParam: Clone + Send + Sync + 'static,
{
    /// Start (or join) the flight for a slot and await its completion.
    async fn run_flight(&self, slot: FlightSlot, param: Option<TParam>) {
        if self.shared.disposed.load(Ordering::Acquire) {
            return;
        }

        let mut rx = {
            let mut flights = self.shared.flights.lock();
            if let Some(rx) = flights.get(&slot) {
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(false);
                flights.insert(slot, rx.clone());
                drop(flights);

                let query = self.clone();
                tokio::spawn(async move {
                    query.fetch_into_slot(slot, param).await;
                    let _ = tx.send(true);
                });
                rx
            }
        };
        let _ = rx.wait_for(|done| *done).await;
    }

    async fn fetch_into_slot(&self, slot: FlightSlot, param: Option<TParam>) {
        let shared = &self.shared;
        let generation = shared.generation.load(Ordering::Acquire);

        {
            let mut state = shared.state.write();
            match slot {
                FlightSlot::Next => state.is_fetching_next = true,
                FlightSlot::Previous => state.is_fetching_previous = true,
                FlightSlot::Page(index) => {
                    if let Some(page) = state.pages.get_mut(index) {
                        page.is_fetching = true;
                    }
                }
            }
        }
        shared.emit();

        let fetch_page = shared.fetch_page.clone();
        let attempt_param = param.clone();
        let outcome = run_with_retry(
            move || fetch_page(attempt_param.clone()),
            &shared.options.retry,
            shared.options.classifier.as_ref(),
            shared.options.timeout,
        )
        .await;

        // A reset while fetching discards the result.
        let stale_generation = shared.generation.load(Ordering::Acquire) != generation;

        {
            let mut state = shared.state.write();
            match slot {
                FlightSlot::Next => state.is_fetching_next = false,
                FlightSlot::Previous => state.is_fetching_previous = false,
                FlightSlot::Page(index) => {
                    if let Some(page) = state.pages.get_mut(index) {
                        page.is_fetching = false;
                    }
                }
            }

            if !stale_generation {
                match outcome {
                    Ok(data) => {
                        let data = Arc::new(data);
                        state.error = None;
                        let mut params = shared.params.lock();
                        match slot {
                            FlightSlot::Next => {
                                state.pages.push(PageState::settled(data));
                                params.push(param);
                            }
                            FlightSlot::Previous => {
                                state.pages.insert(0, PageState::settled(data));
                                params.insert(0, param);
                            }
                            FlightSlot::Page(index) => {
                                if let Some(page) = state.pages.get_mut(index) {
                                    *page = PageState::settled(data);
                                }
                            }
                        }
                    }
                    Err(error) => {
                        debug!(key = %shared.key, ?slot, error = %error, "page fetch failed");
                        let error = Arc::new(error);
                        if let FlightSlot::Page(index) = slot {
                            if let Some(page) = state.pages.get_mut(index) {
                                page.error = Some(error.clone());
                            }
                        }
                        state.error = Some(error);
                    }
                }
            }
        }

        if !stale_generation {
            self.write_pages_to_cache();
        }

        // Slot cleared before the final emit so a cascaded fetch can
        // start a new flight.
        shared.flights.lock().remove(&slot);
        shared.emit();
    }

    /// Mirror the page data into the cache so invalidation, budgets and
    /// GC see this key like any other.
    fn write_pages_to_cache(&self) {
        let shared = &self.shared;
        let pages: Vec<Arc<TData>> = {
            let state = shared.state.read();
            state.pages.iter().filter_map(|p| p.data.clone()).collect()
        };
        let value = CachedValue::new(pages, None);
        if let Err(e) = shared.cache.set_value(
            shared.key.as_str(),
            value,
            shared.options.stale_time,
            shared.options.cache_time,
        ) {
            warn!(key = %shared.key, error = %e, "failed to cache page data");
        }
    }
}

/// Attached observer over an infinite query's state stream.
pub struct InfiniteQueryObserver<TData, TParam>
where
    TData: Send + Sync + 'static,
    TParam: Clone + Send + Sync + 'static,
{
    query: InfiniteQuery<TData, TParam>,
    rx: broadcast::Receiver<InfiniteQueryState<TData>>,
    _guard: crate::cache::query_cache::CacheGuard,
}

impl<TData, TParam> InfiniteQueryObserver<TData, TParam>
where
    TData: Send + Sync + 'static,
    TParam: Clone + Send + Sync + 'static,
{
    pub fn current(&self) -> InfiniteQueryState<TData> {
        self.query.state()
    }

    pub async fn next(&mut self) -> Option<InfiniteQueryState<TData>> {
        loop {
            match self.rx.recv().await {
                Ok(state) => return Some(state),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl<TData, TParam> Drop for InfiniteQueryObserver<TData, TParam>
where
    TData: Send + Sync + 'static,
    TParam: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.query
            .shared
            .observer_count
            .fetch_sub(1, Ordering::AcqRel);
    }
}
