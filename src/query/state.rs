// # Observable States
//
// Tagged states emitted by the query, infinite-query and mutation state
// machines. Data is shared behind `Arc` so states clone cheaply into
// every subscriber, and the error variants keep last-known-good data so
// consumers can render stale data alongside an error.

use crate::error::FasqError;
use std::sync::Arc;

/// State of a `Query`.
#[derive(Debug)]
pub enum QueryState<T> {
    /// No fetch has run (or the query is disabled)
    Idle,

    /// A fetch is in flight; `data` carries the previous value during a
    /// background refresh
    Loading { data: Option<Arc<T>> },

    /// Last fetch succeeded
    Success { data: Arc<T> },

    /// Last fetch failed after retries; `data` is the last-known-good
    /// value, if any
    Error {
        error: Arc<FasqError>,
        data: Option<Arc<T>>,
    },
}

impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        match self {
            QueryState::Idle => QueryState::Idle,
            QueryState::Loading { data } => QueryState::Loading { data: data.clone() },
            QueryState::Success { data } => QueryState::Success { data: data.clone() },
            QueryState::Error { error, data } => QueryState::Error {
                error: error.clone(),
                data: data.clone(),
            },
        }
    }
}

impl<T> QueryState<T> {
    /// A fetch is in flight, regardless of whether data is present.
    pub fn is_fetching(&self) -> bool {
        matches!(self, QueryState::Loading { .. })
    }

    pub fn has_data(&self) -> bool {
        self.data().is_some()
    }

    pub fn has_error(&self) -> bool {
        matches!(self, QueryState::Error { .. })
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, QueryState::Idle)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, QueryState::Success { .. })
    }

    /// Current data, including stale data held through a refresh or an
    /// error.
    pub fn data(&self) -> Option<Arc<T>> {
        match self {
            QueryState::Idle => None,
            QueryState::Loading { data } => data.clone(),
            QueryState::Success { data } => Some(data.clone()),
            QueryState::Error { data, .. } => data.clone(),
        }
    }

    pub fn error(&self) -> Option<Arc<FasqError>> {
        match self {
            QueryState::Error { error, .. } => Some(error.clone()),
            _ => None,
        }
    }
}

/// State of one page of an `InfiniteQuery`.
#[derive(Debug)]
pub struct PageState<T> {
    pub data: Option<Arc<T>>,
    pub error: Option<Arc<FasqError>>,
    pub is_fetching: bool,
}

impl<T> Clone for PageState<T> {
    fn clone(&self) -> Self {
        PageState {
            data: self.data.clone(),
            error: self.error.clone(),
            is_fetching: self.is_fetching,
        }
    }
}

impl<T> PageState<T> {
    pub fn settled(data: Arc<T>) -> Self {
        PageState {
            data: Some(data),
            error: None,
            is_fetching: false,
        }
    }
}

/// State of an `InfiniteQuery`: an ordered page sequence plus pagination
/// flags. Pages are appended in fetch order; partial page arrays are
/// never emitted.
#[derive(Debug)]
pub struct InfiniteQueryState<T> {
    pub pages: Vec<PageState<T>>,
    pub is_fetching_next: bool,
    pub is_fetching_previous: bool,
    pub error: Option<Arc<FasqError>>,
}

impl<T> Clone for InfiniteQueryState<T> {
    fn clone(&self) -> Self {
        InfiniteQueryState {
            pages: self.pages.clone(),
            is_fetching_next: self.is_fetching_next,
            is_fetching_previous: self.is_fetching_previous,
            error: self.error.clone(),
        }
    }
}

impl<T> Default for InfiniteQueryState<T> {
    fn default() -> Self {
        InfiniteQueryState {
            pages: Vec::new(),
            is_fetching_next: false,
            is_fetching_previous: false,
            error: None,
        }
    }
}

impl<T> InfiniteQueryState<T> {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn first_page(&self) -> Option<&PageState<T>> {
        self.pages.first()
    }

    pub fn last_page(&self) -> Option<&PageState<T>> {
        self.pages.last()
    }

    pub fn is_fetching(&self) -> bool {
        self.is_fetching_next
            || self.is_fetching_previous
            || self.pages.iter().any(|p| p.is_fetching)
    }

    pub fn has_data(&self) -> bool {
        self.pages.iter().any(|p| p.data.is_some())
    }
}

/// State of a `Mutation`.
#[derive(Debug)]
pub enum MutationState<T> {
    Idle,

    Loading,

    /// Deferred into the offline queue; runs when the network returns
    Queued,

    Success { data: Arc<T> },

    Error { error: Arc<FasqError> },
}

impl<T> Clone for MutationState<T> {
    fn clone(&self) -> Self {
        match self {
            MutationState::Idle => MutationState::Idle,
            MutationState::Loading => MutationState::Loading,
            MutationState::Queued => MutationState::Queued,
            MutationState::Success { data } => MutationState::Success { data: data.clone() },
            MutationState::Error { error } => MutationState::Error {
                error: error.clone(),
            },
        }
    }
}

impl<T> MutationState<T> {
    pub fn is_loading(&self) -> bool {
        matches!(self, MutationState::Loading)
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, MutationState::Queued)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, MutationState::Success { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, MutationState::Error { .. })
    }

    pub fn data(&self) -> Option<Arc<T>> {
        match self {
            MutationState::Success { data } => Some(data.clone()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<Arc<FasqError>> {
        match self {
            MutationState::Error { error } => Some(error.clone()),
            _ => None,
        }
    }
}
