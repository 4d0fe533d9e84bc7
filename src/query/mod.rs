// # Query State Machines
//
// Per-key observable machines over the cache: single-flight queries with
// stale-while-revalidate, append-only infinite pagination and mutations
// with lifecycle hooks and offline queueing.

pub mod infinite;
pub mod mutation;
pub mod options;
pub mod query;
pub mod state;

pub use infinite::{
    InfiniteQuery, InfiniteQueryObserver, InfiniteQueryOptions, PageFetchFn, PageParamFn,
};
pub use mutation::{Mutation, MutationFn, MutationObserver};
pub use options::{
    ErrorClassifier, MutationContext, MutationOptions, QueryOptions, RetryPolicy,
};
pub use query::{FetchFn, Query, QueryObserver};
pub use state::{InfiniteQueryState, MutationState, PageState, QueryState};
