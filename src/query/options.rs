// # Query and Mutation Options
//
// Per-query behavior switches, the retry policy with exponential backoff
// and jitter, and the transient/permanent error classifier hook.

use crate::error::{FasqError, FetchErrorKind, Result};
use futures::future::BoxFuture;
use rand::Rng;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Application hook deciding whether an error is worth retrying.
pub type ErrorClassifier = Arc<dyn Fn(&FasqError) -> FetchErrorKind + Send + Sync>;

/// Exponential backoff retry policy for transient fetch errors.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: f64,
    /// Relative jitter applied to each delay (0.1 = ±10%)
    pub jitter: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.1,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("factor", &self.factor)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

impl RetryPolicy {
    pub fn retries(max_retries: u32) -> Self {
        RetryPolicy {
            max_retries,
            ..RetryPolicy::default()
        }
    }

    /// Backoff delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            capped + rand::rng().random_range(-spread..=spread)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Classify an error through the configured hook, falling back to the
/// conservative default.
pub(crate) fn classify(classifier: Option<&ErrorClassifier>, error: &FasqError) -> FetchErrorKind {
    match classifier {
        Some(classifier) => classifier(error),
        None => error.default_classification(),
    }
}

/// Drive a fetch to completion under a retry policy and optional
/// per-attempt timeout. Timeouts surface as transient errors.
pub(crate) async fn run_with_retry<T, F>(
    make_attempt: F,
    retry: &RetryPolicy,
    classifier: Option<&ErrorClassifier>,
    timeout: Option<Duration>,
) -> Result<T>
where
    F: Fn() -> BoxFuture<'static, Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        let fut = make_attempt();
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(FasqError::Timeout(format!("fetch exceeded {:?}", limit))),
            },
            None => fut.await,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(error) => {
                let kind = classify(classifier, &error);
                if kind == FetchErrorKind::Transient && attempt < retry.max_retries {
                    let delay = retry.delay_for(attempt);
                    attempt += 1;
                    debug!(attempt, ?delay, error = %error, "retrying transient fetch error");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(error);
            }
        }
    }
}

/// Per-query options.
pub struct QueryOptions<T> {
    /// Disabled queries stay idle and never call their fetch function
    pub enabled: bool,

    /// Freshness window; falls back to the cache default
    pub stale_time: Option<Duration>,

    /// Inactivity window; falls back to the cache default
    pub cache_time: Option<Duration>,

    /// Refresh in the background whenever an observer attaches, even if
    /// the cached value is still fresh
    pub refetch_on_mount: bool,

    pub retry: RetryPolicy,

    pub classifier: Option<ErrorClassifier>,

    /// Per-attempt fetch timeout
    pub timeout: Option<Duration>,

    pub on_success: Option<Arc<dyn Fn(&Arc<T>) + Send + Sync>>,

    pub on_error: Option<Arc<dyn Fn(&FasqError) + Send + Sync>>,
}

impl<T> Default for QueryOptions<T> {
    fn default() -> Self {
        QueryOptions {
            enabled: true,
            stale_time: None,
            cache_time: None,
            refetch_on_mount: false,
            retry: RetryPolicy::default(),
            classifier: None,
            timeout: None,
            on_success: None,
            on_error: None,
        }
    }
}

impl<T> Clone for QueryOptions<T> {
    fn clone(&self) -> Self {
        QueryOptions {
            enabled: self.enabled,
            stale_time: self.stale_time,
            cache_time: self.cache_time,
            refetch_on_mount: self.refetch_on_mount,
            retry: self.retry.clone(),
            classifier: self.classifier.clone(),
            timeout: self.timeout,
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<T> std::fmt::Debug for QueryOptions<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("enabled", &self.enabled)
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .field("refetch_on_mount", &self.refetch_on_mount)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Rollback context returned by `on_mutate` and threaded through the
/// remaining mutation hooks.
pub type MutationContext = Option<Arc<dyn Any + Send + Sync>>;

/// Per-mutation options and lifecycle hooks.
pub struct MutationOptions<TData, TVars> {
    pub max_retries: u32,

    /// Fixed delay between mutation retries
    pub retry_delay: Duration,

    /// Queue the mutation while offline instead of failing
    pub queue_when_offline: bool,

    /// Runs before the mutation; may perform optimistic updates and
    /// return a rollback context
    pub on_mutate: Option<Arc<dyn Fn(&TVars) -> MutationContext + Send + Sync>>,

    pub on_success: Option<Arc<dyn Fn(&Arc<TData>, &MutationContext) + Send + Sync>>,

    pub on_error: Option<Arc<dyn Fn(&FasqError, &MutationContext) + Send + Sync>>,

    /// Runs after success or error
    pub on_settled: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl<TData, TVars> Default for MutationOptions<TData, TVars> {
    fn default() -> Self {
        MutationOptions {
            max_retries: 0,
            retry_delay: Duration::from_secs(1),
            queue_when_offline: false,
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

impl<TData, TVars> Clone for MutationOptions<TData, TVars> {
    fn clone(&self) -> Self {
        MutationOptions {
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            queue_when_offline: self.queue_when_offline,
            on_mutate: self.on_mutate.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

impl<TData, TVars> std::fmt::Debug for MutationOptions<TData, TVars> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationOptions")
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("queue_when_offline", &self.queue_when_offline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.0,
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(10), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy {
            jitter: 0.1,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let delay = policy.delay_for(0).as_secs_f64();
            assert!((0.09..=0.11).contains(&delay));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<u32> = run_with_retry(
            move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(FasqError::transient("flaky"))
                    } else {
                        Ok(7)
                    }
                }
                .boxed()
            },
            &RetryPolicy::retries(3),
            None,
            None,
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<u32> = run_with_retry(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(FasqError::permanent("bad request"))
                }
                .boxed()
            },
            &RetryPolicy::retries(5),
            None,
            None,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<u32> = run_with_retry(
            move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    Ok(1)
                }
                .boxed()
            },
            &RetryPolicy::retries(1),
            None,
            Some(Duration::from_millis(50)),
        )
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_custom_classifier_overrides_default() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        // Treat everything as permanent, even marked-transient errors.
        let classifier: ErrorClassifier = Arc::new(|_| FetchErrorKind::Permanent);

        let result: Result<u32> = run_with_retry(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(FasqError::transient("flaky"))
                }
                .boxed()
            },
            &RetryPolicy::retries(5),
            Some(&classifier),
            None,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
