// # Worker Offload
//
// CPU-heavy work (encryption of large payloads) runs on a blocking worker
// so the cooperative client layer never stalls. The `'static` bound on
// the closure is the capture rule: work shipped to a worker cannot borrow
// from the caller's stack.

use crate::error::{FasqError, Result};

/// Run a pure function on a blocking worker thread and await its result.
pub async fn run_on_worker<F, R>(f: F) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FasqError::Worker(format!("worker task failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runs_and_returns() {
        let out = run_on_worker(|| 21 * 2).await.unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn test_panic_surfaces_as_worker_error() {
        let result: Result<()> = run_on_worker(|| panic!("boom")).await;
        assert!(matches!(result, Err(FasqError::Worker(_))));
    }
}
