// # Mutation State Machine
//
// Runs a side-effecting operation with lifecycle hooks in a fixed order:
// on_mutate → mutation_fn → on_success | on_error → on_settled. While
// offline, mutations may defer into the FIFO offline queue and emit
// `Queued`; the queue replays them in enqueue order on reconnect.

use crate::error::{FasqError, Result};
use crate::offline::{NetworkStatus, OfflineQueueManager};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::options::{MutationContext, MutationOptions};
use super::state::MutationState;

const STATE_CHANNEL_CAPACITY: usize = 64;

/// The mutation operation itself.
pub type MutationFn<TData, TVars> =
    Arc<dyn Fn(TVars) -> BoxFuture<'static, Result<TData>> + Send + Sync>;

/// Handle to a mutation. Cheap to clone; clones share state.
pub struct Mutation<TData, TVars>
where
    TData: Send + Sync + 'static,
    TVars: Clone + Send + Sync + 'static,
{
    shared: Arc<MutationShared<TData, TVars>>,
}

impl<TData, TVars> Clone for Mutation<TData, TVars>
where
    TData: Send + Sync + 'static,
    TVars: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Mutation {
            shared: self.shared.clone(),
        }
    }
}

struct MutationShared<TData, TVars>
where
    TData: Send + Sync + 'static,
    TVars: Clone + Send + Sync + 'static,
{
    mutation_fn: MutationFn<TData, TVars>,
    options: MutationOptions<TData, TVars>,
    state: RwLock<MutationState<TData>>,
    state_tx: broadcast::Sender<MutationState<TData>>,
    network: Arc<NetworkStatus>,
    queue: Option<Arc<OfflineQueueManager>>,
}

impl<TData, TVars> Mutation<TData, TVars>
where
    TData: Send + Sync + 'static,
    TVars: Clone + Send + Sync + 'static,
{
    pub fn new(
        mutation_fn: MutationFn<TData, TVars>,
        options: MutationOptions<TData, TVars>,
        network: Arc<NetworkStatus>,
        queue: Option<Arc<OfflineQueueManager>>,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Mutation {
            shared: Arc::new(MutationShared {
                mutation_fn,
                options,
                state: RwLock::new(MutationState::Idle),
                state_tx,
                network,
                queue,
            }),
        }
    }

    pub fn state(&self) -> MutationState<TData> {
        self.shared.state.read().clone()
    }

    /// Subscribe to the mutation's state stream.
    pub fn subscribe(&self) -> MutationObserver<TData, TVars> {
        MutationObserver {
            mutation: self.clone(),
            rx: self.shared.state_tx.subscribe(),
        }
    }

    /// Raw state stream.
    pub fn stream(&self) -> tokio_stream::wrappers::BroadcastStream<MutationState<TData>> {
        tokio_stream::wrappers::BroadcastStream::new(self.shared.state_tx.subscribe())
    }

    /// Run the mutation, or queue it when offline and queueing is
    /// enabled. The returned state is the settled outcome, or `Queued`
    /// when the mutation was deferred.
    pub async fn mutate(&self, vars: TVars) -> MutationState<TData> {
        let offline = !self.shared.network.is_online();
        if offline && self.shared.options.queue_when_offline {
            if let Some(queue) = &self.shared.queue {
                debug!("network offline, queueing mutation");
                self.shared.set_state(MutationState::Queued);

                let shared = self.shared.clone();
                queue.enqueue(Box::new(move || {
                    async move {
                        match shared.execute(vars).await {
                            MutationState::Error { error } => Err(FasqError::Persistence(
                                format!("queued mutation failed: {}", error),
                            )),
                            _ => Ok(()),
                        }
                    }
                    .boxed()
                }));
                return MutationState::Queued;
            }
        }
        self.shared.execute(vars).await
    }

    /// Return to `Idle`, discarding the last outcome.
    pub fn reset(&self) {
        self.shared.set_state(MutationState::Idle);
    }
}

impl<TData, TVars> MutationShared<TData, TVars>
where
    TData: Send + Sync + 'static,
    TVars: Clone + Send + Sync + 'static,
{
    fn set_state(&self, state: MutationState<TData>) {
        *self.state.write() = state.clone();
        let _ = self.state_tx.send(state);
    }

    async fn execute(&self, vars: TVars) -> MutationState<TData> {
        // Hook order: on_mutate runs first and may perform optimistic
        // updates, returning a rollback context for the later hooks.
        let context: MutationContext = match &self.options.on_mutate {
            Some(on_mutate) => on_mutate(&vars),
            None => None,
        };

        self.set_state(MutationState::Loading);

        let mut attempt: u32 = 0;
        let outcome = loop {
            match (self.mutation_fn)(vars.clone()).await {
                Ok(data) => break Ok(data),
                Err(error) => {
                    if attempt < self.options.max_retries {
                        attempt += 1;
                        debug!(attempt, error = %error, "retrying mutation");
                        tokio::time::sleep(self.options.retry_delay).await;
                        continue;
                    }
                    break Err(error);
                }
            }
        };

        let state = match outcome {
            Ok(data) => {
                let data = Arc::new(data);
                let state = MutationState::Success { data: data.clone() };
                self.set_state(state.clone());
                if let Some(on_success) = &self.options.on_success {
                    on_success(&data, &context);
                }
                state
            }
            Err(error) => {
                let error = Arc::new(error);
                let state = MutationState::Error {
                    error: error.clone(),
                };
                self.set_state(state.clone());
                if let Some(on_error) = &self.options.on_error {
                    on_error(&error, &context);
                }
                state
            }
        };

        if let Some(on_settled) = &self.options.on_settled {
            on_settled();
        }
        state
    }
}

/// Observer over a mutation's state stream.
pub struct MutationObserver<TData, TVars>
where
    TData: Send + Sync + 'static,
    TVars: Clone + Send + Sync + 'static,
{
    mutation: Mutation<TData, TVars>,
    rx: broadcast::Receiver<MutationState<TData>>,
}

impl<TData, TVars> MutationObserver<TData, TVars>
where
    TData: Send + Sync + 'static,
    TVars: Clone + Send + Sync + 'static,
{
    pub fn current(&self) -> MutationState<TData> {
        self.mutation.state()
    }

    pub async fn next(&mut self) -> Option<MutationState<TData>> {
        loop {
            match self.rx.recv().await {
                Ok(state) => return Some(state),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
