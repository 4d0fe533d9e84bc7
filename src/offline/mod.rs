// # Offline Queue & Network Status
//
// A FIFO queue of deferred mutations that drains sequentially when the
// network comes back. `NetworkStatus` can be driven by an OS probe or
// manually (tests); the queue listens for the offline→online transition.

use crate::error::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Connectivity signal with a change stream.
pub struct NetworkStatus {
    tx: watch::Sender<bool>,
}

impl NetworkStatus {
    pub fn new(initially_online: bool) -> Arc<Self> {
        Arc::new(NetworkStatus {
            tx: watch::channel(initially_online).0,
        })
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Drive the status (from an OS probe, or directly in tests).
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current != online {
                *current = online;
                true
            } else {
                false
            }
        });
    }

    /// Change stream; the receiver sees the current value immediately.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// A deferred mutation job.
pub type QueueJob = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct QueuedMutation {
    created_at: Instant,
    job: QueueJob,
}

struct QueueInner {
    entries: Mutex<VecDeque<QueuedMutation>>,

    /// Serializes drains; enqueue during a drain is fine, a second drain
    /// waits.
    drain_lock: tokio::sync::Mutex<()>,

    len_tx: watch::Sender<usize>,
    network: Arc<NetworkStatus>,
    stop_on_error: bool,
}

/// FIFO pending-mutation queue that drains on reconnect.
#[derive(Clone)]
pub struct OfflineQueueManager {
    inner: Arc<QueueInner>,
}

impl OfflineQueueManager {
    /// Create the queue and start watching for reconnects. The watcher
    /// only runs inside a tokio runtime; `drain` can always be called
    /// directly.
    pub fn new(network: Arc<NetworkStatus>, stop_on_error: bool) -> Arc<Self> {
        let inner = Arc::new(QueueInner {
            entries: Mutex::new(VecDeque::new()),
            drain_lock: tokio::sync::Mutex::new(()),
            len_tx: watch::channel(0).0,
            network: network.clone(),
            stop_on_error,
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&inner);
            let mut rx = network.subscribe();
            handle.spawn(async move {
                while rx.changed().await.is_ok() {
                    let online = *rx.borrow();
                    if !online {
                        continue;
                    }
                    let Some(inner) = weak.upgrade() else { break };
                    QueueInner::drain(&inner).await;
                }
            });
        }

        Arc::new(OfflineQueueManager { inner })
    }

    /// Append a job; jobs run in enqueue order on the next drain.
    pub fn enqueue(&self, job: QueueJob) {
        let len = {
            let mut entries = self.inner.entries.lock();
            entries.push_back(QueuedMutation {
                created_at: Instant::now(),
                job,
            });
            entries.len()
        };
        let _ = self.inner.len_tx.send(len);
        debug!(len, "mutation queued for replay");
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Age of the oldest queued job.
    pub fn oldest_age(&self) -> Option<std::time::Duration> {
        self.inner
            .entries
            .lock()
            .front()
            .map(|entry| entry.created_at.elapsed())
    }

    /// Discard all queued jobs.
    pub fn clear(&self) {
        self.inner.entries.lock().clear();
        let _ = self.inner.len_tx.send(0);
    }

    /// Queue-length change stream.
    pub fn subscribe_len(&self) -> watch::Receiver<usize> {
        self.inner.len_tx.subscribe()
    }

    /// Run queued jobs sequentially in FIFO order. Failures do not stop
    /// the drain unless `stop_on_error` was configured; the drain also
    /// pauses when the network drops again.
    pub async fn drain(&self) {
        QueueInner::drain(&self.inner).await;
    }
}

impl QueueInner {
    async fn drain(inner: &Arc<QueueInner>) {
        let _serialized = inner.drain_lock.lock().await;

        loop {
            if !inner.network.is_online() {
                debug!("network dropped mid-drain, pausing");
                break;
            }
            let entry = inner.entries.lock().pop_front();
            let Some(entry) = entry else { break };

            let result = (entry.job)().await;
            // Length updates only after the job settles, so a drained
            // queue means every replay actually ran.
            let _ = inner.len_tx.send(inner.entries.lock().len());

            if let Err(error) = result {
                warn!(error = %error, "queued mutation failed during drain");
                if inner.stop_on_error {
                    break;
                }
            }
        }
    }
}
