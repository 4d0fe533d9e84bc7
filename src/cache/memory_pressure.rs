// # Memory-Pressure Handling
//
// A single process-wide handler debounces OS pressure signals and
// dispatches a trim to every registered cache. Providers that cannot
// distinguish severity levels coarsen to `Critical`.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Weak;
use std::time::{Duration, Instant};
use tracing::debug;

use super::query_cache::CacheShared;

/// Minimum interval between dispatched trims.
pub const PRESSURE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Memory-pressure severity reported by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    Low,
    Critical,
}

impl MemoryPressure {
    pub fn is_critical(&self) -> bool {
        matches!(self, MemoryPressure::Critical)
    }
}

static GLOBAL_HANDLER: Lazy<MemoryPressureHandler> = Lazy::new(MemoryPressureHandler::new);

struct HandlerState {
    caches: Vec<Weak<CacheShared>>,
    last_dispatch: Option<Instant>,
}

/// Process-wide pressure handler.
pub struct MemoryPressureHandler {
    state: Mutex<HandlerState>,
}

impl MemoryPressureHandler {
    fn new() -> Self {
        MemoryPressureHandler {
            state: Mutex::new(HandlerState {
                caches: Vec::new(),
                last_dispatch: None,
            }),
        }
    }

    /// The process-wide handler instance.
    pub fn global() -> &'static MemoryPressureHandler {
        &GLOBAL_HANDLER
    }

    pub(crate) fn register(&self, cache: Weak<CacheShared>) {
        let mut state = self.state.lock();
        state.caches.retain(|c| c.upgrade().is_some());
        state.caches.push(cache);
    }

    /// Number of live registered caches.
    pub fn registered_count(&self) -> usize {
        self.state
            .lock()
            .caches
            .iter()
            .filter(|c| c.upgrade().is_some())
            .count()
    }

    /// Report a pressure signal. Signals arriving within the debounce
    /// interval of the previous dispatch are dropped.
    ///
    /// Returns true when a trim was dispatched.
    pub fn signal(&self, pressure: MemoryPressure) -> bool {
        let caches: Vec<Weak<CacheShared>> = {
            let mut state = self.state.lock();
            let now = Instant::now();
            if let Some(last) = state.last_dispatch {
                if now.duration_since(last) < PRESSURE_DEBOUNCE {
                    debug!(?pressure, "memory-pressure signal debounced");
                    return false;
                }
            }
            state.last_dispatch = Some(now);
            state.caches.retain(|c| c.upgrade().is_some());
            state.caches.clone()
        };

        debug!(?pressure, caches = caches.len(), "dispatching memory-pressure trim");
        for cache in caches {
            if let Some(shared) = cache.upgrade() {
                shared.trim(pressure.is_critical());
            }
        }
        true
    }

    /// Testing hook: clear registrations and the debounce clock.
    pub fn reset_for_testing(&self) {
        let mut state = self.state.lock();
        state.caches.clear();
        state.last_dispatch = None;
    }
}
