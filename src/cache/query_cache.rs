// # Query Cache
//
// Single source of truth for cached values: a bounded key→entry map with
// reference counting, staleness, pluggable eviction, periodic GC and
// per-key change events. Persistence, when configured, is write-behind:
// cache writes return immediately and the durable write happens on a
// background worker.

use crate::codec::CodecRegistry;
use crate::common::key::validate_key;
use crate::common::CachedValue;
use crate::error::{FasqError, Result};
use crate::persist::PersistenceManager;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::cache_statistics::{CacheStatistics, EvictionReason};
use super::entry::CacheEntry;
use super::eviction::{EvictionCandidate, EvictionStrategy};

/// After eviction, usage is brought down to this share of the violated cap.
const EVICTION_TARGET_RATIO: f64 = 0.85;

/// Capacity of each per-key event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries (None = unbounded)
    pub max_entries: Option<usize>,

    /// Maximum total memory in bytes (None = unbounded)
    pub max_memory_bytes: Option<usize>,

    /// Default freshness window for entries
    pub default_stale_time: Duration,

    /// Default inactivity window before unreferenced entries are GC-eligible
    pub default_cache_time: Duration,

    /// Victim selection policy when over budget
    pub eviction: EvictionStrategy,

    /// Interval between GC sweeps
    pub gc_interval: Duration,

    /// Enables latency histograms and per-key throughput sampling
    pub metrics_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_entries: None,
            max_memory_bytes: None,
            default_stale_time: Duration::ZERO,
            default_cache_time: Duration::from_secs(300),
            eviction: EvictionStrategy::Lru,
            gc_interval: Duration::from_secs(30),
            metrics_enabled: false,
        }
    }
}

impl CacheConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == Some(0) {
            return Err(FasqError::Validation(
                "max_entries must be greater than 0".to_string(),
            ));
        }
        if self.max_memory_bytes == Some(0) {
            return Err(FasqError::Validation(
                "max_memory_bytes must be greater than 0".to_string(),
            ));
        }
        if self.gc_interval.is_zero() {
            return Err(FasqError::Validation(
                "gc_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Change event emitted to per-key subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A value was written for a previously absent key
    Set { key: String },

    /// An existing key was overwritten
    Update { key: String },

    /// The entry was removed (explicit, GC, eviction or clear)
    Remove { key: String },

    /// The entry was marked stale in place
    Invalidate { key: String },
}

impl CacheEvent {
    pub fn key(&self) -> &str {
        match self {
            CacheEvent::Set { key }
            | CacheEvent::Update { key }
            | CacheEvent::Remove { key }
            | CacheEvent::Invalidate { key } => key,
        }
    }
}

/// Typed cache read result.
#[derive(Debug, Clone)]
pub struct CacheHit<T> {
    pub data: Arc<T>,
    pub is_fresh: bool,
    pub created_at: Instant,
    pub access_count: u64,
}

/// Entry metadata snapshot for introspection.
#[derive(Debug, Clone, Copy)]
pub struct EntryInfo {
    pub reference_count: u32,
    pub access_count: u64,
    pub is_fresh: bool,
    pub estimated_size: usize,
}

/// RAII subscriber handle; dropping it decrements the entry's reference
/// count.
#[derive(Debug)]
pub struct CacheGuard {
    shared: Weak<CacheShared>,
    key: String,
}

impl CacheGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for CacheGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.release(&self.key);
        }
    }
}

/// The in-memory store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct QueryCache {
    pub(crate) shared: Arc<CacheShared>,
}

pub(crate) struct CacheShared {
    config: CacheConfig,
    entries: RwLock<HashMap<String, CacheEntry>>,

    /// Reference counts acquired before the entry exists; folded into the
    /// entry when it is first written.
    pending_refs: Mutex<HashMap<String, u32>>,

    current_bytes: AtomicUsize,
    stats: Mutex<CacheStatistics>,
    subscribers: RwLock<HashMap<String, broadcast::Sender<CacheEvent>>>,
    codecs: Arc<CodecRegistry>,
    persistence: Option<Arc<PersistenceManager>>,
}

impl QueryCache {
    /// Create a standalone cache with its own codec registry and no
    /// persistence.
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(CodecRegistry::new()), None)
    }

    /// Create a cache wired to a shared codec registry and an optional
    /// persistence pipeline.
    pub fn with_parts(
        config: CacheConfig,
        codecs: Arc<CodecRegistry>,
        persistence: Option<Arc<PersistenceManager>>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics_enabled = config.metrics_enabled;
        let gc_interval = config.gc_interval;
        let shared = Arc::new(CacheShared {
            config,
            entries: RwLock::new(HashMap::new()),
            pending_refs: Mutex::new(HashMap::new()),
            current_bytes: AtomicUsize::new(0),
            stats: Mutex::new(CacheStatistics::new(metrics_enabled)),
            subscribers: RwLock::new(HashMap::new()),
            codecs,
            persistence,
        });

        // GC runs only when a runtime is present; a cache constructed
        // outside tokio still works, it just never sweeps on its own.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&shared);
            handle.spawn(async move {
                let mut ticker = tokio::time::interval(gc_interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(shared) = weak.upgrade() else { break };
                    shared.gc_sweep();
                }
            });
        }

        Ok(QueryCache { shared })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    pub(crate) fn codecs(&self) -> Arc<CodecRegistry> {
        self.shared.codecs.clone()
    }

    pub(crate) fn persistence(&self) -> Option<Arc<PersistenceManager>> {
        self.shared.persistence.clone()
    }

    /// Write a value, wrapping it in a cache entry, accounting its size,
    /// evicting if over budget and notifying subscribers. Returns
    /// immediately; the durable write (when persistence is configured)
    /// happens write-behind.
    pub fn set<T: Send + Sync + 'static>(
        &self,
        key: &str,
        value: T,
        stale_time: Option<Duration>,
        cache_time: Option<Duration>,
    ) -> Result<()> {
        validate_key(key)?;
        let tag = self.shared.codecs.tag_for::<T>();
        let value = CachedValue::new(value, tag);
        self.shared.insert(key, value, stale_time, cache_time, true)
    }

    /// Write an already wrapped value (used by the query machines, which
    /// share their data `Arc` with the state stream).
    pub(crate) fn set_value(
        &self,
        key: &str,
        value: CachedValue,
        stale_time: Option<Duration>,
        cache_time: Option<Duration>,
    ) -> Result<()> {
        validate_key(key)?;
        self.shared.insert(key, value, stale_time, cache_time, true)
    }

    /// Typed read. On hit, bumps access tracking and records a hit metric;
    /// a stored value of a different type is a validation error.
    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Result<Option<CacheHit<T>>> {
        let started = Instant::now();
        let mut entries = self.shared.entries.write();
        match entries.get_mut(key) {
            Some(entry) => {
                let data = entry.value().downcast::<T>()?;
                entry.mark_accessed();
                let hit = CacheHit {
                    data,
                    is_fresh: entry.is_fresh(),
                    created_at: entry.created_at(),
                    access_count: entry.access_count(),
                };
                drop(entries);

                let mut stats = self.shared.stats.lock();
                stats.record_hit(key);
                stats.record_lookup_latency(started.elapsed());
                Ok(Some(hit))
            }
            None => {
                drop(entries);
                let mut stats = self.shared.stats.lock();
                stats.record_miss(key);
                stats.record_lookup_latency(started.elapsed());
                Ok(None)
            }
        }
    }

    /// Increment the key's reference count, returning an RAII guard that
    /// releases it on drop. Acquiring a not-yet-written key is allowed;
    /// the count is folded in when the entry lands.
    pub fn acquire(&self, key: &str) -> CacheGuard {
        let mut entries = self.shared.entries.write();
        if let Some(entry) = entries.get_mut(key) {
            entry.add_reference();
        } else {
            drop(entries);
            *self.shared.pending_refs.lock().entry(key.to_string()).or_insert(0) += 1;
        }
        CacheGuard {
            shared: Arc::downgrade(&self.shared),
            key: key.to_string(),
        }
    }

    /// Mark one entry stale in place. Returns true when the key existed.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut entries = self.shared.entries.write();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        entry.invalidate();
        drop(entries);

        self.shared.stats.lock().record_invalidation(1);
        self.shared.notify(CacheEvent::Invalidate { key: key.to_string() });
        true
    }

    /// Mark all keys sharing a `:`-segment prefix stale. Returns the
    /// affected keys.
    pub fn invalidate_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut entries = self.shared.entries.write();
        let mut affected = Vec::new();
        for (key, entry) in entries.iter_mut() {
            if crate::common::key::key_matches_prefix(key, prefix) {
                entry.invalidate();
                affected.push(key.clone());
            }
        }
        drop(entries);

        if !affected.is_empty() {
            self.shared.stats.lock().record_invalidation(affected.len() as u64);
            for key in &affected {
                self.shared.notify(CacheEvent::Invalidate { key: key.clone() });
            }
        }
        affected
    }

    /// Remove an entry. Returns true when the key existed.
    pub fn remove(&self, key: &str) -> bool {
        let removed = {
            let mut entries = self.shared.entries.write();
            entries.remove(key)
        };
        let Some(entry) = removed else { return false };

        self.shared.account_removed(&entry);
        self.shared.stats.lock().record_eviction(EvictionReason::Manual);
        self.shared.notify(CacheEvent::Remove { key: key.to_string() });
        if let Some(persistence) = &self.shared.persistence {
            persistence.schedule_delete(key);
        }
        true
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let drained: Vec<(String, CacheEntry)> = {
            let mut entries = self.shared.entries.write();
            entries.drain().collect()
        };
        self.shared.current_bytes.store(0, Ordering::Relaxed);

        {
            let mut stats = self.shared.stats.lock();
            for _ in &drained {
                stats.record_eviction(EvictionReason::CacheCleared);
            }
            stats.update_memory_usage(0);
        }
        for (key, _) in &drained {
            self.shared.notify(CacheEvent::Remove { key: key.clone() });
        }
        if let Some(persistence) = &self.shared.persistence {
            persistence.schedule_clear();
        }
    }

    /// Subscribe to change events for one key.
    pub fn subscribe(&self, key: &str) -> broadcast::Receiver<CacheEvent> {
        let mut subscribers = self.shared.subscribers.write();
        subscribers
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Snapshot of the cache statistics.
    pub fn metrics(&self) -> CacheStatistics {
        self.shared.stats.lock().clone()
    }

    pub fn entry_count(&self) -> usize {
        self.shared.entries.read().len()
    }

    pub fn memory_usage(&self) -> usize {
        self.shared.current_bytes.load(Ordering::Relaxed)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.shared.entries.read().contains_key(key)
    }

    /// Metadata snapshot for one entry.
    pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        let entries = self.shared.entries.read();
        entries.get(key).map(|entry| EntryInfo {
            reference_count: entry.reference_count(),
            access_count: entry.access_count(),
            is_fresh: entry.is_fresh(),
            estimated_size: entry.estimated_size(),
        })
    }

    /// Register this cache with the process-wide memory-pressure handler.
    pub fn register_for_pressure(&self) {
        super::memory_pressure::MemoryPressureHandler::global()
            .register(Arc::downgrade(&self.shared));
    }

    /// Run one GC sweep now (normally driven by the interval timer).
    pub fn gc_sweep(&self) {
        self.shared.gc_sweep();
    }

    /// Drop inactive entries in response to memory pressure.
    pub fn trim(&self, critical: bool) {
        self.shared.trim(critical);
    }

    /// Await durability of all scheduled persistence writes.
    pub async fn flush(&self) {
        if let Some(persistence) = &self.shared.persistence {
            persistence.flush().await;
        }
    }

    /// Record an end-to-end fetch duration into the cache histograms.
    pub(crate) fn record_fetch_latency(&self, latency: Duration) {
        self.shared.stats.lock().record_fetch_latency(latency);
    }

    /// Seed a restored entry without going back through persistence.
    /// Restored data is immediately stale so the first observer triggers a
    /// background refresh. No-op when the key is already live in memory.
    pub(crate) fn insert_restored(&self, key: &str, value: CachedValue) -> bool {
        if self.shared.entries.read().contains_key(key) {
            debug!(key, "skipping restore, key already live");
            return false;
        }
        match self
            .shared
            .insert(key, value, Some(Duration::ZERO), None, false)
        {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "failed to seed restored entry");
                false
            }
        }
    }
}

impl CacheShared {
    fn insert(
        &self,
        key: &str,
        value: CachedValue,
        stale_time: Option<Duration>,
        cache_time: Option<Duration>,
        persist: bool,
    ) -> Result<()> {
        let stale_time = stale_time.unwrap_or(self.config.default_stale_time);
        let cache_time = cache_time.unwrap_or(self.config.default_cache_time);

        let mut entry = CacheEntry::create(value.clone(), stale_time, cache_time);
        if let Some(pending) = self.pending_refs.lock().remove(key) {
            entry.add_references(pending);
        }
        let entry_size = entry.estimated_size();

        let replaced = {
            let mut entries = self.entries.write();
            let replaced = entries.insert(key.to_string(), entry);
            if let Some(old) = &replaced {
                // Observers of the old value stay attached to the new one.
                let carried = old.reference_count();
                if carried > 0 {
                    if let Some(current) = entries.get_mut(key) {
                        current.add_references(carried);
                    }
                }
            }
            replaced
        };

        if let Some(old) = &replaced {
            self.current_bytes
                .fetch_sub(old.estimated_size(), Ordering::Relaxed);
        }
        self.current_bytes.fetch_add(entry_size, Ordering::Relaxed);

        {
            let mut stats = self.stats.lock();
            stats.record_put();
            stats.update_memory_usage(self.current_bytes.load(Ordering::Relaxed));
        }

        self.maybe_evict();

        if persist {
            if let Some(persistence) = &self.persistence {
                persistence.schedule_put(key, value, cache_time);
            }
        }

        let key = key.to_string();
        self.notify(if replaced.is_some() {
            CacheEvent::Update { key }
        } else {
            CacheEvent::Set { key }
        });
        Ok(())
    }

    pub(crate) fn release(&self, key: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(key) {
            entry.remove_reference();
            return;
        }
        drop(entries);

        let mut pending = self.pending_refs.lock();
        if let Some(count) = pending.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                pending.remove(key);
            }
        }
    }

    /// Evict unreferenced entries until usage is at or under the target
    /// share of each violated cap. Never fails observably; if too few
    /// entries are evictable the cap stays exceeded.
    fn maybe_evict(&self) {
        let current_bytes = self.current_bytes.load(Ordering::Relaxed);
        let entry_count = self.entries.read().len();

        let over_bytes = self
            .config
            .max_memory_bytes
            .is_some_and(|max| current_bytes > max);
        let over_entries = self.config.max_entries.is_some_and(|max| entry_count > max);
        if !over_bytes && !over_entries {
            return;
        }

        let bytes_to_free = if over_bytes {
            let target =
                (self.config.max_memory_bytes.unwrap_or(0) as f64 * EVICTION_TARGET_RATIO) as usize;
            current_bytes.saturating_sub(target)
        } else {
            0
        };
        let entries_to_free = if over_entries {
            let target =
                (self.config.max_entries.unwrap_or(0) as f64 * EVICTION_TARGET_RATIO) as usize;
            entry_count.saturating_sub(target.max(1))
        } else {
            0
        };

        let candidates: Vec<EvictionCandidate> = {
            let entries = self.entries.read();
            entries
                .iter()
                .filter(|(_, entry)| entry.is_evictable())
                .map(|(key, entry)| EvictionCandidate {
                    key: key.clone(),
                    created_at: entry.created_at(),
                    last_accessed_at: entry.last_accessed_at(),
                    access_count: entry.access_count(),
                    estimated_size: entry.estimated_size(),
                    is_fresh: entry.is_fresh(),
                })
                .collect()
        };
        if candidates.is_empty() {
            debug!("cache over budget but no evictable entries");
            return;
        }

        let victims =
            self.config
                .eviction
                .select_victims(candidates, bytes_to_free, entries_to_free, None);
        self.remove_batch(&victims, EvictionReason::Capacity);
    }

    /// Periodic sweep: unreferenced entries inactive past their cache time
    /// are removed.
    fn gc_sweep(&self) {
        let eligible: Vec<String> = {
            let entries = self.entries.read();
            entries
                .iter()
                .filter(|(_, entry)| entry.is_gc_eligible())
                .map(|(key, _)| key.clone())
                .collect()
        };
        if !eligible.is_empty() {
            debug!(count = eligible.len(), "gc sweep removing inactive entries");
            self.remove_batch(&eligible, EvictionReason::Expired);
        }
    }

    /// Memory-pressure trim: drop all inactive entries when critical,
    /// stale inactive entries otherwise.
    pub(crate) fn trim(&self, critical: bool) {
        let victims: Vec<String> = {
            let entries = self.entries.read();
            entries
                .iter()
                .filter(|(_, entry)| entry.is_evictable() && (critical || !entry.is_fresh()))
                .map(|(key, _)| key.clone())
                .collect()
        };
        if !victims.is_empty() {
            debug!(count = victims.len(), critical, "memory-pressure trim");
            self.remove_batch(&victims, EvictionReason::MemoryPressure);
        }
    }

    fn remove_batch(&self, keys: &[String], reason: EvictionReason) {
        let mut removed = Vec::new();
        {
            let mut entries = self.entries.write();
            for key in keys {
                // Re-check at removal time; a reference may have arrived
                // since the candidate snapshot.
                if entries.get(key).is_some_and(|e| e.is_evictable()) {
                    if let Some(entry) = entries.remove(key) {
                        removed.push((key.clone(), entry));
                    }
                }
            }
        }
        if removed.is_empty() {
            return;
        }

        for (_, entry) in &removed {
            self.account_removed_bytes(entry);
        }
        {
            let mut stats = self.stats.lock();
            for _ in &removed {
                stats.record_eviction(reason);
            }
            stats.update_memory_usage(self.current_bytes.load(Ordering::Relaxed));
        }
        for (key, _) in &removed {
            self.notify(CacheEvent::Remove { key: key.clone() });
        }
    }

    fn account_removed(&self, entry: &CacheEntry) {
        self.account_removed_bytes(entry);
        let mut stats = self.stats.lock();
        stats.update_memory_usage(self.current_bytes.load(Ordering::Relaxed));
    }

    fn account_removed_bytes(&self, entry: &CacheEntry) {
        let size = entry.estimated_size();
        let mut current = self.current_bytes.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(size);
            match self.current_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    fn notify(&self, event: CacheEvent) {
        let key = event.key().to_string();
        let dead = {
            let subscribers = self.subscribers.read();
            match subscribers.get(&key) {
                Some(sender) => sender.send(event).is_err(),
                None => false,
            }
        };
        // Drop channels nobody listens to anymore.
        if dead {
            let mut subscribers = self.subscribers.write();
            if subscribers
                .get(&key)
                .is_some_and(|s| s.receiver_count() == 0)
            {
                subscribers.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with(max_bytes: Option<usize>, max_entries: Option<usize>) -> QueryCache {
        QueryCache::new(CacheConfig {
            max_memory_bytes: max_bytes,
            max_entries,
            default_stale_time: Duration::from_secs(60),
            ..CacheConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(CacheConfig::default().validate().is_ok());
        let bad = CacheConfig {
            max_entries: Some(0),
            ..CacheConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = CacheConfig {
            gc_interval: Duration::ZERO,
            ..CacheConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_set_get_roundtrip() {
        let cache = cache_with(None, None);
        cache.set("users:1", "alice".to_string(), None, None).unwrap();

        let hit = cache.get::<String>("users:1").unwrap().unwrap();
        assert_eq!(*hit.data, "alice");
        assert!(hit.is_fresh);

        let stats = cache.metrics();
        assert_eq!(stats.metrics.hits, 1);
        assert_eq!(stats.metrics.misses, 0);
    }

    #[test]
    fn test_miss_recorded() {
        let cache = cache_with(None, None);
        assert!(cache.get::<String>("absent").unwrap().is_none());
        assert_eq!(cache.metrics().metrics.misses, 1);
    }

    #[test]
    fn test_type_mismatch_is_validation_error() {
        let cache = cache_with(None, None);
        cache.set("k", 7u64, None, None).unwrap();
        let err = cache.get::<String>("k").unwrap_err();
        assert!(matches!(err, FasqError::Validation(_)));
    }

    #[test]
    fn test_invalid_key_rejected() {
        let cache = cache_with(None, None);
        assert!(cache.set("bad key", 1u8, None, None).is_err());
        assert!(cache.set("", 1u8, None, None).is_err());
    }

    #[test]
    fn test_invalidate_marks_stale_keeps_data() {
        let cache = cache_with(None, None);
        cache.set("k", 1u64, Some(Duration::from_secs(60)), None).unwrap();
        assert!(cache.get::<u64>("k").unwrap().unwrap().is_fresh);

        assert!(cache.invalidate("k"));
        let hit = cache.get::<u64>("k").unwrap().unwrap();
        assert!(!hit.is_fresh);
        assert_eq!(*hit.data, 1);
    }

    #[test]
    fn test_invalidate_with_prefix_segment_boundary() {
        let cache = cache_with(None, None);
        cache.set("a:1", 1u64, Some(Duration::from_secs(60)), None).unwrap();
        cache.set("a:2", 2u64, Some(Duration::from_secs(60)), None).unwrap();
        cache.set("ab:1", 3u64, Some(Duration::from_secs(60)), None).unwrap();
        cache.set("b:1", 4u64, Some(Duration::from_secs(60)), None).unwrap();

        let mut affected = cache.invalidate_with_prefix("a");
        affected.sort();
        assert_eq!(affected, vec!["a:1".to_string(), "a:2".to_string()]);
        assert!(cache.get::<u64>("ab:1").unwrap().unwrap().is_fresh);
        assert!(cache.get::<u64>("b:1").unwrap().unwrap().is_fresh);
    }

    #[test]
    fn test_reference_counting_via_guards() {
        let cache = cache_with(None, None);
        cache.set("k", 1u64, None, None).unwrap();

        let g1 = cache.acquire("k");
        let g2 = cache.acquire("k");
        assert_eq!(cache.entry_info("k").unwrap().reference_count, 2);

        drop(g1);
        assert_eq!(cache.entry_info("k").unwrap().reference_count, 1);
        drop(g2);
        assert_eq!(cache.entry_info("k").unwrap().reference_count, 0);
    }

    #[test]
    fn test_pending_refs_fold_into_new_entry() {
        let cache = cache_with(None, None);
        let guard = cache.acquire("future");
        cache.set("future", 9u64, None, None).unwrap();
        assert_eq!(cache.entry_info("future").unwrap().reference_count, 1);
        drop(guard);
        assert_eq!(cache.entry_info("future").unwrap().reference_count, 0);
    }

    #[test]
    fn test_overwrite_carries_references() {
        let cache = cache_with(None, None);
        cache.set("k", 1u64, None, None).unwrap();
        let _guard = cache.acquire("k");
        cache.set("k", 2u64, None, None).unwrap();
        assert_eq!(cache.entry_info("k").unwrap().reference_count, 1);
        assert_eq!(*cache.get::<u64>("k").unwrap().unwrap().data, 2);
    }

    #[test]
    fn test_lru_eviction_on_memory_budget() {
        let cache = cache_with(Some(1000), None);

        // Ten ~100-byte entries fill the budget exactly.
        for i in 0..10 {
            cache
                .set(&format!("e:{}", i), vec![0u8; 76], None, None)
                .unwrap();
        }
        assert_eq!(cache.entry_count(), 10);
        assert_eq!(cache.memory_usage(), 1000);

        // Touch 0..5 so 6..9 are the least recently used.
        for i in 0..6 {
            cache.get::<Vec<u8>>(&format!("e:{}", i)).unwrap();
        }

        cache.set("e:10", vec![0u8; 76], None, None).unwrap();

        // Victims are drawn in ascending last-access order until usage is
        // at or under 85% of the cap.
        assert!(cache.memory_usage() <= 850);
        assert!(!cache.contains_key("e:6"));
        assert!(!cache.contains_key("e:7"));
        assert!(!cache.contains_key("e:8"));
        for i in 0..6 {
            assert!(cache.contains_key(&format!("e:{}", i)));
        }
        assert!(cache.contains_key("e:10"));
    }

    #[test]
    fn test_referenced_entries_never_evicted() {
        let cache = cache_with(Some(300), None);
        cache.set("live:1", vec![0u8; 76], None, None).unwrap();
        let _guard = cache.acquire("live:1");

        for i in 0..5 {
            cache
                .set(&format!("dead:{}", i), vec![0u8; 76], None, None)
                .unwrap();
        }

        assert!(cache.contains_key("live:1"));
    }

    #[test]
    fn test_entry_count_budget_eviction() {
        let cache = cache_with(None, Some(4));
        for i in 0..6 {
            cache.set(&format!("k:{}", i), i as u64, None, None).unwrap();
        }
        assert!(cache.entry_count() <= 4);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = cache_with(None, None);
        cache.set("a", 1u64, None, None).unwrap();
        cache.set("b", 2u64, None, None).unwrap();

        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        assert_eq!(cache.entry_count(), 1);

        cache.clear();
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.memory_usage(), 0);
    }

    #[test]
    fn test_gc_sweep_removes_inactive() {
        let cache = QueryCache::new(CacheConfig {
            default_cache_time: Duration::ZERO,
            ..CacheConfig::default()
        })
        .unwrap();
        cache.set("old", 1u64, None, None).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        cache.gc_sweep();
        assert!(!cache.contains_key("old"));
        assert_eq!(
            cache.metrics().metrics.evictions_for_reason(EvictionReason::Expired),
            1
        );
    }

    #[test]
    fn test_gc_spares_referenced_entries() {
        let cache = QueryCache::new(CacheConfig {
            default_cache_time: Duration::ZERO,
            ..CacheConfig::default()
        })
        .unwrap();
        cache.set("held", 1u64, None, None).unwrap();
        let _guard = cache.acquire("held");
        std::thread::sleep(Duration::from_millis(5));

        cache.gc_sweep();
        assert!(cache.contains_key("held"));
    }

    #[test]
    fn test_trim_critical_drops_all_inactive() {
        let cache = cache_with(None, None);
        cache.set("fresh", 1u64, Some(Duration::from_secs(60)), None).unwrap();
        cache.set("stale", 2u64, Some(Duration::ZERO), None).unwrap();
        cache.set("held", 3u64, Some(Duration::from_secs(60)), None).unwrap();
        let _guard = cache.acquire("held");

        cache.trim(false);
        assert!(cache.contains_key("fresh"));
        assert!(!cache.contains_key("stale"));

        cache.trim(true);
        assert!(!cache.contains_key("fresh"));
        assert!(cache.contains_key("held"));
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let cache = cache_with(None, None);
        let mut rx = cache.subscribe("k");

        cache.set("k", 1u64, None, None).unwrap();
        cache.set("k", 2u64, None, None).unwrap();
        cache.invalidate("k");
        cache.remove("k");

        assert_eq!(rx.recv().await.unwrap(), CacheEvent::Set { key: "k".to_string() });
        assert_eq!(rx.recv().await.unwrap(), CacheEvent::Update { key: "k".to_string() });
        assert_eq!(rx.recv().await.unwrap(), CacheEvent::Invalidate { key: "k".to_string() });
        assert_eq!(rx.recv().await.unwrap(), CacheEvent::Remove { key: "k".to_string() });
    }
}
