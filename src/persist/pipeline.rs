// # Persistence Pipeline
//
// Write-behind marshalling of cached entries to durable storage:
// value → codec encode → JSON bytes → encrypt → store.put. Reads reverse
// the chain and degrade to a cache miss on any failure; the in-memory
// read path never sees a persistence error. Failed writes are stashed
// and retried ahead of the next write.

use crate::cache::query_cache::QueryCache;
use crate::codec::CodecRegistry;
use crate::common::CachedValue;
use crate::error::{FasqError, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::encryption::{Encryptor, KEY_SIZE, WORKER_THRESHOLD_BYTES};
use super::key_store::SecureKeyStore;
use super::now_ms;
use super::store::{PersistedRecord, PersistentStore, RotationProgress};
use super::worker::run_on_worker;

/// How `expires_at` is derived for persisted rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiresAtPolicy {
    /// Rows never expire
    Never,

    /// Rows expire after the entry's cache time
    Ttl,

    /// Rows expire after a fixed duration in milliseconds
    Explicit(i64),
}

/// Persistence behavior switches.
#[derive(Debug, Clone)]
pub struct PersistenceOptions {
    /// Encrypt payloads with AES-GCM before storing
    pub encrypt: bool,

    /// Restore every persisted row at client startup instead of on first
    /// observer attach per key
    pub eager_restore: bool,

    pub expires_at_policy: ExpiresAtPolicy,

    /// Logical name the encryption key is stored under in the secure key
    /// store. The key itself never lands in the cache table.
    pub key_name: String,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        PersistenceOptions {
            encrypt: false,
            eager_restore: false,
            expires_at_policy: ExpiresAtPolicy::Never,
            key_name: "fasq:encryption-key".to_string(),
        }
    }
}

/// Injected providers plus options.
#[derive(Clone)]
pub struct PersistenceConfig {
    pub store: Arc<dyn PersistentStore>,
    pub encryptor: Option<Arc<dyn Encryptor>>,
    pub key_store: Option<Arc<dyn SecureKeyStore>>,
    pub options: PersistenceOptions,
}

impl std::fmt::Debug for PersistenceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceConfig")
            .field("encrypt", &self.options.encrypt)
            .field("eager_restore", &self.options.eager_restore)
            .field("expires_at_policy", &self.options.expires_at_policy)
            .finish()
    }
}

#[derive(Clone)]
enum Job {
    Put {
        key: String,
        value: CachedValue,
        cache_time: Duration,
    },
    Delete {
        key: String,
    },
    Clear,
}

/// Drives the persistence providers on behalf of a cache.
pub struct PersistenceManager {
    store: Arc<dyn PersistentStore>,
    encryptor: Option<Arc<dyn Encryptor>>,
    key_store: Option<Arc<dyn SecureKeyStore>>,
    key: RwLock<Option<[u8; KEY_SIZE]>>,
    codecs: Arc<CodecRegistry>,
    options: PersistenceOptions,
    tx: mpsc::UnboundedSender<Job>,
    pending: watch::Sender<usize>,
    retry_queue: Mutex<Vec<Job>>,
}

impl PersistenceManager {
    /// Build the manager, bootstrap the encryption key and start the
    /// write-behind worker. Requires a running tokio runtime.
    pub fn new(config: PersistenceConfig, codecs: Arc<CodecRegistry>) -> Result<Arc<Self>> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            FasqError::Persistence("persistence requires a tokio runtime".to_string())
        })?;

        let mut key = None;
        if config.options.encrypt {
            let key_store = config.key_store.clone().ok_or_else(|| {
                FasqError::SecureStorage(
                    "encryption enabled without a secure key store".to_string(),
                )
            })?;
            if !key_store.is_supported() {
                return Err(FasqError::SecureStorage(
                    "secure key storage unsupported on this target".to_string(),
                ));
            }
            if config.encryptor.is_none() {
                return Err(FasqError::Encryption(
                    "encryption enabled without an encryptor".to_string(),
                ));
            }

            let name = &config.options.key_name;
            let material = match key_store.get(name)? {
                Some(material) => {
                    let bytes: [u8; KEY_SIZE] = material.as_slice().try_into().map_err(|_| {
                        FasqError::SecureStorage(format!(
                            "stored key has wrong length: {} bytes",
                            material.len()
                        ))
                    })?;
                    bytes
                }
                None => key_store.generate_and_store(name)?,
            };
            debug!(fingerprint = %key_fingerprint(&material), "encryption key ready");
            key = Some(material);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(PersistenceManager {
            store: config.store,
            encryptor: config.encryptor,
            key_store: config.key_store,
            key: RwLock::new(key),
            codecs,
            options: config.options,
            tx,
            pending: watch::channel(0).0,
            retry_queue: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&manager);
        handle.spawn(async move {
            Self::worker_loop(weak, rx).await;
        });

        Ok(manager)
    }

    /// Queue a durable write. Returns immediately; unregistered value
    /// types are skipped.
    pub fn schedule_put(&self, key: &str, value: CachedValue, cache_time: Duration) {
        if value.codec_tag().is_none() {
            debug!(
                key,
                value_type = value.type_name(),
                "type not registered for persistence, skipping"
            );
            return;
        }
        self.submit(Job::Put {
            key: key.to_string(),
            value,
            cache_time,
        });
    }

    pub fn schedule_delete(&self, key: &str) {
        self.submit(Job::Delete {
            key: key.to_string(),
        });
    }

    pub fn schedule_clear(&self) {
        self.submit(Job::Clear);
    }

    fn submit(&self, job: Job) {
        self.pending.send_modify(|count| *count += 1);
        if self.tx.send(job).is_err() {
            self.pending.send_modify(|count| *count -= 1);
            warn!("persistence worker gone, dropping job");
        }
    }

    /// Await processing of every queued job. Jobs that failed and were
    /// stashed for retry do not block the flush; they are retried ahead
    /// of the next write.
    pub async fn flush(&self) {
        let mut rx = self.pending.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Restore one persisted row into the cache. Restored entries are
    /// seeded stale so the first observer triggers a refresh. Returns
    /// false (never an error) when the row is absent, expired, corrupt
    /// or undecodable.
    pub async fn restore_into(&self, key: &str, cache: &QueryCache) -> bool {
        let record = match self.store.get(key).await {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(e) => {
                warn!(key, error = %e, "persisted read failed, treating as absent");
                return false;
            }
        };
        match self.decode_record(record).await {
            Some(value) => cache.insert_restored(key, value),
            None => false,
        }
    }

    /// Reap expired rows, then restore everything that remains. Returns
    /// the number of entries seeded into the cache.
    pub async fn restore_all(&self, cache: &QueryCache) -> usize {
        match self.store.cleanup_expired().await {
            Ok(reaped) if reaped > 0 => debug!(reaped, "reaped expired persisted rows"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "expired-row cleanup failed"),
        }

        let keys = match self.store.get_all_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "could not enumerate persisted keys");
                return 0;
            }
        };
        let records = match self.store.get_many(&keys).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "bulk persisted read failed");
                return 0;
            }
        };

        let mut restored = 0;
        for record in records.into_iter().flatten() {
            let key = record.cache_key.clone();
            if let Some(value) = self.decode_record(record).await {
                if cache.insert_restored(&key, value) {
                    restored += 1;
                }
            }
        }
        restored
    }

    /// Re-encrypt all persisted rows under a new key and install it.
    ///
    /// The key switch happens whenever any rows were rotated, including
    /// the partial-failure case: rotated rows are only readable under
    /// the new key, and the failed ones are enumerated in the error.
    pub async fn rotate_encryption_key(
        &self,
        new_key: [u8; KEY_SIZE],
        progress: Option<&RotationProgress>,
    ) -> Result<usize> {
        let encryptor = self.encryptor.clone().ok_or_else(|| {
            FasqError::Encryption("key rotation requires an encryptor".to_string())
        })?;
        let old_key = self.current_key().ok_or_else(|| {
            FasqError::Encryption("no active encryption key to rotate from".to_string())
        })?;

        let result = self
            .store
            .rotate_encryption_key(&old_key, &new_key, &*encryptor, progress)
            .await;

        match &result {
            Ok(_) | Err(FasqError::Rotation { .. }) => self.install_key(new_key)?,
            Err(_) => {}
        }
        result
    }

    pub async fn cleanup_expired(&self) -> Result<usize> {
        self.store.cleanup_expired().await
    }

    pub fn current_key(&self) -> Option<[u8; KEY_SIZE]> {
        *self.key.read()
    }

    pub fn eager_restore(&self) -> bool {
        self.options.eager_restore
    }

    pub fn store(&self) -> Arc<dyn PersistentStore> {
        self.store.clone()
    }

    fn install_key(&self, key: [u8; KEY_SIZE]) -> Result<()> {
        if let Some(key_store) = &self.key_store {
            key_store.set(&self.options.key_name, &key)?;
        }
        *self.key.write() = Some(key);
        info!(fingerprint = %key_fingerprint(&key), "encryption key installed");
        Ok(())
    }

    async fn worker_loop(weak: Weak<Self>, mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = rx.recv().await {
            let Some(manager) = weak.upgrade() else { break };

            let retries: Vec<Job> = manager.retry_queue.lock().drain(..).collect();
            for retry in retries {
                if let Err(e) = manager.process(retry.clone()).await {
                    warn!(error = %e, "retried persistence job failed again");
                    manager.retry_queue.lock().push(retry);
                }
            }

            if let Err(e) = manager.process(job.clone()).await {
                warn!(error = %e, "persistence job failed, will retry on next write");
                manager.retry_queue.lock().push(job);
            }
            manager.pending.send_modify(|count| *count -= 1);
        }
    }

    async fn process(&self, job: Job) -> Result<()> {
        match job {
            Job::Put {
                key,
                value,
                cache_time,
            } => {
                let Some(tag) = value.codec_tag().map(str::to_string) else {
                    return Ok(());
                };
                let encoded = self.codecs.encode(&tag, &value)?;
                let envelope = serde_json::json!({ "tag": tag, "value": encoded });
                let plaintext = serde_json::to_vec(&envelope)
                    .map_err(|e| FasqError::Persistence(format!("envelope encode failed: {}", e)))?;
                let payload = self.seal(plaintext).await?;

                let created_at = now_ms();
                let expires_at = match self.options.expires_at_policy {
                    ExpiresAtPolicy::Never => None,
                    ExpiresAtPolicy::Ttl => Some(created_at + cache_time.as_millis() as i64),
                    ExpiresAtPolicy::Explicit(ttl_ms) => Some(created_at + ttl_ms),
                };

                self.store
                    .put(PersistedRecord {
                        cache_key: key,
                        payload,
                        created_at,
                        expires_at,
                    })
                    .await
            }
            Job::Delete { key } => self.store.delete(&key).await,
            Job::Clear => self.store.clear().await,
        }
    }

    async fn decode_record(&self, record: PersistedRecord) -> Option<CachedValue> {
        let key = record.cache_key;
        let plaintext = match self.open(record.payload).await {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(key, error = %e, "persisted payload failed to decrypt");
                return None;
            }
        };
        let envelope: serde_json::Value = match serde_json::from_slice(&plaintext) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(key, error = %e, "persisted envelope is corrupt");
                return None;
            }
        };
        let tag = envelope.get("tag").and_then(|t| t.as_str())?;
        let encoded = envelope.get("value")?.clone();
        match self.codecs.decode(tag, encoded) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, tag, error = %e, "persisted payload failed to decode");
                None
            }
        }
    }

    /// Encrypt a payload if encryption is on, offloading large payloads
    /// to a blocking worker.
    async fn seal(&self, plaintext: Vec<u8>) -> Result<Vec<u8>> {
        if !self.options.encrypt {
            return Ok(plaintext);
        }
        let encryptor = self
            .encryptor
            .clone()
            .ok_or_else(|| FasqError::Encryption("no encryptor configured".to_string()))?;
        let key = self
            .current_key()
            .ok_or_else(|| FasqError::Encryption("no encryption key available".to_string()))?;

        if plaintext.len() > WORKER_THRESHOLD_BYTES {
            run_on_worker(move || encryptor.encrypt(&plaintext, &key)).await?
        } else {
            encryptor.encrypt(&plaintext, &key)
        }
    }

    async fn open(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        if !self.options.encrypt {
            return Ok(payload);
        }
        let encryptor = self
            .encryptor
            .clone()
            .ok_or_else(|| FasqError::Encryption("no encryptor configured".to_string()))?;
        let key = self
            .current_key()
            .ok_or_else(|| FasqError::Encryption("no encryption key available".to_string()))?;

        if payload.len() > WORKER_THRESHOLD_BYTES {
            run_on_worker(move || encryptor.decrypt(&payload, &key)).await?
        } else {
            encryptor.decrypt(&payload, &key)
        }
    }
}

fn key_fingerprint(key: &[u8; KEY_SIZE]) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(key);
    hex::encode(&digest[..6])
}
