// # Persistent Store Contract
//
// Bulk-friendly key-value store for encrypted cache rows. A SQL-backed
// implementation maps to a single table:
//
// | column         | type                     |
// |----------------|--------------------------|
// | cache_key      | text primary key         |
// | encrypted_data | blob not null            |
// | created_at     | integer (epoch ms)       |
// | expires_at     | integer (epoch ms), null |
//
// with an index on `expires_at` for cleanup. Recommended SQLite pragmas:
// WAL journal, normal synchronous, 5 s busy timeout. Concrete backends
// live outside this crate and are injected at construction.

use crate::error::{FasqError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::encryption::{Encryptor, KEY_SIZE};

/// Rows re-encrypted per batch flush during key rotation.
pub const ROTATION_BATCH_SIZE: usize = 50;

/// Progress callback for key rotation: `(current, total)`, fired after
/// each row.
pub type RotationProgress = dyn Fn(usize, usize) + Send + Sync;

/// A persisted cache row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub cache_key: String,

    /// IV ‖ ciphertext ‖ tag when encryption is enabled, plaintext bytes
    /// otherwise.
    pub payload: Vec<u8>,

    /// Epoch milliseconds
    pub created_at: i64,

    /// Epoch milliseconds; None never expires
    pub expires_at: Option<i64>,
}

impl PersistedRecord {
    /// A record whose `expires_at` has passed is treated as absent on
    /// read and reaped on cleanup.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }
}

/// Durable kv store keyed by cache key.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Read one row. Expired rows read as absent.
    async fn get(&self, key: &str) -> Result<Option<PersistedRecord>>;

    async fn put(&self, record: PersistedRecord) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn clear(&self) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn get_all_keys(&self) -> Result<Vec<String>>;

    /// Batched read, result aligned with the requested keys.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<PersistedRecord>>>;

    async fn put_many(&self, records: Vec<PersistedRecord>) -> Result<()>;

    async fn delete_many(&self, keys: &[String]) -> Result<()>;

    /// Remove expired rows, returning how many were reaped.
    async fn cleanup_expired(&self) -> Result<usize>;

    /// Whether `rotate_encryption_key` may be called on this store.
    fn supports_encryption_key_rotation(&self) -> bool {
        true
    }

    /// Re-encrypt every row from `old_key` to `new_key`.
    ///
    /// Rows are decrypted, re-encrypted and flushed in batches of
    /// `ROTATION_BATCH_SIZE`, yielding to the scheduler between batches
    /// so observers stay responsive. Rows that fail to re-encrypt are
    /// collected and reported at the end as a rotation error; rows that
    /// succeeded stay rotated. The progress callback fires after each
    /// row.
    async fn rotate_encryption_key(
        &self,
        old_key: &[u8; KEY_SIZE],
        new_key: &[u8; KEY_SIZE],
        encryptor: &dyn Encryptor,
        progress: Option<&RotationProgress>,
    ) -> Result<usize> {
        if !self.supports_encryption_key_rotation() {
            return Err(FasqError::Persistence(
                "store does not support encryption key rotation".to_string(),
            ));
        }

        let keys = self.get_all_keys().await?;
        let total = keys.len();
        let mut batch: Vec<PersistedRecord> = Vec::with_capacity(ROTATION_BATCH_SIZE);
        let mut failed_keys: Vec<String> = Vec::new();
        let mut current = 0usize;
        let mut rotated = 0usize;

        for key in keys {
            current += 1;
            match self.get(&key).await {
                Ok(Some(mut record)) => {
                    let reencrypted = encryptor
                        .decrypt(&record.payload, old_key)
                        .and_then(|plaintext| encryptor.encrypt(&plaintext, new_key));
                    match reencrypted {
                        Ok(payload) => {
                            record.payload = payload;
                            batch.push(record);
                            rotated += 1;
                        }
                        Err(e) => {
                            warn!(key = %key, error = %e, "row failed to re-encrypt");
                            failed_keys.push(key);
                        }
                    }
                }
                // Removed (or expired) while rotating; nothing to do.
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "row unreadable during rotation");
                    failed_keys.push(key);
                }
            }

            if let Some(cb) = progress {
                cb(current, total);
            }

            if batch.len() >= ROTATION_BATCH_SIZE {
                self.put_many(std::mem::take(&mut batch)).await?;
                tokio::task::yield_now().await;
            }
        }

        if !batch.is_empty() {
            self.put_many(batch).await?;
        }

        if !failed_keys.is_empty() {
            return Err(FasqError::Rotation { failed_keys });
        }
        Ok(rotated)
    }
}
