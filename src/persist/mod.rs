// # Persistence Layer
//
// Optional encrypted persistence for cached entries. The core depends
// only on three provider contracts (`SecureKeyStore`, `Encryptor`,
// `PersistentStore`) injected at construction; concrete platform
// backends live outside the crate. In-memory reference implementations
// are provided for tests and unsupported targets.

pub mod encryption;
pub mod key_store;
pub mod memory_store;
pub mod pipeline;
pub mod store;
pub mod worker;

pub use encryption::{AesGcmEncryptor, Encryptor, IV_SIZE, KEY_SIZE, TAG_SIZE, WORKER_THRESHOLD_BYTES};
pub use key_store::{MemorySecureKeyStore, SecureKeyStore, UnsupportedKeyStore};
pub use memory_store::MemoryPersistentStore;
pub use pipeline::{ExpiresAtPolicy, PersistenceConfig, PersistenceManager, PersistenceOptions};
pub use store::{PersistedRecord, PersistentStore, RotationProgress, ROTATION_BATCH_SIZE};

/// Current epoch time in milliseconds, the unit used on persisted rows.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
