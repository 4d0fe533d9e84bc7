// Comprehensive Persistence & Encryption Integration Tests
// Test ID Format: PERSIST-XXX

use fasq::persist::ROTATION_BATCH_SIZE;
use fasq::{
    AesGcmEncryptor, CacheConfig, CodecRegistry, Encryptor, ExpiresAtPolicy, FasqError,
    MemoryPersistentStore, MemorySecureKeyStore, PersistedRecord, PersistenceConfig,
    PersistenceOptions, PersistentStore, QueryClient, QueryClientConfig, SecureKeyStore,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    id: u64,
    name: String,
}

struct Providers {
    store: Arc<MemoryPersistentStore>,
    key_store: Arc<MemorySecureKeyStore>,
    encryptor: Arc<AesGcmEncryptor>,
}

impl Providers {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        Providers {
            store: Arc::new(MemoryPersistentStore::new()),
            key_store: Arc::new(MemorySecureKeyStore::new()),
            encryptor: Arc::new(AesGcmEncryptor::new()),
        }
    }

    fn client(&self) -> QueryClient {
        let client = QueryClient::new(QueryClientConfig {
            cache: CacheConfig::default(),
            persistence: Some(PersistenceConfig {
                store: self.store.clone(),
                encryptor: Some(self.encryptor.clone()),
                key_store: Some(self.key_store.clone()),
                options: PersistenceOptions {
                    encrypt: true,
                    ..PersistenceOptions::default()
                },
            }),
            offline_stop_on_error: false,
            codecs: None,
        })
        .unwrap();
        client.register_codec::<Profile>("profile").unwrap();
        client
    }
}

fn profile(id: u64) -> Profile {
    Profile {
        id,
        name: format!("user-{}", id),
    }
}

// PERSIST-001: encrypted write-behind survives a "restart": a second
// client over the same providers restores the rows, seeded stale.
#[tokio::test]
async fn test_persist_001_restart_restore() {
    let providers = Providers::new();
    {
        let client = providers.client();
        for id in 0..3 {
            client
                .set_query_data(&format!("users:{}", id), profile(id), None)
                .unwrap();
        }
        client.flush().await;
    }

    let client = providers.client();
    assert_eq!(client.restore_persisted().await, 3);
    for id in 0..3 {
        let key = format!("users:{}", id);
        let data = client.get_query_data::<Profile>(&key).unwrap().unwrap();
        assert_eq!(*data, profile(id));
        assert!(!client.cache().entry_info(&key).unwrap().is_fresh);
    }
}

// PERSIST-002: rotation re-encrypts every row, reports progress per row
// and leaves nothing readable under the old key.
#[tokio::test]
async fn test_persist_002_key_rotation() {
    let providers = Providers::new();
    let client = providers.client();
    for id in 0..5 {
        client
            .set_query_data(&format!("rot:{}", id), profile(id), None)
            .unwrap();
    }
    client.flush().await;

    let old_key: [u8; 32] = providers
        .key_store
        .get("fasq:encryption-key")
        .unwrap()
        .unwrap()
        .try_into()
        .unwrap();

    let progress: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let progress_log = progress.clone();
    let new_key = [7u8; 32];
    let rotated = client
        .rotate_encryption_key(
            new_key,
            Some(&move |current, total| progress_log.lock().push((current, total))),
        )
        .await
        .unwrap();
    assert_eq!(rotated, 5);

    let calls = progress.lock().clone();
    assert_eq!(calls.len(), 5);
    for (index, (current, total)) in calls.iter().enumerate() {
        assert_eq!(*current, index + 1);
        assert_eq!(*total, 5);
    }

    // Every row decrypts under the new key and fails under the old one.
    for id in 0..5 {
        let record = providers
            .store
            .get(&format!("rot:{}", id))
            .await
            .unwrap()
            .unwrap();
        assert!(providers.encryptor.decrypt(&record.payload, &new_key).is_ok());
        assert!(matches!(
            providers.encryptor.decrypt(&record.payload, &old_key),
            Err(FasqError::Encryption(_))
        ));
    }

    // The secure key store now holds the new key, so a fresh client
    // restores transparently.
    let client = providers.client();
    assert_eq!(client.restore_persisted().await, 5);
}

// PERSIST-003: rows that cannot be re-encrypted are enumerated in the
// rotation error while the healthy rows stay rotated.
#[tokio::test]
async fn test_persist_003_partial_rotation_failure() {
    let providers = Providers::new();
    let client = providers.client();
    for id in 0..3 {
        client
            .set_query_data(&format!("ok:{}", id), profile(id), None)
            .unwrap();
    }
    client.flush().await;

    // Two rows of garbage that fail decryption under any key.
    for id in 0..2 {
        providers
            .store
            .put(PersistedRecord {
                cache_key: format!("bad:{}", id),
                payload: vec![0u8; 48],
                created_at: now_ms(),
                expires_at: None,
            })
            .await
            .unwrap();
    }

    let new_key = [9u8; 32];
    let error = client.rotate_encryption_key(new_key, None).await.unwrap_err();
    match error {
        FasqError::Rotation { mut failed_keys } => {
            failed_keys.sort();
            assert_eq!(failed_keys, vec!["bad:0".to_string(), "bad:1".to_string()]);
        }
        other => panic!("expected rotation error, got {}", other),
    }

    // Healthy rows were rotated and the new key installed.
    for id in 0..3 {
        let record = providers
            .store
            .get(&format!("ok:{}", id))
            .await
            .unwrap()
            .unwrap();
        assert!(providers.encryptor.decrypt(&record.payload, &new_key).is_ok());
    }
}

// PERSIST-004: rotation batches beyond ROTATION_BATCH_SIZE still visit
// every row exactly once.
#[tokio::test]
async fn test_persist_004_rotation_batching() {
    let providers = Providers::new();
    let client = providers.client();
    let total = ROTATION_BATCH_SIZE * 2 + 7;
    for id in 0..total {
        client
            .set_query_data(&format!("bulk:{}", id), profile(id as u64), None)
            .unwrap();
    }
    client.flush().await;

    let progress: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
    let progress_counter = progress.clone();
    let rotated = client
        .rotate_encryption_key(
            [3u8; 32],
            Some(&move |_, reported_total| {
                assert_eq!(reported_total, total);
                *progress_counter.lock() += 1;
            }),
        )
        .await
        .unwrap();

    assert_eq!(rotated, total);
    assert_eq!(*progress.lock(), total);
}

// PERSIST-005: expired rows read as absent, are skipped by restore and
// reaped by cleanup.
#[tokio::test]
async fn test_persist_005_expiry() {
    let providers = Providers::new();
    let client = QueryClient::new(QueryClientConfig {
        cache: CacheConfig::default(),
        persistence: Some(PersistenceConfig {
            store: providers.store.clone(),
            encryptor: Some(providers.encryptor.clone()),
            key_store: Some(providers.key_store.clone()),
            options: PersistenceOptions {
                encrypt: true,
                expires_at_policy: ExpiresAtPolicy::Ttl,
                ..PersistenceOptions::default()
            },
        }),
        offline_stop_on_error: false,
        codecs: None,
    })
    .unwrap();
    client.register_codec::<Profile>("profile").unwrap();

    client
        .set_query_data("short:1", profile(1), None)
        .unwrap();
    client.flush().await;

    // Forge an already-expired row alongside the healthy one.
    providers
        .store
        .put(PersistedRecord {
            cache_key: "expired:1".to_string(),
            payload: vec![1u8; 48],
            created_at: now_ms() - 10_000,
            expires_at: Some(now_ms() - 5_000),
        })
        .await
        .unwrap();

    assert!(providers.store.get("expired:1").await.unwrap().is_none());
    assert_eq!(client.restore_persisted().await, 1);
    assert!(client.cache().contains_key("short:1"));
    assert!(!client.cache().contains_key("expired:1"));
}

// PERSIST-006: eager restore at initialization seeds the cache before
// the first observer shows up.
#[tokio::test]
async fn test_persist_006_eager_restore() {
    let providers = Providers::new();
    {
        let client = providers.client();
        client.set_query_data("eager:1", profile(1), None).unwrap();
        client.flush().await;
    }

    // Eager restore decodes rows during initialization, so the codec
    // registry has to be populated up front.
    let codecs = Arc::new(CodecRegistry::new());
    codecs.register::<Profile>("profile").unwrap();

    let client = QueryClient::initialize(QueryClientConfig {
        cache: CacheConfig::default(),
        persistence: Some(PersistenceConfig {
            store: providers.store.clone(),
            encryptor: Some(providers.encryptor.clone()),
            key_store: Some(providers.key_store.clone()),
            options: PersistenceOptions {
                encrypt: true,
                eager_restore: true,
                ..PersistenceOptions::default()
            },
        }),
        offline_stop_on_error: false,
        codecs: Some(codecs),
    })
    .await
    .unwrap();

    assert!(client.cache().contains_key("eager:1"));
}
