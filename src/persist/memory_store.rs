// # In-Memory Persistent Store
//
// Reference implementation of the `PersistentStore` contract, used by
// tests and as the model for out-of-crate backends. Expiry semantics
// match the contract: expired rows read as absent and are reaped by
// `cleanup_expired`.

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::now_ms;
use super::store::{PersistedRecord, PersistentStore};

#[derive(Default)]
pub struct MemoryPersistentStore {
    rows: RwLock<HashMap<String, PersistedRecord>>,
}

impl MemoryPersistentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total rows including expired ones (introspection for tests).
    pub fn raw_len(&self) -> usize {
        self.rows.read().len()
    }
}

#[async_trait]
impl PersistentStore for MemoryPersistentStore {
    async fn get(&self, key: &str) -> Result<Option<PersistedRecord>> {
        let rows = self.rows.read();
        Ok(rows
            .get(key)
            .filter(|record| !record.is_expired(now_ms()))
            .cloned())
    }

    async fn put(&self, record: PersistedRecord) -> Result<()> {
        self.rows.write().insert(record.cache_key.clone(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.rows.write().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.rows.write().clear();
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        let now = now_ms();
        let rows = self.rows.read();
        let mut keys: Vec<String> = rows
            .values()
            .filter(|record| !record.is_expired(now))
            .map(|record| record.cache_key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<PersistedRecord>>> {
        let now = now_ms();
        let rows = self.rows.read();
        Ok(keys
            .iter()
            .map(|key| rows.get(key).filter(|r| !r.is_expired(now)).cloned())
            .collect())
    }

    async fn put_many(&self, records: Vec<PersistedRecord>) -> Result<()> {
        let mut rows = self.rows.write();
        for record in records {
            rows.insert(record.cache_key.clone(), record);
        }
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        let mut rows = self.rows.write();
        for key in keys {
            rows.remove(key);
        }
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let now = now_ms();
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|_, record| !record.is_expired(now));
        Ok(before - rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, expires_at: Option<i64>) -> PersistedRecord {
        PersistedRecord {
            cache_key: key.to_string(),
            payload: vec![1, 2, 3],
            created_at: now_ms(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryPersistentStore::new();
        store.put(record("a", None)).await.unwrap();

        assert!(store.exists("a").await.unwrap());
        assert_eq!(store.get("a").await.unwrap().unwrap().payload, vec![1, 2, 3]);

        store.delete("a").await.unwrap();
        assert!(!store.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_rows_read_as_absent() {
        let store = MemoryPersistentStore::new();
        store.put(record("gone", Some(now_ms() - 1000))).await.unwrap();
        store.put(record("kept", Some(now_ms() + 60_000))).await.unwrap();

        assert!(store.get("gone").await.unwrap().is_none());
        assert!(store.get("kept").await.unwrap().is_some());
        assert_eq!(store.get_all_keys().await.unwrap(), vec!["kept".to_string()]);
        assert_eq!(store.raw_len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let store = MemoryPersistentStore::new();
        store.put(record("a", Some(now_ms() - 10))).await.unwrap();
        store.put(record("b", Some(now_ms() - 10))).await.unwrap();
        store.put(record("c", None)).await.unwrap();

        assert_eq!(store.cleanup_expired().await.unwrap(), 2);
        assert_eq!(store.raw_len(), 1);
    }

    #[tokio::test]
    async fn test_batch_operations() {
        let store = MemoryPersistentStore::new();
        store
            .put_many(vec![record("a", None), record("b", None), record("c", None)])
            .await
            .unwrap();

        let keys = vec!["a".to_string(), "missing".to_string(), "c".to_string()];
        let found = store.get_many(&keys).await.unwrap();
        assert!(found[0].is_some());
        assert!(found[1].is_none());
        assert!(found[2].is_some());

        store
            .delete_many(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(store.get_all_keys().await.unwrap(), vec!["c".to_string()]);
    }
}
