// # Secure Key Storage
//
// Contract for platform key storage (keychain, keystore, credential
// vault). Not every target supports one; `is_supported` must be honored
// before any other call. The in-memory implementation mimics a
// string-valued platform facility and backs tests.

use crate::error::{FasqError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use rand::RngCore;
use std::collections::HashMap;

use super::encryption::KEY_SIZE;

/// Platform-specific secure key storage.
pub trait SecureKeyStore: Send + Sync {
    /// Whether this target has a usable secure storage facility.
    fn is_supported(&self) -> bool;

    fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    fn set(&self, name: &str, material: &[u8]) -> Result<()>;

    fn has(&self, name: &str) -> Result<bool> {
        Ok(self.get(name)?.is_some())
    }

    fn delete(&self, name: &str) -> Result<()>;

    /// Generate a fresh 256-bit key, store it under `name` and return it.
    fn generate_and_store(&self, name: &str) -> Result<[u8; KEY_SIZE]> {
        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        self.set(name, &key)?;
        Ok(key)
    }
}

/// In-memory key store. Values are held base64-encoded, the shape most
/// platform keystores impose.
#[derive(Default)]
pub struct MemorySecureKeyStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemorySecureKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureKeyStore for MemorySecureKeyStore {
    fn is_supported(&self) -> bool {
        true
    }

    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match self.entries.read().get(name) {
            Some(encoded) => {
                let material = BASE64.decode(encoded).map_err(|e| {
                    FasqError::SecureStorage(format!("corrupt key material for {:?}: {}", name, e))
                })?;
                Ok(Some(material))
            }
            None => Ok(None),
        }
    }

    fn set(&self, name: &str, material: &[u8]) -> Result<()> {
        self.entries
            .write()
            .insert(name.to_string(), BASE64.encode(material));
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.entries.write().remove(name);
        Ok(())
    }
}

/// A key store for targets without secure storage; every operation other
/// than `is_supported` fails.
#[derive(Debug, Default)]
pub struct UnsupportedKeyStore;

impl SecureKeyStore for UnsupportedKeyStore {
    fn is_supported(&self) -> bool {
        false
    }

    fn get(&self, _name: &str) -> Result<Option<Vec<u8>>> {
        Err(FasqError::SecureStorage("secure storage unsupported".to_string()))
    }

    fn set(&self, _name: &str, _material: &[u8]) -> Result<()> {
        Err(FasqError::SecureStorage("secure storage unsupported".to_string()))
    }

    fn delete(&self, _name: &str) -> Result<()> {
        Err(FasqError::SecureStorage("secure storage unsupported".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let store = MemorySecureKeyStore::new();
        assert!(store.get("k").unwrap().is_none());

        store.set("k", &[1, 2, 3]).unwrap();
        assert_eq!(store.get("k").unwrap().unwrap(), vec![1, 2, 3]);
        assert!(store.has("k").unwrap());

        store.delete("k").unwrap();
        assert!(!store.has("k").unwrap());
    }

    #[test]
    fn test_generate_and_store() {
        let store = MemorySecureKeyStore::new();
        let key = store.generate_and_store("enc").unwrap();
        assert_eq!(store.get("enc").unwrap().unwrap(), key.to_vec());
        // Fresh keys differ between generations.
        let other = store.generate_and_store("enc2").unwrap();
        assert_ne!(key, other);
    }

    #[test]
    fn test_unsupported_store() {
        let store = UnsupportedKeyStore;
        assert!(!store.is_supported());
        assert!(store.get("k").is_err());
    }
}
