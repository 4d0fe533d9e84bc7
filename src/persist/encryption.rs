// # Encryption Provider
//
// AES-256-GCM encryption for persisted payloads. The wire layout is
// IV ‖ ciphertext ‖ tag; decryption validates the tag and fails with a
// structured error on mismatch or a wrong key.

use crate::error::{FasqError, Result};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};

/// Key size in bytes (AES-256)
pub const KEY_SIZE: usize = 32;

/// IV size in bytes (96-bit GCM nonce)
pub const IV_SIZE: usize = 12;

/// Authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Payloads above this size are encrypted on a blocking worker.
pub const WORKER_THRESHOLD_BYTES: usize = 50 * 1024;

/// Encryption provider contract.
///
/// Output layout is IV ‖ ciphertext ‖ tag. Implementations must be
/// deterministic given (plaintext, key, IV) and must reject tampered
/// payloads.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], key: &[u8; KEY_SIZE]) -> Result<Vec<u8>>;
    fn decrypt(&self, payload: &[u8], key: &[u8; KEY_SIZE]) -> Result<Vec<u8>>;
}

/// AES-256-GCM encryptor with operation counters.
#[derive(Debug, Default)]
pub struct AesGcmEncryptor {
    encrypt_count: AtomicU64,
    decrypt_count: AtomicU64,
}

impl AesGcmEncryptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encrypt_count(&self) -> u64 {
        self.encrypt_count.load(Ordering::Relaxed)
    }

    pub fn decrypt_count(&self) -> u64 {
        self.decrypt_count.load(Ordering::Relaxed)
    }
}

impl Encryptor for AesGcmEncryptor {
    fn encrypt(&self, plaintext: &[u8], key: &[u8; KEY_SIZE]) -> Result<Vec<u8>> {
        self.encrypt_count.fetch_add(1, Ordering::Relaxed);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

        let mut iv = [0u8; IV_SIZE];
        rand::rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        // The aead crate appends the tag to the ciphertext, which is
        // exactly the IV ‖ ciphertext ‖ tag layout once prefixed.
        let ciphertext_with_tag = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| FasqError::Encryption(format!("AES-GCM encryption failed: {}", e)))?;

        let mut payload = Vec::with_capacity(IV_SIZE + ciphertext_with_tag.len());
        payload.extend_from_slice(&iv);
        payload.extend_from_slice(&ciphertext_with_tag);
        Ok(payload)
    }

    fn decrypt(&self, payload: &[u8], key: &[u8; KEY_SIZE]) -> Result<Vec<u8>> {
        self.decrypt_count.fetch_add(1, Ordering::Relaxed);

        if payload.len() < IV_SIZE + TAG_SIZE {
            return Err(FasqError::Encryption(format!(
                "payload too short: {} bytes",
                payload.len()
            )));
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let (iv, ciphertext_with_tag) = payload.split_at(IV_SIZE);
        let nonce = Nonce::from_slice(iv);

        cipher
            .decrypt(nonce, ciphertext_with_tag)
            .map_err(|_| FasqError::Encryption("AES-GCM tag mismatch or invalid key".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> [u8; KEY_SIZE] {
        [seed; KEY_SIZE]
    }

    #[test]
    fn test_roundtrip() {
        let enc = AesGcmEncryptor::new();
        let plaintext = b"cached payload".to_vec();
        let payload = enc.encrypt(&plaintext, &key(1)).unwrap();

        assert_eq!(payload.len(), IV_SIZE + plaintext.len() + TAG_SIZE);
        assert_eq!(enc.decrypt(&payload, &key(1)).unwrap(), plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let enc = AesGcmEncryptor::new();
        let payload = enc.encrypt(b"secret", &key(1)).unwrap();
        let err = enc.decrypt(&payload, &key(2)).unwrap_err();
        assert!(matches!(err, FasqError::Encryption(_)));
    }

    #[test]
    fn test_tampered_payload_fails() {
        let enc = AesGcmEncryptor::new();
        let mut payload = enc.encrypt(b"secret", &key(1)).unwrap();
        let last = payload.len() - 1;
        payload[last] ^= 0xFF;
        assert!(enc.decrypt(&payload, &key(1)).is_err());
    }

    #[test]
    fn test_short_payload_rejected() {
        let enc = AesGcmEncryptor::new();
        assert!(enc.decrypt(&[0u8; 8], &key(1)).is_err());
    }

    #[test]
    fn test_unique_ivs() {
        let enc = AesGcmEncryptor::new();
        let a = enc.encrypt(b"same", &key(1)).unwrap();
        let b = enc.encrypt(b"same", &key(1)).unwrap();
        assert_ne!(a[..IV_SIZE], b[..IV_SIZE]);
    }

    #[test]
    fn test_operation_counters() {
        let enc = AesGcmEncryptor::new();
        let payload = enc.encrypt(b"x", &key(1)).unwrap();
        enc.decrypt(&payload, &key(1)).unwrap();
        assert_eq!(enc.encrypt_count(), 1);
        assert_eq!(enc.decrypt_count(), 1);
    }
}
