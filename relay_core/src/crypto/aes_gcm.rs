use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::CryptoError;

pub const KEY_SIZE: usize = 32; // AES-256
pub const NONCE_SIZE: usize = 12; // 96-bit GCM nonce

pub struct AesGcmCipher {
    cipher: Aes256Gcm,
    nonce_prefix: [u8; 4],    // Random prefix per cipher instance
    nonce_counter: AtomicU64, // Counter for nonces
}

impl fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmCipher")
            .field("cipher", &"[redacted]")
            .field("nonce_prefix", &self.nonce_prefix)
            .field("nonce_counter", &self.nonce_counter.load(Ordering::Relaxed))
            .finish()
    }
}

impl AesGcmCipher {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey {
                expected: KEY_SIZE,
                actual: key.len(),
            });
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

        let mut nonce_prefix = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut nonce_prefix);

        Ok(Self {
            cipher,
            nonce_prefix,
            nonce_counter: AtomicU64::new(0),
        })
    }

    /// Derives the key as SHA-256 of the passphrase.
    pub fn from_passphrase(passphrase: &str) -> Result<Self, CryptoError> {
        if passphrase.is_empty() {
            return Err(CryptoError::EmptyPassphrase);
        }
        let key = Sha256::digest(passphrase.as_bytes());
        Self::new(key.as_slice())
    }

    pub fn generate_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    // 4-byte prefix | 8-byte big-endian counter
    fn next_nonce(&self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        let count = self.nonce_counter.fetch_add(1, Ordering::SeqCst);
        nonce[0..4].copy_from_slice(&self.nonce_prefix);
        nonce[4..12].copy_from_slice(&count.to_be_bytes());

        if count == u64::MAX {
            tracing::error!("AES-GCM nonce counter wrapped; cipher must be re-keyed");
        }
        nonce
    }

    /// Returns `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = self.next_nonce();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn decrypt(&self, ciphertext_with_nonce: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext_with_nonce.len() < NONCE_SIZE {
            return Err(CryptoError::Malformed(
                "ciphertext is too short to contain a nonce".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = ciphertext_with_nonce.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Authentication)
    }
}
