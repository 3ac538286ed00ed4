//! Encryption at rest for configuration and mesh state files.
//!
//! A sealed payload is the ASCII prefix `ENC:` followed by the hex encoding of
//! `nonce || AES-256-GCM ciphertext`, keyed by SHA-256 of a passphrase that is
//! supplied out-of-band.

mod aes_gcm;

pub use aes_gcm::{AesGcmCipher, KEY_SIZE, NONCE_SIZE};

use thiserror::Error;

/// Prefix marking a sealed payload.
pub const SEALED_PREFIX: &str = "ENC:";

/// Errors raised by the crypto helpers.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKey { expected: usize, actual: usize },

    #[error("passphrase must not be empty")]
    EmptyPassphrase,

    #[error("encryption failed")]
    Encryption,

    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    /// Wrong passphrase or tampered data.
    #[error("authentication failed: wrong passphrase or corrupted data")]
    Authentication,
}

/// Returns true when `data` carries the sealed prefix.
pub fn is_sealed(data: &[u8]) -> bool {
    data.starts_with(SEALED_PREFIX.as_bytes())
}

/// Encrypts `plaintext` into the textual sealed layout.
pub fn seal(plaintext: &[u8], passphrase: &str) -> Result<String, CryptoError> {
    let cipher = AesGcmCipher::from_passphrase(passphrase)?;
    let sealed = cipher.encrypt(plaintext)?;
    Ok(format!("{SEALED_PREFIX}{}", hex::encode(sealed)))
}

/// Reverses [`seal`]. Fails closed on a wrong passphrase.
pub fn open(data: &[u8], passphrase: &str) -> Result<Vec<u8>, CryptoError> {
    let body = data
        .strip_prefix(SEALED_PREFIX.as_bytes())
        .ok_or_else(|| CryptoError::Malformed("missing ENC: prefix".to_string()))?;
    let text = std::str::from_utf8(body)
        .map_err(|_| CryptoError::Malformed("payload is not ASCII hex".to_string()))?;
    let raw = hex::decode(text.trim())
        .map_err(|e| CryptoError::Malformed(format!("invalid hex: {e}")))?;

    AesGcmCipher::from_passphrase(passphrase)?.decrypt(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let payloads: [&[u8]; 4] = [
            b"",
            b"version = \"1.0\"\n",
            &[0u8, 255, 7, 128],
            &[42u8; 4096],
        ];
        for payload in payloads {
            let sealed = seal(payload, "correct horse").unwrap();
            assert!(sealed.starts_with(SEALED_PREFIX));
            assert!(is_sealed(sealed.as_bytes()));
            assert_eq!(open(sealed.as_bytes(), "correct horse").unwrap(), payload);
        }
    }

    #[test]
    fn test_open_with_wrong_passphrase_fails_closed() {
        let sealed = seal(b"[[servers]]\nhost = \"a\"", "pw1").unwrap();
        assert!(matches!(
            open(sealed.as_bytes(), "pw2"),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn test_open_rejects_plaintext_and_bad_hex() {
        assert!(matches!(
            open(b"version = \"1.0\"", "pw"),
            Err(CryptoError::Malformed(_))
        ));
        assert!(matches!(
            open(b"ENC:zz-not-hex", "pw"),
            Err(CryptoError::Malformed(_))
        ));
    }

    #[test]
    fn test_sealing_twice_gives_different_ciphertext() {
        let a = seal(b"same", "pw").unwrap();
        let b = seal(b"same", "pw").unwrap();
        assert_ne!(a, b);
    }
}
