//! Node identifiers and key material.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use x25519_dalek::{PublicKey, StaticSecret};

/// Source of node ids and key pairs. Tests substitute a seeded source to get
/// reproducible sequences.
pub trait IdSource: Send + Sync {
    fn node_id(&self) -> String;

    fn key_pair(&self) -> NodeKeyPair;
}

/// x25519 key pair, base64 encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct NodeKeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl fmt::Debug for NodeKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

impl NodeKeyPair {
    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        NodeKeyPair {
            private_key: STANDARD.encode(secret.to_bytes()),
            public_key: STANDARD.encode(public.as_bytes()),
        }
    }

    /// Rebuilds a key pair from a persisted private key.
    pub fn from_private_key(encoded: &str) -> Option<Self> {
        let bytes: [u8; 32] = STANDARD.decode(encoded.trim()).ok()?.try_into().ok()?;
        Some(Self::from_secret(StaticSecret::from(bytes)))
    }
}

/// CSPRNG-backed [`IdSource`].
pub struct RandomIdSource {
    rng: Mutex<StdRng>,
}

impl RandomIdSource {
    /// Seeded from the operating system.
    pub fn from_entropy() -> Self {
        RandomIdSource {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic sequence for tests.
    pub fn seeded(seed: u64) -> Self {
        RandomIdSource {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn fill(&self, buf: &mut [u8]) {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fill_bytes(buf);
    }
}

impl Default for RandomIdSource {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl IdSource for RandomIdSource {
    fn node_id(&self) -> String {
        let mut bytes = [0u8; 16];
        self.fill(&mut bytes);
        let uuid = uuid::Builder::from_random_bytes(bytes).into_uuid();
        let hex = uuid.simple().to_string();
        format!("node-{}", &hex[..12])
    }

    fn key_pair(&self) -> NodeKeyPair {
        let mut bytes = [0u8; 32];
        self.fill(&mut bytes);
        NodeKeyPair::from_secret(StaticSecret::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_shape() {
        let id = RandomIdSource::from_entropy().node_id();
        assert!(id.starts_with("node-"));
        assert_eq!(id.len(), 17);
        assert!(id[5..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_seeded_sources_repeat() {
        let a = RandomIdSource::seeded(7);
        let b = RandomIdSource::seeded(7);
        assert_eq!(a.node_id(), b.node_id());
        assert_eq!(a.key_pair(), b.key_pair());
        assert_ne!(a.node_id(), a.node_id());
    }

    #[test]
    fn test_key_pair_restores_from_private_key() {
        let pair = RandomIdSource::seeded(1).key_pair();
        assert_eq!(NodeKeyPair::from_private_key(&pair.private_key), Some(pair.clone()));
        assert!(NodeKeyPair::from_private_key("short").is_none());
        assert!(!format!("{pair:?}").contains(&pair.private_key));
    }
}
