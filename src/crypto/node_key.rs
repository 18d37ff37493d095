//! Node identity key
//!
//! A secp256k1 key pair generated on first start and kept in the address
//! database, so the node's public identity is stable across restarts.

use rand::rngs::OsRng;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
}

/// The node's identity key pair
#[derive(Clone)]
pub struct NodeKey {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl NodeKey {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Rebuild from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Compressed public key, hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }
}

impl std::fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKey")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip_keeps_identity() {
        let key = NodeKey::generate();
        let restored = NodeKey::from_private_key_hex(&key.private_key_hex()).unwrap();
        assert_eq!(key.public_key_hex(), restored.public_key_hex());
        // 33-byte compressed key
        assert_eq!(key.public_key_hex().len(), 66);
    }

    #[test]
    fn test_invalid_private_key() {
        assert!(NodeKey::from_private_key_hex("zz").is_err());
        assert!(NodeKey::from_private_key_hex("00").is_err());
    }
}
