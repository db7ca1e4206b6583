// Long-term key material

use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidLength(usize),
    #[error("Invalid hex encoding")]
    InvalidHex,
}

/// A user's long-term X25519 key pair
#[derive(Clone)]
pub struct IdentityKeys {
    secret: StaticSecret,
}

impl IdentityKeys {
    /// Generate new identity keys
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(rand::rngs::OsRng),
        }
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.secret)
    }

    /// Get public key as hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key().as_bytes())
    }

    /// Short Blake3 fingerprint of the public key, for display
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key())
    }

    /// Serialize the secret key.
    /// Returns a `Zeroizing<Vec<u8>>` that wipes the key material on drop.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }

    /// Deserialize keys from secret key bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let mut secret_bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
        let secret = StaticSecret::from(secret_bytes);
        secret_bytes.zeroize();
        Ok(Self { secret })
    }
}

impl fmt::Debug for IdentityKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeys")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Parse a hex-encoded 32-byte X25519 public key
pub fn parse_public_key_hex(encoded: &str) -> Result<PublicKey, KeyError> {
    let bytes = hex::decode(encoded.trim()).map_err(|_| KeyError::InvalidHex)?;
    let array: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
    Ok(PublicKey::from(array))
}

pub fn fingerprint(public_key: &PublicKey) -> String {
    let hash = blake3::hash(public_key.as_bytes());
    hex::encode(&hash.as_bytes()[..8])
}
