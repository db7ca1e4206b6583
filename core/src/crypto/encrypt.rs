// Channel encryption: X25519 static-static ECDH + XChaCha20-Poly1305
//
// Flow:
// 1. ECDH: own_static_secret × peer_static_public → shared_secret
// 2. KDF: Blake3::derive_key(shared_secret) → channel key
// 3. Encrypt: XChaCha20-Poly1305(channel key, random_nonce, plaintext)
//
// Each peer runs step 1 with its own secret and the other side's public key,
// so both land on the same channel key without ever sending it.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// KDF context string for deriving channel keys from ECDH shared secrets.
/// Changing this breaks compatibility with every deployed client.
const KDF_CONTEXT: &str = "tandem v1 peer channel key 2026-10-01";

/// Symmetric key length in bytes
pub const KEY_LEN: usize = 32;

/// XChaCha20 nonce length in bytes
pub const NONCE_LEN: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("Peer public key is a low-order point")]
    WeakPublicKey,
    #[error("Encryption failed")]
    Encryption,
    #[error("Integrity check failed: wrong key, wrong nonce, or tampered ciphertext")]
    Integrity,
    #[error("Malformed channel frame: {0}")]
    MalformedFrame(String),
}

/// Symmetric key shared by the two ends of one negotiated channel.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; KEY_LEN]);

impl SharedKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305, CryptoError> {
        XChaCha20Poly1305::new_from_slice(&self.0).map_err(|_| CryptoError::Encryption)
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(<redacted>)")
    }
}

/// Derive the channel key from our long-term secret and the peer's public key.
///
/// Rejects peer keys that produce an all-zero shared secret (low-order
/// points), since every party would derive that same "shared" key.
pub fn derive_shared_key(
    own_secret: &StaticSecret,
    peer_public: &PublicKey,
) -> Result<SharedKey, CryptoError> {
    let shared_secret = own_secret.diffie_hellman(peer_public);
    if !shared_secret.was_contributory() {
        return Err(CryptoError::WeakPublicKey);
    }

    Ok(SharedKey(blake3::derive_key(
        KDF_CONTEXT,
        shared_secret.as_bytes(),
    )))
}

fn seal(key: &SharedKey, aad: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = key
        .cipher()?
        .encrypt(
            XNonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)?;

    Ok((nonce_bytes.to_vec(), ciphertext))
}

fn open(key: &SharedKey, aad: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::Integrity);
    }

    key.cipher()?
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Integrity)
}

/// Encrypt under a fresh random nonce. Returns `(nonce, ciphertext)`.
pub fn encrypt(key: &SharedKey, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    seal(key, &[], plaintext)
}

/// Decrypt and authenticate. Any tampering, wrong key or wrong nonce
/// yields `CryptoError::Integrity`.
pub fn decrypt(key: &SharedKey, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    open(key, &[], nonce, ciphertext)
}

/// Encrypted chat payload as carried over the direct channel.
///
/// `sender` is bound as associated data: rewriting it in transit makes
/// [`EncryptedMessage::open`] fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub sender: String,
}

impl EncryptedMessage {
    pub fn seal(key: &SharedKey, sender: &str, plaintext: &[u8]) -> Result<Self, CryptoError> {
        let (nonce, ciphertext) = seal(key, sender.as_bytes(), plaintext)?;
        Ok(Self {
            nonce,
            ciphertext,
            sender: sender.to_string(),
        })
    }

    pub fn open(&self, key: &SharedKey) -> Result<Vec<u8>, CryptoError> {
        open(key, self.sender.as_bytes(), &self.nonce, &self.ciphertext)
    }
}

/// Frames exchanged on the direct channel, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelFrame {
    #[serde(rename = "encryptedMessage")]
    EncryptedMessage(EncryptedMessage),
}

impl ChannelFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        serde_json::to_vec(self).map_err(|e| CryptoError::MalformedFrame(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        serde_json::from_slice(bytes).map_err(|e| CryptoError::MalformedFrame(e.to_string()))
    }
}
