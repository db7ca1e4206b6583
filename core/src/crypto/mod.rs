// Cryptography module: key agreement and channel encryption

pub mod encrypt;

pub use encrypt::{
    decrypt, derive_shared_key, encrypt, ChannelFrame, CryptoError, EncryptedMessage, SharedKey,
    KEY_LEN, NONCE_LEN,
};
pub use x25519_dalek::{PublicKey, StaticSecret};
