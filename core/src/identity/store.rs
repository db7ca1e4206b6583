// Private-key storage, one entry per local username

use super::keys::{IdentityKeys, KeyError};
use crate::store::{MemoryStorage, StorageBackend, StoreError};
use std::sync::Arc;
use thiserror::Error;

const PRIVATE_KEY_PREFIX: &str = "private_key/";

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("Stored key for {username} is corrupt: {source}")]
    Corrupt { username: String, source: KeyError },
}

/// Persists long-term private keys across sessions
#[derive(Clone)]
pub struct KeyStore {
    backend: Arc<dyn StorageBackend>,
}

impl KeyStore {
    /// Create in-memory storage
    pub fn memory() -> Self {
        Self::persistent(Arc::new(MemoryStorage::new()))
    }

    /// Create storage over any backend
    pub fn persistent(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn key_for(username: &str) -> Vec<u8> {
        format!("{PRIVATE_KEY_PREFIX}{username}").into_bytes()
    }

    /// Load the private key for `username`, if one was saved
    pub fn load(&self, username: &str) -> Result<Option<IdentityKeys>, KeyStoreError> {
        match self.backend.get(&Self::key_for(username))? {
            Some(bytes) => IdentityKeys::from_bytes(&bytes)
                .map(Some)
                .map_err(|source| KeyStoreError::Corrupt {
                    username: username.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Save the private key for `username`, replacing any previous one
    pub fn save(&self, username: &str, keys: &IdentityKeys) -> Result<(), KeyStoreError> {
        self.backend.put(&Self::key_for(username), &keys.to_bytes())?;
        self.backend.flush()?;
        Ok(())
    }

    pub fn remove(&self, username: &str) -> Result<(), KeyStoreError> {
        self.backend.remove(&Self::key_for(username))?;
        self.backend.flush()?;
        Ok(())
    }

    /// Usernames with a stored key
    pub fn usernames(&self) -> Result<Vec<String>, KeyStoreError> {
        Ok(self
            .backend
            .scan_prefix(PRIVATE_KEY_PREFIX.as_bytes())?
            .into_iter()
            .filter_map(|(key, _)| {
                String::from_utf8(key[PRIVATE_KEY_PREFIX.len()..].to_vec()).ok()
            })
            .collect())
    }
}
