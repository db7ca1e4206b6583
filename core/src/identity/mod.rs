// Identity: long-term keys and their local storage

mod keys;
mod store;

pub use keys::{fingerprint, parse_public_key_hex, IdentityKeys, KeyError};
pub use store::{KeyStore, KeyStoreError};

/// Load the stored keys for `username`, generating and saving a fresh pair
/// on first use.
pub fn load_or_generate(store: &KeyStore, username: &str) -> Result<IdentityKeys, KeyStoreError> {
    if let Some(keys) = store.load(username)? {
        tracing::info!("🔑 Loaded existing identity for {}", username);
        return Ok(keys);
    }

    tracing::info!("🔑 Generating new identity for {}", username);
    let keys = IdentityKeys::generate();
    store.save(username, &keys)?;
    Ok(keys)
}
