// In-memory identity service: accounts, tokens and published public keys

use super::password::{hash_password, verify_password, DEFAULT_PASSWORD_ROUNDS};
use super::token::TokenIssuer;
use super::{AuthError, TokenVerifier};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use x25519_dalek::PublicKey;

const MAX_USERNAME_LEN: usize = 64;

#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyLookupError {
    #[error("Identity service unavailable: {0}")]
    Unavailable(String),
    #[error("Malformed public key published for {0}")]
    Malformed(String),
}

/// Source of peers' long-term public keys
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PublicKeyDirectory: Send + Sync {
    /// `Ok(None)` when the user has not published a key
    async fn public_key(&self, username: &str) -> Result<Option<PublicKey>, KeyLookupError>;
}

struct UserRecord {
    password_hash: String,
    public_key: Option<PublicKey>,
}

/// Account registry backing the identity service
pub struct UserDirectory {
    users: RwLock<HashMap<String, UserRecord>>,
    tokens: TokenIssuer,
    password_rounds: u32,
}

impl UserDirectory {
    pub fn new(tokens: TokenIssuer) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            tokens,
            password_rounds: DEFAULT_PASSWORD_ROUNDS,
        }
    }

    pub fn with_password_rounds(mut self, rounds: u32) -> Self {
        self.password_rounds = rounds.max(1);
        self
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub fn register(&self, credentials: &Credentials) -> Result<(), AuthError> {
        validate_username(&credentials.username)?;
        if self.users.read().contains_key(&credentials.username) {
            return Err(AuthError::UserExists(credentials.username.clone()));
        }

        // Hash outside the lock, then re-check under it.
        let password_hash = hash_password(&credentials.password, self.password_rounds);

        let mut users = self.users.write();
        if users.contains_key(&credentials.username) {
            return Err(AuthError::UserExists(credentials.username.clone()));
        }
        users.insert(
            credentials.username.clone(),
            UserRecord {
                password_hash,
                public_key: None,
            },
        );
        tracing::info!("👤 Registered user {}", credentials.username);
        Ok(())
    }

    /// Check a password and issue a session token
    pub fn authenticate(&self, credentials: &Credentials) -> Result<String, AuthError> {
        let stored = self
            .users
            .read()
            .get(&credentials.username)
            .map(|record| record.password_hash.clone())
            .ok_or(AuthError::InvalidCredentials)?;

        if !verify_password(&credentials.password, &stored) {
            tracing::debug!("Failed login for {}", credentials.username);
            return Err(AuthError::InvalidCredentials);
        }
        Ok(self.tokens.issue(&credentials.username))
    }

    pub fn refresh(&self, token: &str) -> Result<String, AuthError> {
        self.tokens.refresh(token)
    }

    /// Publish `key` for `username`; the token must belong to that user
    pub fn publish_public_key(
        &self,
        token: &str,
        username: &str,
        key: PublicKey,
    ) -> Result<(), AuthError> {
        let holder = self.verify_token(token)?;
        if holder != username {
            return Err(AuthError::Forbidden(username.to_string()));
        }

        let mut users = self.users.write();
        let record = users
            .get_mut(username)
            .ok_or_else(|| AuthError::UnknownUser(username.to_string()))?;
        record.public_key = Some(key);
        tracing::info!("🔑 Published public key for {}", username);
        Ok(())
    }

    pub fn public_key_of(&self, username: &str) -> Option<PublicKey> {
        self.users
            .read()
            .get(username)
            .and_then(|record| record.public_key)
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }
}

impl TokenVerifier for UserDirectory {
    fn verify_token(&self, token: &str) -> Result<String, AuthError> {
        self.tokens.verify_token(token)
    }
}

#[async_trait]
impl PublicKeyDirectory for UserDirectory {
    async fn public_key(&self, username: &str) -> Result<Option<PublicKey>, KeyLookupError> {
        Ok(self.public_key_of(username))
    }
}

fn validate_username(username: &str) -> Result<(), AuthError> {
    let valid = !username.is_empty()
        && username.len() <= MAX_USERNAME_LEN
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(AuthError::InvalidUsername(username.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeys;

    fn directory() -> UserDirectory {
        UserDirectory::new(TokenIssuer::new(b"secret").unwrap()).with_password_rounds(1_000)
    }

    #[test]
    fn test_register_and_authenticate() {
        let users = directory();
        users.register(&Credentials::new("alice", "pw")).unwrap();

        let token = users.authenticate(&Credentials::new("alice", "pw")).unwrap();
        assert_eq!(users.verify_token(&token).unwrap(), "alice");
    }

    #[test]
    fn test_bad_credentials() {
        let users = directory();
        users.register(&Credentials::new("alice", "pw")).unwrap();

        assert_eq!(
            users.authenticate(&Credentials::new("alice", "nope")),
            Err(AuthError::InvalidCredentials)
        );
        assert_eq!(
            users.authenticate(&Credentials::new("nobody", "pw")),
            Err(AuthError::InvalidCredentials)
        );
    }

    #[test]
    fn test_duplicate_registration() {
        let users = directory();
        users.register(&Credentials::new("alice", "pw")).unwrap();

        assert_eq!(
            users.register(&Credentials::new("alice", "other")),
            Err(AuthError::UserExists("alice".to_string()))
        );
        assert_eq!(users.user_count(), 1);
    }

    #[test]
    fn test_invalid_usernames() {
        let users = directory();
        for name in ["", "has space", "slash/name", &"x".repeat(65)] {
            assert!(matches!(
                users.register(&Credentials::new(name, "pw")),
                Err(AuthError::InvalidUsername(_))
            ));
        }
    }

    #[test]
    fn test_publish_requires_matching_token() {
        let users = directory();
        users.register(&Credentials::new("alice", "pw")).unwrap();
        users.register(&Credentials::new("bob", "pw")).unwrap();
        let alice_token = users.authenticate(&Credentials::new("alice", "pw")).unwrap();
        let key = IdentityKeys::generate().public_key();

        assert_eq!(
            users.publish_public_key(&alice_token, "bob", key),
            Err(AuthError::Forbidden("bob".to_string()))
        );
        assert_eq!(
            users.publish_public_key("garbage", "alice", key),
            Err(AuthError::MalformedToken)
        );

        users.publish_public_key(&alice_token, "alice", key).unwrap();
        assert_eq!(users.public_key_of("alice").unwrap().as_bytes(), key.as_bytes());
        assert!(users.public_key_of("bob").is_none());
    }

    #[tokio::test]
    async fn test_directory_lookup() {
        let users = directory();
        users.register(&Credentials::new("alice", "pw")).unwrap();

        assert_eq!(users.public_key("alice").await, Ok(None));
        assert_eq!(users.public_key("nobody").await, Ok(None));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let debug = format!("{:?}", Credentials::new("alice", "hunter2"));
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }
}
