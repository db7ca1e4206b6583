// Auth: accounts, session tokens and the public-key directory

mod client;
mod password;
mod service;
mod token;

pub mod api;

pub use client::{IdentityClient, IdentityClientError};
pub use password::{hash_password, verify_password, DEFAULT_PASSWORD_ROUNDS};
pub use service::{Credentials, UserDirectory};
pub use token::{Claims, TokenIssuer, DEFAULT_TOKEN_TTL};

#[cfg(test)]
pub use service::MockPublicKeyDirectory;
pub use service::{KeyLookupError, PublicKeyDirectory};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing token")]
    MissingToken,
    #[error("Malformed token")]
    MalformedToken,
    #[error("Invalid token signature")]
    BadSignature,
    #[error("Token expired")]
    Expired,
    #[error("Token secret must not be empty")]
    InvalidSecret,
    #[error("Invalid username or password")]
    InvalidCredentials,
    #[error("Invalid username: {0}")]
    InvalidUsername(String),
    #[error("User already exists: {0}")]
    UserExists(String),
    #[error("Unknown user: {0}")]
    UnknownUser(String),
    #[error("Token holder may not act for {0}")]
    Forbidden(String),
}

impl AuthError {
    /// Whether the error concerns the presented token rather than the request
    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            Self::MissingToken | Self::MalformedToken | Self::BadSignature | Self::Expired
        )
    }
}

/// Maps a bearer token to the identity it was issued for
pub trait TokenVerifier: Send + Sync {
    fn verify_token(&self, token: &str) -> Result<String, AuthError>;
}

impl TokenVerifier for TokenIssuer {
    fn verify_token(&self, token: &str) -> Result<String, AuthError> {
        self.verify(token).map(|claims| claims.username)
    }
}
