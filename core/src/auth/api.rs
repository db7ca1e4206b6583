//! JSON bodies exchanged with the identity service
//!
//! | Route                      | Request            | Response           |
//! |----------------------------|--------------------|--------------------|
//! | `POST /register`           | `Credentials`      | `StatusResponse`   |
//! | `POST /login`              | `Credentials`      | `TokenResponse`    |
//! | `POST /refresh`            | `TokenRequest`     | `TokenResponse`    |
//! | `GET  /users/{u}/pubkey`   |                    | `PublicKeyBody`    |
//! | `PUT  /users/{u}/pubkey`   | `PublicKeyBody`    | `StatusResponse`   |
//!
//! Errors come back as `ErrorResponse` with a non-2xx status.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

/// Hex-encoded X25519 public key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyBody {
    pub pubkey: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl ToString) -> Self {
        Self {
            error: error.to_string(),
        }
    }
}
