// HTTP client for the identity service

use super::api::{PublicKeyBody, TokenRequest, TokenResponse};
use super::service::{Credentials, KeyLookupError, PublicKeyDirectory};
use crate::identity::parse_public_key_hex;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use x25519_dalek::PublicKey;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum IdentityClientError {
    #[error("Identity service rejected the request with status {status}")]
    Rejected { status: u16 },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<ureq::Error> for IdentityClientError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(status, _) => Self::Rejected { status },
            ureq::Error::Transport(transport) => Self::Transport(transport.to_string()),
        }
    }
}

/// Talks to the identity service over HTTP. Requests run on the blocking
/// pool so the async callers are never stalled.
#[derive(Clone)]
pub struct IdentityClient {
    agent: ureq::Agent,
    base_url: String,
}

impl IdentityClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn blocking<T, F>(&self, call: F) -> Result<T, IdentityClientError>
    where
        T: Send + 'static,
        F: FnOnce(&ureq::Agent, &str) -> Result<T, IdentityClientError> + Send + 'static,
    {
        let agent = self.agent.clone();
        let base_url = self.base_url.clone();
        tokio::task::spawn_blocking(move || call(&agent, &base_url))
            .await
            .map_err(|e| IdentityClientError::Transport(e.to_string()))?
    }

    pub async fn register(&self, credentials: &Credentials) -> Result<(), IdentityClientError> {
        let credentials = credentials.clone();
        self.blocking(move |agent, base| {
            agent
                .post(&format!("{base}/register"))
                .send_json(&credentials)?;
            Ok(())
        })
        .await
    }

    /// Exchange credentials for a session token
    pub async fn login(&self, credentials: &Credentials) -> Result<String, IdentityClientError> {
        let credentials = credentials.clone();
        self.blocking(move |agent, base| {
            let response: TokenResponse = agent
                .post(&format!("{base}/login"))
                .send_json(&credentials)?
                .into_json()
                .map_err(|e| IdentityClientError::InvalidResponse(e.to_string()))?;
            Ok(response.token)
        })
        .await
    }

    pub async fn refresh(&self, token: &str) -> Result<String, IdentityClientError> {
        let request = TokenRequest {
            token: token.to_string(),
        };
        self.blocking(move |agent, base| {
            let response: TokenResponse = agent
                .post(&format!("{base}/refresh"))
                .send_json(&request)?
                .into_json()
                .map_err(|e| IdentityClientError::InvalidResponse(e.to_string()))?;
            Ok(response.token)
        })
        .await
    }

    pub async fn publish_public_key(
        &self,
        token: &str,
        username: &str,
        key: &PublicKey,
    ) -> Result<(), IdentityClientError> {
        let authorization = format!("Bearer {token}");
        let path = format!("/users/{username}/pubkey");
        let body = PublicKeyBody {
            pubkey: hex::encode(key.as_bytes()),
        };
        self.blocking(move |agent, base| {
            agent
                .put(&format!("{base}{path}"))
                .set("Authorization", &authorization)
                .send_json(&body)?;
            Ok(())
        })
        .await
    }

    /// `Ok(None)` when the service has no key for `username`
    pub async fn fetch_public_key(
        &self,
        username: &str,
    ) -> Result<Option<PublicKey>, IdentityClientError> {
        let path = format!("/users/{username}/pubkey");
        self.blocking(move |agent, base| {
            let response = match agent.get(&format!("{base}{path}")).call() {
                Ok(response) => response,
                Err(ureq::Error::Status(404, _)) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let body: PublicKeyBody = response
                .into_json()
                .map_err(|e| IdentityClientError::InvalidResponse(e.to_string()))?;
            parse_public_key_hex(&body.pubkey)
                .map(Some)
                .map_err(|e| IdentityClientError::InvalidResponse(e.to_string()))
        })
        .await
    }
}

#[async_trait]
impl PublicKeyDirectory for IdentityClient {
    async fn public_key(&self, username: &str) -> Result<Option<PublicKey>, KeyLookupError> {
        self.fetch_public_key(username).await.map_err(|e| match e {
            IdentityClientError::InvalidResponse(_) => KeyLookupError::Malformed(username.to_string()),
            other => KeyLookupError::Unavailable(other.to_string()),
        })
    }
}
