//! Relay client: one authenticated WebSocket to the signaling relay
//!
//! Outgoing envelopes are queued on an unbounded channel and written by a
//! background task; incoming text frames are parsed (and verified, when a
//! relay secret is configured) before they reach the session layer.

use super::integrity::IntegrityGuard;
use super::protocol::SignalEnvelope;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::Connector;

/// Relay client configuration
#[derive(Clone, Default)]
pub struct RelayClientConfig {
    /// `ws://` or `wss://` URL of the relay
    pub url: String,
    /// Skip certificate verification (self-signed development relays)
    pub accept_invalid_certs: bool,
    /// Sign outgoing and verify incoming envelopes
    pub integrity: Option<IntegrityGuard>,
}

impl RelayClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Relay client error types
#[derive(Debug, Error)]
pub enum RelayClientError {
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),
    #[error("Relay rejected the token")]
    Unauthorized,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("Relay connection closed")]
    Closed,
}

/// A live relay connection
pub struct RelayClient {
    outbound: mpsc::UnboundedSender<SignalEnvelope>,
    inbound: mpsc::UnboundedReceiver<SignalEnvelope>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayClient {
    /// Connect, presenting `token` in the `token` query parameter
    pub async fn connect(config: RelayClientConfig, token: &str) -> Result<Self, RelayClientError> {
        let url = url_with_token(&config.url, token)?;
        let request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayClientError::InvalidUrl(e.to_string()))?;

        let connector = if config.accept_invalid_certs {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| RelayClientError::Tls(e.to_string()))?;
            Some(Connector::NativeTls(tls))
        } else {
            None
        };

        let (ws, _response) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
                .await
                .map_err(|e| match e {
                    tungstenite::Error::Http(response)
                        if response.status() == StatusCode::UNAUTHORIZED =>
                    {
                        RelayClientError::Unauthorized
                    }
                    other => RelayClientError::ConnectionFailed(other.to_string()),
                })?;
        tracing::info!("🔗 Connected to relay {}", config.url);

        let (mut sink, mut frames) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SignalEnvelope>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SignalEnvelope>();

        let signer = config.integrity.clone();
        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let text = match encode_envelope(&envelope, signer.as_ref()) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Could not encode {} envelope: {}", envelope.kind(), e);
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let verifier = config.integrity;
        let reader = tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!("Relay read error: {}", e);
                        break;
                    }
                };
                match decode_envelope(&text, verifier.as_ref()) {
                    Ok(envelope) => {
                        if inbound_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(reason) => tracing::warn!("Dropped envelope from relay: {}", reason),
                }
            }
            tracing::info!("Relay connection closed");
        });

        Ok(Self {
            outbound: outbound_tx,
            inbound: inbound_rx,
            tasks: vec![writer, reader],
        })
    }

    /// Queue an envelope for the relay
    pub fn send(&self, envelope: SignalEnvelope) -> Result<(), RelayClientError> {
        self.outbound
            .send(envelope)
            .map_err(|_| RelayClientError::Closed)
    }

    /// Handle for queueing envelopes from other tasks
    pub fn sender(&self) -> mpsc::UnboundedSender<SignalEnvelope> {
        self.outbound.clone()
    }

    /// Next envelope from the relay; `None` once the connection is gone
    pub async fn recv(&mut self) -> Option<SignalEnvelope> {
        self.inbound.recv().await
    }

    /// Split into the outbound sender and the inbound receiver. The
    /// connection stays up while either half is alive.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<SignalEnvelope>,
        mpsc::UnboundedReceiver<SignalEnvelope>,
    ) {
        (self.outbound, self.inbound)
    }

    /// Tear the connection down without waiting for queued envelopes
    pub fn close(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Append the token as a query parameter, adding a root path when the URL
/// has none
pub fn url_with_token(url: &str, token: &str) -> Result<String, RelayClientError> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| RelayClientError::InvalidUrl(url.to_string()))?;
    if scheme != "ws" && scheme != "wss" {
        return Err(RelayClientError::InvalidUrl(url.to_string()));
    }

    let mut base = format!("{scheme}://{rest}");
    let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
    if !rest[authority_end..].starts_with('/') {
        base.insert(scheme.len() + 3 + authority_end, '/');
    }

    let separator = if base.contains('?') { '&' } else { '?' };
    Ok(format!("{base}{separator}token={token}"))
}

fn encode_envelope(
    envelope: &SignalEnvelope,
    signer: Option<&IntegrityGuard>,
) -> Result<String, String> {
    let mut value = envelope.to_value().map_err(|e| e.to_string())?;
    if let Some(signer) = signer {
        signer.sign(&mut value).map_err(|e| e.to_string())?;
    }
    Ok(value.to_string())
}

fn decode_envelope(text: &str, verifier: Option<&IntegrityGuard>) -> Result<SignalEnvelope, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    if let Some(verifier) = verifier {
        verifier.verify(&value).map_err(|e| e.to_string())?;
    }
    SignalEnvelope::from_value(value).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::protocol::SessionDescription;

    #[test]
    fn test_url_with_token() {
        assert_eq!(
            url_with_token("wss://relay.example:8080", "t").unwrap(),
            "wss://relay.example:8080/?token=t"
        );
        assert_eq!(
            url_with_token("ws://127.0.0.1:9000/", "t").unwrap(),
            "ws://127.0.0.1:9000/?token=t"
        );
        assert_eq!(
            url_with_token("ws://host/signal?room=1", "t").unwrap(),
            "ws://host/signal?room=1&token=t"
        );
        assert_eq!(
            url_with_token("ws://host?room=1", "t").unwrap(),
            "ws://host/?room=1&token=t"
        );
        assert!(url_with_token("http://host", "t").is_err());
        assert!(url_with_token("host:8080", "t").is_err());
    }

    #[test]
    fn test_encode_decode_signed() {
        let guard = IntegrityGuard::new(b"relay-secret").unwrap();
        let envelope = SignalEnvelope::offer("bob", "alice", SessionDescription::offer("v=0"));

        let text = encode_envelope(&envelope, Some(&guard)).unwrap();
        let decoded = decode_envelope(&text, Some(&guard)).unwrap();

        assert!(decoded.signature.is_some());
        assert!(decoded.timestamp.is_some());
        assert_eq!(decoded.body, envelope.body);
    }

    #[test]
    fn test_unsigned_rejected_when_verifying() {
        let guard = IntegrityGuard::new(b"relay-secret").unwrap();
        let envelope = SignalEnvelope::offer("bob", "alice", SessionDescription::offer("v=0"));

        let text = encode_envelope(&envelope, None).unwrap();
        assert!(decode_envelope(&text, Some(&guard)).is_err());
        assert!(decode_envelope(&text, None).is_ok());
    }

    #[tokio::test]
    async fn test_connect_unreachable_relay() {
        let result = RelayClient::connect(RelayClientConfig::new("ws://127.0.0.1:1"), "t").await;
        assert!(matches!(result, Err(RelayClientError::ConnectionFailed(_))));
    }
}
