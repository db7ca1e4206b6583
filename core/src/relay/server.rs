//! Relay server: authenticated WebSocket endpoint for signaling
//!
//! Each accepted connection is authenticated during the upgrade, registered
//! in the directory, and then served by a reader loop plus a writer task fed
//! through an unbounded queue.

use super::directory::{RelayConnection, RelayDirectory};
use super::guard::TokenGuard;
use super::router::SignalingRelay;
use crate::auth::api::ErrorResponse as ErrorBody;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_native_tls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

pub const DEFAULT_RELAY_PORT: u16 = 8080;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    pub bind_addr: SocketAddr,
    /// Drop envelopes without a valid signature
    pub verify_signatures: bool,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_RELAY_PORT)),
            verify_signatures: false,
        }
    }
}

/// Relay server error types
#[derive(Debug, Error)]
pub enum RelayServerError {
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(String),
}

/// Build a TLS acceptor from PEM certificate and PKCS#8 key files
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, RelayServerError> {
    let cert = std::fs::read(cert_path)?;
    let key = std::fs::read(key_path)?;
    let identity = native_tls::Identity::from_pkcs8(&cert, &key)
        .map_err(|e| RelayServerError::Tls(e.to_string()))?;
    let acceptor =
        native_tls::TlsAcceptor::new(identity).map_err(|e| RelayServerError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(acceptor))
}

/// The relay server
pub struct RelayServer {
    listener: TcpListener,
    guard: TokenGuard,
    relay: Arc<SignalingRelay>,
    tls: Option<TlsAcceptor>,
}

impl RelayServer {
    /// Bind the listening socket. Pass `tls: None` only for local testing.
    pub async fn bind(
        addr: SocketAddr,
        guard: TokenGuard,
        relay: SignalingRelay,
        tls: Option<TlsAcceptor>,
    ) -> Result<Self, RelayServerError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            guard,
            relay: Arc::new(relay),
            tls,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn relay(&self) -> Arc<SignalingRelay> {
        self.relay.clone()
    }

    pub fn directory(&self) -> Arc<RelayDirectory> {
        self.relay.directory().clone()
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<(), RelayServerError> {
        tracing::info!(
            "📡 Relay listening on {} ({}, signatures {})",
            self.listener.local_addr()?,
            if self.tls.is_some() { "wss" } else { "ws" },
            if self.relay.verifies_signatures() { "required" } else { "optional" }
        );

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    continue;
                }
            };

            let guard = self.guard.clone();
            let relay = self.relay.clone();
            let tls = self.tls.clone();

            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => serve_connection(stream, peer_addr, guard, relay).await,
                        Err(e) => tracing::debug!("TLS handshake with {} failed: {}", peer_addr, e),
                    },
                    None => serve_connection(stream, peer_addr, guard, relay).await,
                }
            });
        }
    }
}

fn unauthorized(reason: &str) -> ErrorResponse {
    let body = serde_json::to_string(&ErrorBody::new(reason)).ok();
    let mut response = ErrorResponse::new(body);
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

async fn serve_connection<S>(
    stream: S,
    peer_addr: SocketAddr,
    guard: TokenGuard,
    relay: Arc<SignalingRelay>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut identity = None;
    let callback = |request: &Request, response: Response| match guard.authorize(request) {
        Ok(username) => {
            identity = Some(username);
            Ok(response)
        }
        Err(e) => {
            tracing::warn!("🚫 Rejected connection from {}: {}", peer_addr, e);
            Err(unauthorized(&e.to_string()))
        }
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!("WebSocket handshake with {} failed: {}", peer_addr, e);
            return;
        }
    };
    let Some(identity) = identity else {
        return;
    };

    let (mut sink, mut frames) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let connection = RelayConnection::new(identity.clone(), outbound_tx);

    let directory = relay.directory().clone();
    if let Some(previous) = directory.register(connection.clone()) {
        tracing::info!(
            "🔁 {} reconnected; replacing connection {}",
            identity,
            previous.id()
        );
    } else {
        tracing::info!("✅ {} connected from {}", identity, peer_addr);
    }

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                relay.route(&identity, &text);
            }
            Ok(Message::Binary(_)) => {
                relay.route_binary(&identity);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Read error from {}: {}", identity, e);
                break;
            }
        }
    }

    if directory.remove(&connection) {
        tracing::info!("👋 {} disconnected", identity);
    }
    writer.abort();
}
