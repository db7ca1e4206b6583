// Transport module: the direct peer-to-peer channel

pub mod tcp;

use crate::relay::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

pub use tcp::{TcpTransport, TcpTransportConfig, TcpTransportFactory};

/// Which side of the negotiation a transport is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The caller: creates the offer
    Controlling,
    /// The callee: answers
    Controlled,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Controlling => write!(f, "controlling"),
            Role::Controlled => write!(f, "controlled"),
        }
    }
}

/// Events from a transport to the session that owns it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local candidate to hand to the peer through the relay
    LocalCandidate(IceCandidate),
    /// The direct channel is ready for data
    Open,
    /// One message from the peer
    Message(Vec<u8>),
    /// The channel closed or failed
    Closed { reason: String },
}

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),
    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),
    #[error("Remote description not set")]
    NoRemoteDescription,
    #[error("Channel is not open")]
    NotOpen,
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
    #[error("Transport error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// The direct channel between two peers, driven by the negotiation layer
#[async_trait]
pub trait PeerTransport: Send {
    /// Create and apply the local offer
    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError>;

    /// Create and apply the local answer; the remote offer must be set
    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), TransportError>;

    /// Apply a remote candidate; the remote description must be set
    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError>;

    async fn send(&mut self, data: Vec<u8>) -> Result<(), TransportError>;

    async fn close(&mut self);
}

/// Creates one transport per negotiation
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        role: Role,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn PeerTransport>;
}
