//! Session layer: per-peer negotiation and the encrypted chat channel
//!
//! Every peer gets one [`negotiation::PeerSession`] running as its own task.
//! User actions and relay envelopes for that peer arrive on one input queue;
//! transport events arrive on a second. Each input is handled to completion
//! before the next one is looked at.

mod manager;
mod negotiation;
mod state;

pub use manager::SessionManager;
pub use state::NegotiationState;

use crate::auth::KeyLookupError;
use crate::crypto::CryptoError;
use crate::relay::SignalEnvelope;
use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Tunables for negotiation
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Abandon a call whose answer has not arrived in time
    pub answer_timeout: Option<Duration>,
    /// Discard early candidates beyond this many
    pub max_pending_candidates: Option<usize>,
}

/// What the presentation layer hears about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A peer's offer created a new session
    IncomingCall { peer: String },
    StateChanged { peer: String, state: NegotiationState },
    ChannelOpen { peer: String },
    MessageReceived { peer: String, text: String },
    /// Negotiation was abandoned; the session is closed
    CallFailed { peer: String, reason: String },
    /// A message could not be sent; the session stays up
    SendFailed { peer: String, reason: String },
    Closed { peer: String, reason: String },
}

/// One unit of work for a peer session
#[derive(Debug, Clone)]
pub enum SessionInput {
    StartCall,
    Signal(SignalEnvelope),
    SendText(String),
    Hangup,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Cannot move from {from} to {to}")]
    InvalidTransition {
        from: NegotiationState,
        to: NegotiationState,
    },
    #[error("No public key published for {0}")]
    UnknownPublicKey(String),
    #[error("Public key lookup failed: {0}")]
    KeyLookup(#[from] KeyLookupError),
    #[error("Key agreement failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("Envelope does not belong to this session: {0}")]
    UnexpectedEnvelope(String),
    #[error("More than {0} candidates arrived before the remote description")]
    CandidateQueueFull(usize),
    #[error("No answer within {0:?}")]
    AnswerTimeout(Duration),
    #[error("Channel is not open")]
    ChannelNotOpen,
    #[error("Send failed: {0}")]
    SendFailed(String),
}

impl NegotiationError {
    /// Fatal errors abandon the session; the rest only fail one input
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::ChannelNotOpen | Self::SendFailed(_) | Self::UnexpectedEnvelope(_)
        )
    }
}

/// Errors from [`SessionManager`] operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("A session with {0} is already active")]
    AlreadyActive(String),
    #[error("No active session with {0}")]
    NoSession(String),
    #[error("Cannot call yourself")]
    SelfCall,
}
