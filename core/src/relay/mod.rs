//! Signaling relay
//!
//! Clients present a bearer token when they connect, the relay keeps one
//! live connection per identity, and envelopes are forwarded to their
//! `target` without being interpreted.

pub mod client;
pub mod directory;
pub mod guard;
pub mod integrity;
pub mod protocol;
pub mod router;
pub mod server;

pub use client::{RelayClient, RelayClientConfig, RelayClientError};
pub use directory::{RelayConnection, RelayDirectory};
pub use guard::TokenGuard;
pub use integrity::{IntegrityError, IntegrityGuard, FRESHNESS_WINDOW};
pub use protocol::{EnvelopeError, IceCandidate, SdpType, SessionDescription, SignalBody, SignalEnvelope};
pub use router::{DropReason, RelayStats, RouteOutcome, SignalingRelay};
pub use server::{load_tls_acceptor, RelayServer, RelayServerConfig, RelayServerError};
