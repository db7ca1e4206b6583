// Tandem Core: Negotiation & Secure Messaging
//
// Two authenticated users, one relay to find each other, then a direct
// channel the relay never sees.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod identity;
pub mod relay;
pub mod session;
pub mod store;
pub mod transport;

use std::time::{SystemTime, UNIX_EPOCH};

pub use auth::{AuthError, Credentials, IdentityClient, PublicKeyDirectory, TokenIssuer, UserDirectory};
pub use crypto::{decrypt, derive_shared_key, encrypt, CryptoError, EncryptedMessage, SharedKey};
pub use identity::{IdentityKeys, KeyStore};
pub use relay::{
    IntegrityGuard, RelayClient, RelayDirectory, RelayServer, SignalBody, SignalEnvelope,
    SignalingRelay, TokenGuard,
};
pub use session::{
    NegotiationError, NegotiationState, SessionConfig, SessionError, SessionEvent, SessionManager,
};
pub use transport::{
    PeerTransport, TcpTransportConfig, TcpTransportFactory, TransportEvent, TransportFactory,
};

/// Current Unix time in milliseconds.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Current Unix time in seconds.
pub(crate) fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
