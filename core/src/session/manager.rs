// Session manager: one negotiation task per peer, envelope dispatch

use super::negotiation::{PeerSession, SessionShared};
use super::{SessionConfig, SessionError, SessionEvent, SessionInput};
use crate::auth::PublicKeyDirectory;
use crate::identity::IdentityKeys;
use crate::relay::{SignalBody, SignalEnvelope};
use crate::transport::TransportFactory;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Peers we hold unsolicited candidates for
const MAX_EARLY_PEERS: usize = 64;
/// Candidates kept per peer while waiting for its offer
const MAX_EARLY_PER_PEER: usize = 32;
/// Buffered candidates whose offer never came are discarded after this
const EARLY_CANDIDATE_TTL: Duration = Duration::from_secs(30);

/// Candidates that arrived before the offer they belong to
struct EarlyCandidates {
    first_seen: Instant,
    envelopes: Vec<SignalEnvelope>,
}

struct SessionHandle {
    inputs: mpsc::UnboundedSender<SessionInput>,
}

impl SessionHandle {
    fn is_live(&self) -> bool {
        !self.inputs.is_closed()
    }
}

/// Owns every peer session of one local user.
///
/// Outbound envelopes go to the `signals` sender given at construction;
/// events for the presentation layer come out of the receiver returned by
/// [`SessionManager::new`].
pub struct SessionManager {
    shared: SessionShared,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    early: Mutex<HashMap<String, EarlyCandidates>>,
}

impl SessionManager {
    pub fn new(
        local: impl Into<String>,
        keys: Arc<IdentityKeys>,
        directory: Arc<dyn PublicKeyDirectory>,
        factory: Arc<dyn TransportFactory>,
        config: SessionConfig,
        signals: mpsc::UnboundedSender<SignalEnvelope>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            shared: SessionShared {
                local: local.into(),
                keys,
                directory,
                factory,
                config,
                signals,
                events,
            },
            sessions: Mutex::new(HashMap::new()),
            early: Mutex::new(HashMap::new()),
        };
        (manager, events_rx)
    }

    pub fn local(&self) -> &str {
        &self.shared.local
    }

    /// Call `peer`: sends the offer through the relay
    pub fn start_call(&self, peer: &str) -> Result<(), SessionError> {
        if peer == self.shared.local {
            return Err(SessionError::SelfCall);
        }

        let mut sessions = self.sessions.lock();
        sessions.retain(|_, handle| handle.is_live());
        if sessions.contains_key(peer) {
            return Err(SessionError::AlreadyActive(peer.to_string()));
        }
        // Leftovers from an earlier attempt by the peer, not part of this call
        self.early.lock().remove(peer);

        let handle = self.spawn(peer);
        let _ = handle.inputs.send(SessionInput::StartCall);
        sessions.insert(peer.to_string(), handle);
        Ok(())
    }

    /// Queue a chat message for `peer`; the outcome arrives as an event
    pub fn send_text(&self, peer: &str, text: impl Into<String>) -> Result<(), SessionError> {
        self.deliver(peer, SessionInput::SendText(text.into()))
    }

    pub fn hangup(&self, peer: &str) -> Result<(), SessionError> {
        let handle = self
            .sessions
            .lock()
            .remove(peer)
            .ok_or_else(|| SessionError::NoSession(peer.to_string()))?;
        handle
            .inputs
            .send(SessionInput::Hangup)
            .map_err(|_| SessionError::NoSession(peer.to_string()))
    }

    /// Dispatch one envelope from the relay to the session it belongs to.
    ///
    /// An offer from an unknown peer starts a new session. Candidates that
    /// arrive before their offer are held in a small per-peer buffer and
    /// replayed once the offer shows up; they never start a session on
    /// their own. A stray answer is dropped.
    pub fn handle_signal(&self, envelope: SignalEnvelope) {
        if envelope.target != self.shared.local {
            tracing::warn!(
                "Envelope for {} delivered to {}; dropped",
                envelope.target,
                self.shared.local
            );
            return;
        }

        let mut sessions = self.sessions.lock();
        sessions.retain(|_, handle| handle.is_live());

        let peer = match envelope.sender() {
            Some(sender) => sender.to_string(),
            None if sessions.len() == 1 => match sessions.keys().next() {
                Some(peer) => peer.clone(),
                None => return,
            },
            None => {
                tracing::warn!("{} envelope without sender dropped", envelope.kind());
                return;
            }
        };
        if peer == self.shared.local {
            tracing::warn!("Envelope from self dropped");
            return;
        }

        if let Some(handle) = sessions.get(&peer) {
            let _ = handle.inputs.send(SessionInput::Signal(envelope));
            return;
        }

        match envelope.body {
            SignalBody::Offer { .. } => {
                tracing::info!("📞 Incoming call from {}", peer);
                let _ = self.shared.events.send(SessionEvent::IncomingCall { peer: peer.clone() });

                let early = self
                    .early
                    .lock()
                    .remove(&peer)
                    .filter(|held| held.first_seen.elapsed() < EARLY_CANDIDATE_TTL);
                let handle = self.spawn(&peer);
                let _ = handle.inputs.send(SessionInput::Signal(envelope));
                for candidate in early.into_iter().flat_map(|early| early.envelopes) {
                    let _ = handle.inputs.send(SessionInput::Signal(candidate));
                }
                sessions.insert(peer, handle);
            }
            SignalBody::IceCandidate { .. } => self.hold_early_candidate(peer, envelope),
            SignalBody::Answer { .. } => {
                tracing::warn!("Answer from {} with no call in progress; dropped", peer);
            }
        }
    }

    fn hold_early_candidate(&self, peer: String, envelope: SignalEnvelope) {
        let mut early = self.early.lock();
        let now = Instant::now();
        expire_early(&mut early, now);

        if !early.contains_key(&peer) && early.len() >= MAX_EARLY_PEERS {
            tracing::warn!("Too many peers with early candidates; dropped one from {}", peer);
            return;
        }
        let held = early.entry(peer.clone()).or_insert_with(|| {
            tracing::debug!("Early candidate from {}", peer);
            EarlyCandidates {
                first_seen: now,
                envelopes: Vec::new(),
            }
        });
        if held.envelopes.len() >= MAX_EARLY_PER_PEER {
            tracing::warn!("Early candidate buffer for {} full; dropped", peer);
            return;
        }
        held.envelopes.push(envelope);
    }

    /// Peers with candidates waiting for an offer
    #[cfg(test)]
    fn early_peer_count(&self) -> usize {
        let mut early = self.early.lock();
        expire_early(&mut early, Instant::now());
        early.len()
    }

    /// Peers with a live session, sorted
    pub fn active_peers(&self) -> Vec<String> {
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, handle| handle.is_live());
        let mut peers: Vec<String> = sessions.keys().cloned().collect();
        peers.sort();
        peers
    }

    fn deliver(&self, peer: &str, input: SessionInput) -> Result<(), SessionError> {
        let sessions = self.sessions.lock();
        let handle = sessions
            .get(peer)
            .filter(|handle| handle.is_live())
            .ok_or_else(|| SessionError::NoSession(peer.to_string()))?;
        handle
            .inputs
            .send(input)
            .map_err(|_| SessionError::NoSession(peer.to_string()))
    }

    fn spawn(&self, peer: &str) -> SessionHandle {
        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(peer, self.shared.clone());
        tokio::spawn(session.run(inputs_rx));
        SessionHandle { inputs }
    }
}

fn expire_early(early: &mut HashMap<String, EarlyCandidates>, now: Instant) {
    early.retain(|_, held| now.duration_since(held.first_seen) < EARLY_CANDIDATE_TTL);
}
