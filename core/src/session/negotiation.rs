// Per-peer negotiation: descriptions, candidate buffering, key derivation,
// and the encrypted channel once the transport opens

use super::{NegotiationError, NegotiationState, SessionConfig, SessionEvent, SessionInput};
use crate::auth::PublicKeyDirectory;
use crate::crypto::{derive_shared_key, ChannelFrame, EncryptedMessage, SharedKey};
use crate::identity::IdentityKeys;
use crate::relay::{IceCandidate, SessionDescription, SignalBody, SignalEnvelope};
use crate::transport::{PeerTransport, Role, TransportEvent, TransportFactory};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Dependencies shared by every session of one local user
#[derive(Clone)]
pub(crate) struct SessionShared {
    pub local: String,
    pub keys: Arc<IdentityKeys>,
    pub directory: Arc<dyn PublicKeyDirectory>,
    pub factory: Arc<dyn TransportFactory>,
    pub config: SessionConfig,
    pub signals: mpsc::UnboundedSender<SignalEnvelope>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

/// Negotiation context for one remote peer
pub(crate) struct PeerSession {
    peer: String,
    shared: SessionShared,
    state: NegotiationState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_candidates: VecDeque<IceCandidate>,
    shared_key: Option<SharedKey>,
    transport: Option<Box<dyn PeerTransport>>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    answer_deadline: Option<Instant>,
}

impl PeerSession {
    pub fn new(peer: impl Into<String>, shared: SessionShared) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        Self {
            peer: peer.into(),
            shared,
            state: NegotiationState::Idle,
            local_description: None,
            remote_description: None,
            pending_candidates: VecDeque::new(),
            shared_key: None,
            transport: None,
            transport_tx,
            transport_rx,
            answer_deadline: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    #[cfg(test)]
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    #[cfg(test)]
    pub fn has_shared_key(&self) -> bool {
        self.shared_key.is_some()
    }

    /// Drive the session until it closes or its input queue is dropped
    pub async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<SessionInput>) {
        loop {
            let deadline = self.answer_deadline;
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(input) => {
                        let result = self.handle(input).await;
                        self.settle(result).await;
                    }
                    None => {
                        self.close("session dropped").await;
                    }
                },
                Some(event) = self.transport_rx.recv() => {
                    let result = self.handle_transport(event).await;
                    self.settle(result).await;
                }
                _ = wait_until(deadline) => {
                    let timeout = self.shared.config.answer_timeout.unwrap_or_default();
                    self.settle(Err(NegotiationError::AnswerTimeout(timeout))).await;
                }
            }

            if self.state.is_terminal() {
                break;
            }
        }
        tracing::debug!("Session with {} finished", self.peer);
    }

    /// Apply the outcome of one input: fatal errors end the call
    pub async fn settle(&mut self, result: Result<(), NegotiationError>) {
        let Err(error) = result else {
            return;
        };
        let reason = error.to_string();
        if let NegotiationError::UnexpectedEnvelope(_) = error {
            tracing::warn!("Dropped envelope: {}", reason);
            return;
        }
        if error.is_fatal() {
            tracing::warn!("❌ Call with {} failed: {}", self.peer, reason);
            self.emit(SessionEvent::CallFailed {
                peer: self.peer.clone(),
                reason: reason.clone(),
            });
            self.close(&reason).await;
        } else {
            tracing::warn!("Could not send to {}: {}", self.peer, reason);
            self.emit(SessionEvent::SendFailed {
                peer: self.peer.clone(),
                reason,
            });
        }
    }

    pub async fn handle(&mut self, input: SessionInput) -> Result<(), NegotiationError> {
        match input {
            SessionInput::StartCall => self.start_call().await,
            SessionInput::Signal(envelope) => self.handle_signal(envelope).await,
            SessionInput::SendText(text) => self.send_text(&text).await,
            SessionInput::Hangup => {
                self.close("hangup").await;
                Ok(())
            }
        }
    }

    pub async fn handle_transport(&mut self, event: TransportEvent) -> Result<(), NegotiationError> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.send_signal(SignalEnvelope::ice_candidate(
                    self.peer.clone(),
                    self.shared.local.clone(),
                    candidate,
                ));
                Ok(())
            }
            TransportEvent::Open => {
                self.transition(NegotiationState::ChannelOpen)?;
                self.answer_deadline = None;
                tracing::info!("🔒 Secure channel open with {}", self.peer);
                self.emit(SessionEvent::ChannelOpen {
                    peer: self.peer.clone(),
                });
                Ok(())
            }
            TransportEvent::Message(bytes) => {
                self.receive(&bytes);
                Ok(())
            }
            TransportEvent::Closed { reason } => {
                self.close(&reason).await;
                Ok(())
            }
        }
    }

    fn transition(&mut self, next: NegotiationState) -> Result<(), NegotiationError> {
        if !self.state.can_transition_to(next) {
            return Err(NegotiationError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!("{}: {} -> {}", self.peer, self.state, next);
        self.state = next;
        self.emit(SessionEvent::StateChanged {
            peer: self.peer.clone(),
            state: next,
        });
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.shared.events.send(event);
    }

    fn send_signal(&self, envelope: SignalEnvelope) {
        if self.shared.signals.send(envelope).is_err() {
            tracing::warn!("Relay connection gone; envelope for {} dropped", self.peer);
        }
    }

    fn transport(&mut self, role: Role) -> &mut Box<dyn PeerTransport> {
        let factory = self.shared.factory.clone();
        let events = self.transport_tx.clone();
        self.transport
            .get_or_insert_with(|| factory.create(role, events))
    }

    async fn derive_key(&mut self) -> Result<(), NegotiationError> {
        let peer_public = self
            .shared
            .directory
            .public_key(&self.peer)
            .await?
            .ok_or_else(|| NegotiationError::UnknownPublicKey(self.peer.clone()))?;
        self.shared_key = Some(derive_shared_key(self.shared.keys.secret(), &peer_public)?);
        Ok(())
    }

    async fn start_call(&mut self) -> Result<(), NegotiationError> {
        if !self.state.can_transition_to(NegotiationState::LocalOfferSent) {
            return Err(NegotiationError::InvalidTransition {
                from: self.state,
                to: NegotiationState::LocalOfferSent,
            });
        }

        let offer = self.transport(Role::Controlling).create_offer().await?;
        self.local_description = Some(offer.clone());
        self.transition(NegotiationState::LocalOfferSent)?;
        tracing::info!("📞 Calling {}", self.peer);
        self.send_signal(SignalEnvelope::offer(
            self.peer.clone(),
            self.shared.local.clone(),
            offer,
        ));

        if let Some(timeout) = self.shared.config.answer_timeout {
            self.answer_deadline = Some(Instant::now() + timeout);
        }
        Ok(())
    }

    async fn handle_signal(&mut self, envelope: SignalEnvelope) -> Result<(), NegotiationError> {
        if let Some(sender) = envelope.sender() {
            if sender != self.peer {
                return Err(NegotiationError::UnexpectedEnvelope(format!(
                    "{} from {} in session with {}",
                    envelope.kind(),
                    sender,
                    self.peer
                )));
            }
        }

        match envelope.body {
            SignalBody::Offer { offer, .. } => self.accept_offer(offer).await,
            SignalBody::Answer { answer, .. } => self.accept_answer(answer).await,
            SignalBody::IceCandidate { candidate, .. } => self.add_candidate(candidate).await,
        }
    }

    async fn accept_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        if self.state != NegotiationState::Idle {
            tracing::warn!("Ignoring offer from {} while {}", self.peer, self.state);
            return Ok(());
        }

        self.derive_key().await?;
        self.transport(Role::Controlled)
            .set_remote_description(&offer)
            .await?;
        self.remote_description = Some(offer);
        self.transition(NegotiationState::RemoteOfferReceived)?;
        self.drain_candidates().await?;

        let answer = self.transport(Role::Controlled).create_answer().await?;
        self.local_description = Some(answer.clone());
        self.transition(NegotiationState::DescriptionsExchanged)?;
        self.send_signal(SignalEnvelope::answer(
            self.peer.clone(),
            self.shared.local.clone(),
            answer,
        ));
        Ok(())
    }

    async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        if self.remote_description.is_some() {
            tracing::debug!("Duplicate answer from {} ignored", self.peer);
            return Ok(());
        }
        if self.state != NegotiationState::LocalOfferSent {
            tracing::warn!("Ignoring answer from {} while {}", self.peer, self.state);
            return Ok(());
        }

        self.derive_key().await?;
        self.transport(Role::Controlling)
            .set_remote_description(&answer)
            .await?;
        self.remote_description = Some(answer);
        self.answer_deadline = None;
        self.transition(NegotiationState::DescriptionsExchanged)?;
        self.drain_candidates().await
    }

    async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if self.remote_description.is_some() {
            if let Some(transport) = self.transport.as_mut() {
                transport.add_ice_candidate(&candidate).await?;
            }
            return Ok(());
        }

        if let Some(cap) = self.shared.config.max_pending_candidates {
            if self.pending_candidates.len() >= cap {
                return Err(NegotiationError::CandidateQueueFull(cap));
            }
        }
        self.pending_candidates.push_back(candidate);
        Ok(())
    }

    /// Apply buffered candidates in arrival order, leaving the queue empty
    async fn drain_candidates(&mut self) -> Result<(), NegotiationError> {
        let Some(transport) = self.transport.as_mut() else {
            return Ok(());
        };
        while let Some(candidate) = self.pending_candidates.pop_front() {
            transport.add_ice_candidate(&candidate).await?;
        }
        Ok(())
    }

    async fn send_text(&mut self, text: &str) -> Result<(), NegotiationError> {
        if self.state != NegotiationState::ChannelOpen {
            return Err(NegotiationError::ChannelNotOpen);
        }
        let (Some(key), Some(transport)) = (self.shared_key.as_ref(), self.transport.as_mut()) else {
            return Err(NegotiationError::ChannelNotOpen);
        };

        let frame = EncryptedMessage::seal(key, &self.shared.local, text.as_bytes())
            .and_then(|message| ChannelFrame::EncryptedMessage(message).to_bytes())
            .map_err(|e| NegotiationError::SendFailed(e.to_string()))?;
        transport
            .send(frame)
            .await
            .map_err(|e| NegotiationError::SendFailed(e.to_string()))
    }

    /// Decrypt one channel frame; anything that fails is logged and dropped
    fn receive(&self, bytes: &[u8]) {
        let Some(key) = self.shared_key.as_ref() else {
            tracing::warn!("Message from {} before key agreement; discarded", self.peer);
            return;
        };

        let message = match ChannelFrame::from_bytes(bytes) {
            Ok(ChannelFrame::EncryptedMessage(message)) => message,
            Err(e) => {
                tracing::warn!("Unreadable frame from {}: {}", self.peer, e);
                return;
            }
        };
        if message.sender != self.peer {
            tracing::warn!(
                "Frame from {} claims sender {}; discarded",
                self.peer,
                message.sender
            );
            return;
        }

        match message.open(key) {
            Ok(plaintext) => self.emit(SessionEvent::MessageReceived {
                peer: self.peer.clone(),
                text: String::from_utf8_lossy(&plaintext).into_owned(),
            }),
            Err(e) => tracing::warn!("Discarded message from {}: {}", self.peer, e),
        }
    }

    pub async fn close(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.pending_candidates.clear();
        self.shared_key = None;
        self.answer_deadline = None;
        let _ = self.transition(NegotiationState::Closed);
        tracing::info!("Session with {} closed: {}", self.peer, reason);
        self.emit(SessionEvent::Closed {
            peer: self.peer.clone(),
            reason: reason.to_string(),
        });
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::{KeyLookupError, MockPublicKeyDirectory};
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use x25519_dalek::PublicKey;

    /// What a recording transport was asked to do
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Created(Role),
        CreateOffer,
        CreateAnswer,
        SetRemote(String),
        AddCandidate(String),
        Send(Vec<u8>),
        Close,
    }

    /// Transport double that records calls and lets the test raise events
    #[derive(Clone, Default)]
    pub struct RecordingFactory {
        pub calls: Arc<Mutex<Vec<Call>>>,
        pub events: Arc<Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>>,
        pub fail_candidates: bool,
    }

    impl RecordingFactory {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        pub fn raise(&self, event: TransportEvent) {
            if let Some(events) = self.events.lock().as_ref() {
                let _ = events.send(event);
            }
        }
    }

    struct RecordingTransport {
        calls: Arc<Mutex<Vec<Call>>>,
        events: mpsc::UnboundedSender<TransportEvent>,
        fail_candidates: bool,
        open: bool,
    }

    impl TransportFactory for RecordingFactory {
        fn create(
            &self,
            role: Role,
            events: mpsc::UnboundedSender<TransportEvent>,
        ) -> Box<dyn PeerTransport> {
            self.calls.lock().push(Call::Created(role));
            *self.events.lock() = Some(events.clone());
            Box::new(RecordingTransport {
                calls: self.calls.clone(),
                events,
                fail_candidates: self.fail_candidates,
                open: true,
            })
        }
    }

    #[async_trait]
    impl PeerTransport for RecordingTransport {
        async fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
            self.calls.lock().push(Call::CreateOffer);
            let _ = self
                .events
                .send(TransportEvent::LocalCandidate(IceCandidate::new("local-offer-candidate")));
            Ok(SessionDescription::offer("offer-sdp"))
        }

        async fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
            self.calls.lock().push(Call::CreateAnswer);
            Ok(SessionDescription::answer("answer-sdp"))
        }

        async fn set_remote_description(
            &mut self,
            description: &SessionDescription,
        ) -> Result<(), TransportError> {
            self.calls.lock().push(Call::SetRemote(description.sdp.clone()));
            Ok(())
        }

        async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError> {
            if self.fail_candidates {
                return Err(TransportError::InvalidCandidate(candidate.candidate.clone()));
            }
            self.calls.lock().push(Call::AddCandidate(candidate.candidate.clone()));
            Ok(())
        }

        async fn send(&mut self, data: Vec<u8>) -> Result<(), TransportError> {
            if !self.open {
                return Err(TransportError::NotOpen);
            }
            self.calls.lock().push(Call::Send(data));
            Ok(())
        }

        async fn close(&mut self) {
            self.open = false;
            self.calls.lock().push(Call::Close);
        }
    }

    struct Harness {
        session: PeerSession,
        factory: RecordingFactory,
        signals: mpsc::UnboundedReceiver<SignalEnvelope>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        keys: Arc<IdentityKeys>,
    }

    impl Harness {
        fn drain_signals(&mut self) -> Vec<SignalEnvelope> {
            let mut out = Vec::new();
            while let Ok(envelope) = self.signals.try_recv() {
                out.push(envelope);
            }
            out
        }

        fn drain_events(&mut self) -> Vec<SessionEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        /// Deliver queued transport events the way the run loop would
        async fn pump_transport(&mut self) {
            while let Ok(event) = self.session.transport_rx.try_recv() {
                let result = self.session.handle_transport(event).await;
                self.session.settle(result).await;
            }
        }

        async fn input(&mut self, input: SessionInput) {
            let result = self.session.handle(input).await;
            self.session.settle(result).await;
        }
    }

    fn directory_with(key: Option<PublicKey>) -> MockPublicKeyDirectory {
        let mut directory = MockPublicKeyDirectory::new();
        directory
            .expect_public_key()
            .returning(move |_| Ok(key));
        directory
    }

    fn harness(local: &str, peer: &str, directory: MockPublicKeyDirectory, config: SessionConfig) -> Harness {
        harness_with(local, peer, directory, config, RecordingFactory::default())
    }

    fn harness_with(
        local: &str,
        peer: &str,
        directory: MockPublicKeyDirectory,
        config: SessionConfig,
        factory: RecordingFactory,
    ) -> Harness {
        let (signals_tx, signals) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let keys = Arc::new(IdentityKeys::generate());
        let shared = SessionShared {
            local: local.to_string(),
            keys: keys.clone(),
            directory: Arc::new(directory),
            factory: Arc::new(factory.clone()),
            config,
            signals: signals_tx,
            events: events_tx,
        };
        Harness {
            session: PeerSession::new(peer, shared),
            factory,
            signals,
            events,
            keys,
        }
    }

    fn peer_key() -> PublicKey {
        IdentityKeys::generate().public_key()
    }

    fn candidate(from: &str, name: &str) -> SessionInput {
        SessionInput::Signal(SignalEnvelope::ice_candidate("me", from, IceCandidate::new(name)))
    }

    #[tokio::test]
    async fn test_caller_flow() {
        let mut h = harness("alice", "bob", directory_with(Some(peer_key())), SessionConfig::default());

        h.input(SessionInput::StartCall).await;
        assert_eq!(h.session.state(), NegotiationState::LocalOfferSent);

        let sent = h.drain_signals();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, "bob");
        assert_eq!(sent[0].sender(), Some("alice"));
        assert!(matches!(sent[0].body, SignalBody::Offer { .. }));

        // Local candidate gathered during offer creation goes out with a sender
        h.pump_transport().await;
        let sent = h.drain_signals();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), "ice-candidate");
        assert_eq!(sent[0].sender(), Some("alice"));

        h.input(SessionInput::Signal(SignalEnvelope::answer(
            "alice",
            "bob",
            SessionDescription::answer("answer-sdp"),
        )))
        .await;
        assert_eq!(h.session.state(), NegotiationState::DescriptionsExchanged);
        assert!(h.session.has_shared_key());

        h.factory.raise(TransportEvent::Open);
        h.pump_transport().await;
        assert_eq!(h.session.state(), NegotiationState::ChannelOpen);
        assert!(h
            .drain_events()
            .contains(&SessionEvent::ChannelOpen { peer: "bob".to_string() }));
    }

    #[tokio::test]
    async fn test_callee_flow_answers_offer_sender() {
        let mut h = harness("bob", "alice", directory_with(Some(peer_key())), SessionConfig::default());

        h.input(SessionInput::Signal(SignalEnvelope::offer(
            "bob",
            "alice",
            SessionDescription::offer("offer-sdp"),
        )))
        .await;

        assert_eq!(h.session.state(), NegotiationState::DescriptionsExchanged);
        assert!(h.session.has_shared_key());
        assert_eq!(
            h.factory.calls(),
            vec![
                Call::Created(Role::Controlled),
                Call::SetRemote("offer-sdp".to_string()),
                Call::CreateAnswer,
            ]
        );

        let sent = h.drain_signals();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, "alice");
        assert_eq!(sent[0].sender(), Some("bob"));
        assert!(matches!(sent[0].body, SignalBody::Answer { .. }));

        let states: Vec<NegotiationState> = h
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                NegotiationState::RemoteOfferReceived,
                NegotiationState::DescriptionsExchanged
            ]
        );
    }

    #[tokio::test]
    async fn test_early_candidates_applied_in_order_after_remote_description() {
        let mut h = harness("bob", "alice", directory_with(Some(peer_key())), SessionConfig::default());

        for name in ["c1", "c2", "c3"] {
            h.input(candidate("alice", name)).await;
        }
        assert_eq!(h.session.pending_candidates(), 3);
        assert!(h.factory.calls().is_empty());

        h.input(SessionInput::Signal(SignalEnvelope::offer(
            "bob",
            "alice",
            SessionDescription::offer("offer-sdp"),
        )))
        .await;
        assert_eq!(h.session.pending_candidates(), 0);

        h.input(candidate("alice", "c4")).await;

        let calls = h.factory.calls();
        let set_remote = calls
            .iter()
            .position(|c| *c == Call::SetRemote("offer-sdp".to_string()))
            .unwrap();
        let applied: Vec<(usize, String)> = calls
            .iter()
            .enumerate()
            .filter_map(|(i, c)| match c {
                Call::AddCandidate(name) => Some((i, name.clone())),
                _ => None,
            })
            .collect();

        assert_eq!(
            applied.iter().map(|(_, n)| n.as_str()).collect::<Vec<_>>(),
            vec!["c1", "c2", "c3", "c4"]
        );
        assert!(applied.iter().all(|(i, _)| *i > set_remote));
    }

    #[tokio::test]
    async fn test_duplicate_answer_ignored() {
        let mut directory = MockPublicKeyDirectory::new();
        let key = peer_key();
        directory
            .expect_public_key()
            .times(1)
            .returning(move |_| Ok(Some(key)));
        let mut h = harness("alice", "bob", directory, SessionConfig::default());

        h.input(SessionInput::StartCall).await;
        let answer = SessionInput::Signal(SignalEnvelope::answer(
            "alice",
            "bob",
            SessionDescription::answer("answer-sdp"),
        ));
        h.input(answer.clone()).await;
        h.input(answer).await;

        assert_eq!(h.session.state(), NegotiationState::DescriptionsExchanged);
        let set_remote_count = h
            .factory
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::SetRemote(_)))
            .count();
        assert_eq!(set_remote_count, 1);
        assert!(!h
            .drain_events()
            .iter()
            .any(|e| matches!(e, SessionEvent::CallFailed { .. })));
    }

    #[tokio::test]
    async fn test_unknown_public_key_fails_call() {
        let mut h = harness("bob", "alice", directory_with(None), SessionConfig::default());

        h.input(SessionInput::Signal(SignalEnvelope::offer(
            "bob",
            "alice",
            SessionDescription::offer("offer-sdp"),
        )))
        .await;

        assert_eq!(h.session.state(), NegotiationState::Closed);
        assert!(h.drain_signals().is_empty());
        let events = h.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::CallFailed { peer, reason } if peer == "alice" && reason.contains("No public key")
        )));
    }

    #[tokio::test]
    async fn test_key_lookup_failure_fails_call() {
        let mut directory = MockPublicKeyDirectory::new();
        directory
            .expect_public_key()
            .returning(|_| Err(KeyLookupError::Unavailable("down".to_string())));
        let mut h = harness("alice", "bob", directory, SessionConfig::default());

        h.input(SessionInput::StartCall).await;
        h.input(SessionInput::Signal(SignalEnvelope::answer(
            "alice",
            "bob",
            SessionDescription::answer("answer-sdp"),
        )))
        .await;

        assert_eq!(h.session.state(), NegotiationState::Closed);
        assert!(h.factory.calls().contains(&Call::Close));
    }

    #[tokio::test]
    async fn test_candidate_failure_fails_call() {
        let factory = RecordingFactory {
            fail_candidates: true,
            ..Default::default()
        };
        let mut h = harness_with(
            "bob",
            "alice",
            directory_with(Some(peer_key())),
            SessionConfig::default(),
            factory,
        );

        h.input(candidate("alice", "bad")).await;
        h.input(SessionInput::Signal(SignalEnvelope::offer(
            "bob",
            "alice",
            SessionDescription::offer("offer-sdp"),
        )))
        .await;

        assert_eq!(h.session.state(), NegotiationState::Closed);
    }

    #[tokio::test]
    async fn test_send_before_open_is_not_fatal() {
        let mut h = harness("alice", "bob", directory_with(Some(peer_key())), SessionConfig::default());
        h.input(SessionInput::StartCall).await;
        h.input(SessionInput::SendText("too early".to_string())).await;

        assert_eq!(h.session.state(), NegotiationState::LocalOfferSent);
        assert!(h.drain_events().iter().any(|e| matches!(e, SessionEvent::SendFailed { .. })));
    }

    #[tokio::test]
    async fn test_messages_roundtrip_between_two_sessions() {
        let mut alice = harness("alice", "bob", MockPublicKeyDirectory::new(), SessionConfig::default());
        let mut bob = harness("bob", "alice", MockPublicKeyDirectory::new(), SessionConfig::default());

        let bob_public = bob.keys.public_key();
        let alice_public = alice.keys.public_key();
        let mut alice_dir = MockPublicKeyDirectory::new();
        alice_dir.expect_public_key().returning(move |_| Ok(Some(bob_public)));
        let mut bob_dir = MockPublicKeyDirectory::new();
        bob_dir.expect_public_key().returning(move |_| Ok(Some(alice_public)));
        alice.session.shared.directory = Arc::new(alice_dir);
        bob.session.shared.directory = Arc::new(bob_dir);

        alice.input(SessionInput::StartCall).await;
        let offer = alice.drain_signals().remove(0);
        bob.input(SessionInput::Signal(offer)).await;
        let answer = bob.drain_signals().remove(0);
        alice.input(SessionInput::Signal(answer)).await;

        alice.factory.raise(TransportEvent::Open);
        bob.factory.raise(TransportEvent::Open);
        alice.pump_transport().await;
        bob.pump_transport().await;

        alice.input(SessionInput::SendText("hi bob".to_string())).await;
        let wire = alice
            .factory
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::Send(bytes) => Some(bytes),
                _ => None,
            })
            .unwrap();
        assert!(!String::from_utf8_lossy(&wire).contains("hi bob"));

        bob.drain_events();
        bob.factory.raise(TransportEvent::Message(wire.clone()));
        bob.pump_transport().await;
        assert!(bob.drain_events().contains(&SessionEvent::MessageReceived {
            peer: "alice".to_string(),
            text: "hi bob".to_string(),
        }));

        // A tampered frame is discarded without closing the session
        let mut tampered: serde_json::Value = serde_json::from_slice(&wire).unwrap();
        let first = tampered["ciphertext"][0].as_u64().unwrap();
        tampered["ciphertext"][0] = serde_json::json!((first + 1) % 256);
        bob.factory
            .raise(TransportEvent::Message(serde_json::to_vec(&tampered).unwrap()));
        bob.pump_transport().await;
        assert!(!bob
            .drain_events()
            .iter()
            .any(|e| matches!(e, SessionEvent::MessageReceived { .. })));
        assert_eq!(bob.session.state(), NegotiationState::ChannelOpen);
    }

    #[tokio::test]
    async fn test_transport_close_closes_session() {
        let mut h = harness("alice", "bob", directory_with(Some(peer_key())), SessionConfig::default());
        h.input(SessionInput::StartCall).await;

        h.factory.raise(TransportEvent::Closed {
            reason: "reset".to_string(),
        });
        h.pump_transport().await;

        assert_eq!(h.session.state(), NegotiationState::Closed);
        assert!(h.drain_events().contains(&SessionEvent::Closed {
            peer: "bob".to_string(),
            reason: "reset".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_candidate_cap_fails_negotiation() {
        let config = SessionConfig {
            max_pending_candidates: Some(2),
            ..Default::default()
        };
        let mut h = harness("alice", "bob", directory_with(Some(peer_key())), config);
        h.input(SessionInput::StartCall).await;

        for name in ["c1", "c2"] {
            h.input(candidate("bob", name)).await;
        }
        assert_eq!(h.session.pending_candidates(), 2);
        assert_eq!(h.session.state(), NegotiationState::LocalOfferSent);

        h.input(candidate("bob", "c3")).await;
        assert_eq!(h.session.state(), NegotiationState::Closed);
        assert_eq!(h.session.pending_candidates(), 0);

        let events = h.drain_events();
        assert!(events.contains(&SessionEvent::CallFailed {
            peer: "bob".to_string(),
            reason: NegotiationError::CandidateQueueFull(2).to_string(),
        }));
        assert!(h.factory.calls().contains(&Call::Close));
    }

    #[tokio::test]
    async fn test_envelope_from_wrong_peer_rejected() {
        let mut h = harness("bob", "alice", directory_with(Some(peer_key())), SessionConfig::default());
        let result = h
            .session
            .handle(SessionInput::Signal(SignalEnvelope::offer(
                "bob",
                "mallory",
                SessionDescription::offer("offer-sdp"),
            )))
            .await;

        assert!(matches!(result, Err(NegotiationError::UnexpectedEnvelope(_))));

        h.session.settle(result).await;
        assert_eq!(h.session.state(), NegotiationState::Idle);
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_timeout_abandons_call() {
        let config = SessionConfig {
            answer_timeout: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        let h = harness("alice", "bob", directory_with(Some(peer_key())), config);
        let Harness {
            session,
            mut events,
            ..
        } = h;

        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(session.run(inputs_rx));
        inputs_tx.send(SessionInput::StartCall).unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        task.await.unwrap();

        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::CallFailed { reason, .. } = event {
                failed = reason.contains("No answer");
            }
        }
        assert!(failed);
    }
}
