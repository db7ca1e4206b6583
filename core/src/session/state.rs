// Negotiation states and the transitions allowed between them

use std::fmt;

/// Where one peer negotiation stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    /// Caller: offer sent, waiting for the answer
    LocalOfferSent,
    /// Callee: offer applied, answer not yet sent
    RemoteOfferReceived,
    /// Both descriptions applied, waiting for the transport
    DescriptionsExchanged,
    ChannelOpen,
    Closed,
}

impl NegotiationState {
    /// The single transition check every state change goes through
    pub fn can_transition_to(self, next: NegotiationState) -> bool {
        use NegotiationState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, LocalOfferSent) | (Idle, RemoteOfferReceived) => true,
            (LocalOfferSent, DescriptionsExchanged) => true,
            (RemoteOfferReceived, DescriptionsExchanged) => true,
            (DescriptionsExchanged, ChannelOpen) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == NegotiationState::Closed
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::LocalOfferSent => "offer sent",
            NegotiationState::RemoteOfferReceived => "offer received",
            NegotiationState::DescriptionsExchanged => "connecting",
            NegotiationState::ChannelOpen => "open",
            NegotiationState::Closed => "closed",
        };
        f.write_str(name)
    }
}
