//! Signaling protocol: envelopes relayed between peers
//!
//! Wire shape (JSON text frames):
//! `{ type, target, sender?, offer?, answer?, candidate?, signature?, timestamp? }`

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Envelope `type` values the relay will forward
pub const ROUTABLE_TYPES: [&str; 3] = ["offer", "answer", "ice-candidate"];

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A connectivity candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }
}

/// Envelope payload, tagged by `type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalBody {
    #[serde(rename = "offer")]
    Offer {
        sender: String,
        offer: SessionDescription,
    },
    #[serde(rename = "answer")]
    Answer {
        sender: String,
        answer: SessionDescription,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        candidate: IceCandidate,
    },
}

/// A signaling envelope as carried by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub target: String,
    #[serde(flatten)]
    pub body: SignalBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Unix milliseconds, set when signed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Invalid JSON: {0}")]
    Json(String),
    #[error("Envelope is not a JSON object")]
    NotAnObject,
    #[error("Unknown envelope type: {0}")]
    UnknownType(String),
    #[error("Envelope has no target")]
    MissingTarget,
    #[error("Invalid envelope: {0}")]
    Invalid(String),
    #[error("Binary frames are not accepted")]
    Binary,
}

impl SignalEnvelope {
    fn new(target: impl Into<String>, body: SignalBody) -> Self {
        Self {
            target: target.into(),
            body,
            signature: None,
            timestamp: None,
        }
    }

    pub fn offer(target: impl Into<String>, sender: impl Into<String>, offer: SessionDescription) -> Self {
        Self::new(
            target,
            SignalBody::Offer {
                sender: sender.into(),
                offer,
            },
        )
    }

    pub fn answer(
        target: impl Into<String>,
        sender: impl Into<String>,
        answer: SessionDescription,
    ) -> Self {
        Self::new(
            target,
            SignalBody::Answer {
                sender: sender.into(),
                answer,
            },
        )
    }

    pub fn ice_candidate(
        target: impl Into<String>,
        sender: impl Into<String>,
        candidate: IceCandidate,
    ) -> Self {
        Self::new(
            target,
            SignalBody::IceCandidate {
                sender: Some(sender.into()),
                candidate,
            },
        )
    }

    /// The `type` tag on the wire
    pub fn kind(&self) -> &'static str {
        match self.body {
            SignalBody::Offer { .. } => "offer",
            SignalBody::Answer { .. } => "answer",
            SignalBody::IceCandidate { .. } => "ice-candidate",
        }
    }

    pub fn sender(&self) -> Option<&str> {
        match &self.body {
            SignalBody::Offer { sender, .. } | SignalBody::Answer { sender, .. } => Some(sender),
            SignalBody::IceCandidate { sender, .. } => sender.as_deref(),
        }
    }

    pub fn to_value(&self) -> Result<Value, EnvelopeError> {
        serde_json::to_value(self).map_err(|e| EnvelopeError::Invalid(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Invalid(e.to_string()))
    }

    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        routing_target(&value)?;
        serde_json::from_value(value).map_err(|e| EnvelopeError::Invalid(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| EnvelopeError::Json(e.to_string()))?;
        Self::from_value(value)
    }
}

/// Check the fields the relay needs to forward a frame and return its target.
/// Only `type` and `target` are inspected; the payload is opaque to the relay.
pub fn routing_target(value: &Value) -> Result<&str, EnvelopeError> {
    let object = value.as_object().ok_or(EnvelopeError::NotAnObject)?;

    let kind = object.get("type").and_then(Value::as_str).unwrap_or_default();
    if !ROUTABLE_TYPES.contains(&kind) {
        return Err(EnvelopeError::UnknownType(kind.to_string()));
    }

    object
        .get("target")
        .and_then(Value::as_str)
        .filter(|target| !target.is_empty())
        .ok_or(EnvelopeError::MissingTarget)
}
