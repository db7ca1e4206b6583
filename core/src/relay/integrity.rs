// Message integrity: HMAC-SHA256 over canonical JSON plus a freshness window

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted age of a signed envelope
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(30);

const SIGNATURE_FIELD: &str = "signature";
const TIMESTAMP_FIELD: &str = "timestamp";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("Integrity secret must not be empty")]
    InvalidSecret,
    #[error("Envelope is not a JSON object")]
    NotAnObject,
    #[error("Envelope is not signed")]
    MissingSignature,
    #[error("Envelope has no timestamp")]
    MissingTimestamp,
    #[error("Envelope is stale ({age_ms} ms old)")]
    Stale { age_ms: u64 },
    #[error("Signature does not match")]
    BadSignature,
}

/// Signs and verifies envelopes with a secret shared by relay and clients
#[derive(Clone)]
pub struct IntegrityGuard {
    mac: HmacSha256,
    window: Duration,
}

impl IntegrityGuard {
    pub fn new(secret: &[u8]) -> Result<Self, IntegrityError> {
        if secret.is_empty() {
            return Err(IntegrityError::InvalidSecret);
        }
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| IntegrityError::InvalidSecret)?;
        Ok(Self {
            mac,
            window: FRESHNESS_WINDOW,
        })
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    fn keyed(&self, unsigned: &Value) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(canonical_json(unsigned).as_bytes());
        mac
    }

    /// Stamp and sign `envelope` in place
    pub fn sign(&self, envelope: &mut Value) -> Result<(), IntegrityError> {
        self.sign_at(envelope, crate::unix_millis())
    }

    pub fn sign_at(&self, envelope: &mut Value, now_ms: u64) -> Result<(), IntegrityError> {
        let object = envelope.as_object_mut().ok_or(IntegrityError::NotAnObject)?;
        object.remove(SIGNATURE_FIELD);
        object.insert(TIMESTAMP_FIELD.to_string(), Value::from(now_ms));

        let digest = self.keyed(envelope).finalize().into_bytes();
        if let Some(object) = envelope.as_object_mut() {
            object.insert(SIGNATURE_FIELD.to_string(), Value::from(hex::encode(digest)));
        }
        Ok(())
    }

    pub fn verify(&self, envelope: &Value) -> Result<(), IntegrityError> {
        self.verify_at(envelope, crate::unix_millis())
    }

    pub fn verify_at(&self, envelope: &Value, now_ms: u64) -> Result<(), IntegrityError> {
        let object = envelope.as_object().ok_or(IntegrityError::NotAnObject)?;

        let signature = object
            .get(SIGNATURE_FIELD)
            .and_then(Value::as_str)
            .ok_or(IntegrityError::MissingSignature)?;
        let timestamp = object
            .get(TIMESTAMP_FIELD)
            .and_then(Value::as_u64)
            .ok_or(IntegrityError::MissingTimestamp)?;

        // Timestamps ahead of our clock count as age zero.
        let age_ms = now_ms.saturating_sub(timestamp);
        if u128::from(age_ms) > self.window.as_millis() {
            return Err(IntegrityError::Stale { age_ms });
        }

        let signature = hex::decode(signature).map_err(|_| IntegrityError::BadSignature)?;
        let mut unsigned = object.clone();
        unsigned.remove(SIGNATURE_FIELD);
        self.keyed(&Value::Object(unsigned))
            .verify_slice(&signature)
            .map_err(|_| IntegrityError::BadSignature)
    }
}

/// Compact JSON with object keys sorted at every depth.
///
/// `serde_json::Map` is ordered by key unless the `preserve_order` feature
/// is enabled, so plain serialization is already canonical.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}
