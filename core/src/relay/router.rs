//! Signaling relay: forwards envelopes to their target's live connection
//!
//! The relay only looks at `type` and `target`; everything else is passed
//! through byte for byte. Nothing is queued and the sender never hears about
//! a drop.

use super::directory::RelayDirectory;
use super::integrity::{IntegrityError, IntegrityGuard};
use super::protocol::{routing_target, EnvelopeError};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Malformed(EnvelopeError),
    Integrity(IntegrityError),
    /// Target has no live connection
    RoutingMiss(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Forwarded { target: String },
    Dropped(DropReason),
}

/// Relay counters since startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub forwarded: u64,
    pub malformed: u64,
    pub integrity_failures: u64,
    pub routing_misses: u64,
}

#[derive(Default)]
struct Counters {
    forwarded: AtomicU64,
    malformed: AtomicU64,
    integrity_failures: AtomicU64,
    routing_misses: AtomicU64,
}

pub struct SignalingRelay {
    directory: Arc<RelayDirectory>,
    integrity: Option<IntegrityGuard>,
    counters: Counters,
}

impl SignalingRelay {
    pub fn new(directory: Arc<RelayDirectory>) -> Self {
        Self {
            directory,
            integrity: None,
            counters: Counters::default(),
        }
    }

    /// Require every envelope to carry a fresh, valid signature
    pub fn with_integrity(mut self, guard: IntegrityGuard) -> Self {
        self.integrity = Some(guard);
        self
    }

    pub fn directory(&self) -> &Arc<RelayDirectory> {
        &self.directory
    }

    pub fn verifies_signatures(&self) -> bool {
        self.integrity.is_some()
    }

    /// Route one text frame received from `from`
    pub fn route(&self, from: &str, raw: &str) -> RouteOutcome {
        let outcome = self.route_inner(raw);
        match &outcome {
            RouteOutcome::Forwarded { target } => {
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("📨 {} -> {}", from, target);
            }
            RouteOutcome::Dropped(reason) => {
                self.count_drop(reason);
                tracing::warn!("Dropped envelope from {}: {:?}", from, reason);
            }
        }
        outcome
    }

    /// Binary frames carry no envelope and are always dropped
    pub fn route_binary(&self, from: &str) -> RouteOutcome {
        let reason = DropReason::Malformed(EnvelopeError::Binary);
        self.count_drop(&reason);
        tracing::warn!("Dropped binary frame from {}", from);
        RouteOutcome::Dropped(reason)
    }

    fn route_inner(&self, raw: &str) -> RouteOutcome {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => return RouteOutcome::Dropped(DropReason::Malformed(EnvelopeError::Json(e.to_string()))),
        };

        let target = match routing_target(&value) {
            Ok(target) => target,
            Err(e) => return RouteOutcome::Dropped(DropReason::Malformed(e)),
        };

        if let Some(guard) = &self.integrity {
            if let Err(e) = guard.verify(&value) {
                return RouteOutcome::Dropped(DropReason::Integrity(e));
            }
        }

        match self.directory.lookup(target) {
            Some(connection) if connection.send(raw.to_string()) => RouteOutcome::Forwarded {
                target: target.to_string(),
            },
            _ => RouteOutcome::Dropped(DropReason::RoutingMiss(target.to_string())),
        }
    }

    fn count_drop(&self, reason: &DropReason) {
        let counter = match reason {
            DropReason::Malformed(_) => &self.counters.malformed,
            DropReason::Integrity(_) => &self.counters.integrity_failures,
            DropReason::RoutingMiss(_) => &self.counters.routing_misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            integrity_failures: self.counters.integrity_failures.load(Ordering::Relaxed),
            routing_misses: self.counters.routing_misses.load(Ordering::Relaxed),
        }
    }
}
