// Relay directory: which live connection speaks for which identity

use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Handle to one authenticated relay connection. Cloning shares the
/// outbound queue; identity comparisons use the connection id.
#[derive(Debug, Clone)]
pub struct RelayConnection {
    id: Uuid,
    identity: String,
    outbound: mpsc::UnboundedSender<String>,
}

impl RelayConnection {
    pub fn new(identity: impl Into<String>, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity: identity.into(),
            outbound,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Queue a text frame for this connection's writer.
    /// Returns false once the writer has gone away.
    pub fn send(&self, text: String) -> bool {
        self.outbound.send(text).is_ok()
    }
}

/// At most one live connection per identity; the latest registration wins
#[derive(Default)]
pub struct RelayDirectory {
    entries: RwLock<HashMap<String, RelayConnection>>,
}

impl RelayDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection` for its identity, returning the entry it replaced.
    /// The replaced connection is left open.
    pub fn register(&self, connection: RelayConnection) -> Option<RelayConnection> {
        self.entries
            .write()
            .insert(connection.identity.clone(), connection)
    }

    pub fn lookup(&self, identity: &str) -> Option<RelayConnection> {
        self.entries.read().get(identity).cloned()
    }

    /// Remove the entry for `connection`'s identity only if it is still this
    /// exact connection. Returns whether anything was removed.
    pub fn remove(&self, connection: &RelayConnection) -> bool {
        let mut entries = self.entries.write();
        match entries.get(&connection.identity) {
            Some(current) if current.id == connection.id => {
                entries.remove(&connection.identity);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.entries.read().keys().cloned().collect();
        identities.sort();
        identities
    }
}
