//! Per-process connection registry.
//!
//! The registry maps every locally attached connection to its mailbox. It is
//! the only shared mutable state in a process: the fan-out bus hands each
//! published message to the registry, which pushes it into every mailbox.
//!
//! Mailboxes are bounded. A connection that falls a full mailbox behind is
//! dropped from the registry, which ends its feed once the buffered messages
//! are drained; the client reconnects and replays from its offset.

use crate::bus::EventHandler;
use crate::message::Message;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

/// Default number of undelivered messages a mailbox holds.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

/// Counter mixed into generated ids so two connections in the same
/// nanosecond still differ.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-local connection identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Receiving end of a connection's mailbox.
pub type Mailbox = mpsc::Receiver<Arc<Message>>;

/// Registry of locally attached connections.
#[derive(Debug)]
pub struct Registry {
    connections: DashMap<ConnectionId, mpsc::Sender<Arc<Message>>>,
    capacity: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAILBOX_CAPACITY)
    }
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry whose mailboxes hold `capacity` messages.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Register a connection and return its mailbox.
    ///
    /// Registering an id twice replaces the older mailbox, which then ends.
    pub fn register(&self, id: ConnectionId) -> Mailbox {
        let (tx, rx) = mpsc::channel(self.capacity);
        debug!(connection = %id, "Connection registered");
        self.connections.insert(id, tx);
        rx
    }

    /// Remove a connection. Returns `true` if it was registered.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let removed = self.connections.remove(id).is_some();
        if removed {
            debug!(connection = %id, "Connection unregistered");
        }
        removed
    }

    /// Deliver a message to one connection.
    ///
    /// Returns `false` if the connection is unknown or its mailbox is closed
    /// or full. A full mailbox is dropped.
    pub fn emit(&self, id: &ConnectionId, message: Arc<Message>) -> bool {
        let Some(tx) = self.connections.get(id).map(|tx| tx.clone()) else {
            return false;
        };
        if offer(id, &tx, message) {
            return true;
        }
        self.connections
            .remove_if(id, |_, current| current.same_channel(&tx));
        false
    }

    /// Deliver a message to every connection in this process.
    ///
    /// Returns the number of mailboxes that accepted it. Mailboxes that are
    /// closed or full are dropped.
    pub fn broadcast_all(&self, message: Arc<Message>) -> usize {
        let mut delivered = 0;
        self.connections.retain(|id, tx| {
            let open = offer(id, tx, Arc::clone(&message));
            delivered += usize::from(open);
            open
        });
        trace!(id = message.id, recipients = delivered, "Broadcast to local connections");
        delivered
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Push into one mailbox without waiting. `false` means the mailbox must go.
fn offer(id: &ConnectionId, tx: &mpsc::Sender<Arc<Message>>, message: Arc<Message>) -> bool {
    match tx.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(message)) => {
            warn!(connection = %id, id = message.id, "Mailbox full; dropping connection feed");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

impl EventHandler for Registry {
    fn handle(&self, message: &Arc<Message>) {
        self.broadcast_all(Arc::clone(message));
    }
}
