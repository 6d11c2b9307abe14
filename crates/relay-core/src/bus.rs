//! Fan-out bus.
//!
//! A bus delivers every published message to the local dispatcher of every
//! process, the publisher's own included, so local and remote messages share
//! one delivery path. Delivery is at-least-once and best-effort: a process
//! that misses a message catches up through replay when its clients
//! reconnect.

use crate::message::Message;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::trace;

/// Fan-out bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// The cross-process link is down. Local handlers were still invoked.
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    /// A hub link sent something that is not a valid frame.
    #[error("Protocol error: {0}")]
    Protocol(#[from] relay_protocol::ProtocolError),

    /// I/O error on a hub link.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A process-wide consumer of published messages.
pub trait EventHandler: Send + Sync {
    /// Called once per delivered message. Must not block.
    fn handle(&self, message: &Arc<Message>);
}

/// The set of handlers subscribed in this process.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl Dispatcher {
    /// Create a dispatcher with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        handlers.push(handler);
    }

    /// Invoke every handler with `message`.
    pub fn dispatch(&self, message: &Arc<Message>) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        trace!(id = message.id, handlers = handlers.len(), "Dispatching");
        for handler in handlers.iter() {
            handler.handle(message);
        }
    }

    /// Number of subscribed handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .map(|h| h.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }
}

/// Cross-process publish/subscribe.
#[async_trait]
pub trait FanoutBus: Send + Sync {
    /// Deliver `message` to every process, this one included.
    ///
    /// Returns once the message is handed to local handlers and enqueued for
    /// remote processes; it does not wait for remote delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Unavailable`] if remote processes cannot be
    /// reached. Local handlers have been invoked even then.
    async fn publish(&self, message: Message) -> Result<(), BusError>;

    /// Register a process-wide handler.
    fn subscribe(&self, handler: Arc<dyn EventHandler>);

    /// Bus name for logging.
    fn name(&self) -> &'static str;
}

/// Single-process bus: publishing dispatches in place.
#[derive(Default)]
pub struct LocalBus {
    dispatcher: Dispatcher,
}

impl LocalBus {
    /// Create a new local bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FanoutBus for LocalBus {
    async fn publish(&self, message: Message) -> Result<(), BusError> {
        self.dispatcher.dispatch(&Arc::new(message));
        Ok(())
    }

    fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        self.dispatcher.subscribe(handler);
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
