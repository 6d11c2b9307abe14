//! Message types for Relay.
//!
//! A [`Message`] is what the durable log hands back after an append and what
//! travels over the fan-out bus. The idempotency token stays in the log.

use relay_protocol::Frame;
use serde::{Deserialize, Serialize};

/// A log offset, assigned by the durable log on insert.
///
/// Offsets start at 1; offset 0 means "nothing seen yet".
pub type MessageId = u64;

/// An accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Offset assigned by the durable log.
    pub id: MessageId,
    /// Opaque text payload.
    pub content: String,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(id: MessageId, content: impl Into<String>) -> Self {
        Self {
            id,
            content: content.into(),
        }
    }

    /// The frame used to deliver this message to a client.
    #[must_use]
    pub fn to_client_frame(&self) -> Frame {
        Frame::message(self.id, self.content.clone())
    }

    /// The frame used to carry this message over a hub link.
    #[must_use]
    pub fn to_relay_frame(&self) -> Frame {
        Frame::relay(self.id, self.content.clone())
    }

    /// Extract a message from a `message` or `relay` frame.
    #[must_use]
    pub fn from_frame(frame: Frame) -> Option<Self> {
        match frame {
            Frame::Message { id, content } | Frame::Relay { id, content } => {
                Some(Self { id, content })
            }
            _ => None,
        }
    }
}
