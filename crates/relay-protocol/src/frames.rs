//! Frame types for the Relay protocol.
//!
//! Frames are the fundamental unit of communication in Relay, both between
//! clients and a worker and between workers and the fan-out hub.
//! Each frame is serialized using MessagePack for efficient binary encoding.

use serde::{Deserialize, Serialize};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Send = 0x03,
    Ack = 0x04,
    Message = 0x05,
    Error = 0x06,
    Ping = 0x07,
    Pong = 0x08,
    Join = 0x10,
    Relay = 0x11,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::Send),
            0x04 => Ok(FrameType::Ack),
            0x05 => Ok(FrameType::Message),
            0x06 => Ok(FrameType::Error),
            0x07 => Ok(FrameType::Ping),
            0x08 => Ok(FrameType::Pong),
            0x10 => Ok(FrameType::Join),
            0x11 => Ok(FrameType::Relay),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Well-known error codes carried in [`Frame::Error`].
pub mod codes {
    /// The client spoke an incompatible protocol version.
    pub const UNSUPPORTED_VERSION: u16 = 1001;
    /// The first frame on a connection was not `connect`.
    pub const HANDSHAKE_REQUIRED: u16 = 1002;
    /// Replay from the log failed; reconnect to retry.
    pub const REPLAY_FAILED: u16 = 1003;
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initial connection handshake sent by the client.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol version (major).
        version: u8,
        /// Highest message id the client has already received.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<u64>,
        /// Connection id of the client's previous connection, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume: Option<String>,
    },

    /// Connection established response.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
        /// Whether the transport resumed a previous connection.
        recovered: bool,
    },

    /// A chat message submitted by the client.
    #[serde(rename = "send")]
    Send {
        /// Request ID echoed back in the acknowledgment.
        id: u64,
        /// Message content.
        content: String,
        /// Client-generated idempotency token.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Acknowledgment of a `send` request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// A log entry delivered to the client.
    #[serde(rename = "message")]
    Message {
        /// Log offset assigned on append.
        id: u64,
        /// Message content.
        content: String,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// A worker link announcing itself to the hub.
    #[serde(rename = "join")]
    Join {
        /// Worker name, used for logging only.
        worker: String,
    },

    /// A published event travelling over the fan-out bus.
    #[serde(rename = "relay")]
    Relay {
        /// Log offset of the event.
        id: u64,
        /// Message content.
        content: String,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Send { .. } => FrameType::Send,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Message { .. } => FrameType::Message,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Join { .. } => FrameType::Join,
            Frame::Relay { .. } => FrameType::Relay,
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, offset: Option<u64>, resume: Option<String>) -> Self {
        Frame::Connect {
            version,
            offset,
            resume,
        }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        version: u8,
        heartbeat: u32,
        recovered: bool,
    ) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
            recovered,
        }
    }

    /// Create a new Send frame.
    #[must_use]
    pub fn send(id: u64, content: impl Into<String>, token: Option<String>) -> Self {
        Frame::Send {
            id,
            content: content.into(),
            token,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Message frame.
    #[must_use]
    pub fn message(id: u64, content: impl Into<String>) -> Self {
        Frame::Message {
            id,
            content: content.into(),
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Join frame.
    #[must_use]
    pub fn join(worker: impl Into<String>) -> Self {
        Frame::Join {
            worker: worker.into(),
        }
    }

    /// Create a new Relay frame.
    #[must_use]
    pub fn relay(id: u64, content: impl Into<String>) -> Self {
        Frame::Relay {
            id,
            content: content.into(),
        }
    }
}
