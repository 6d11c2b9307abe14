//! # relay-protocol
//!
//! Wire protocol definitions for the Relay message relay.
//!
//! The same length-prefixed MessagePack framing is used on two links:
//!
//! - **Client links** - `Connect` / `Connected` handshake carrying the
//!   client's last-seen offset, `Send` / `Ack` for inbound chat messages,
//!   `Message` for replayed and live log entries
//! - **Hub links** - `Join` and `Relay` frames exchanged between workers and
//!   the fan-out hub
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{Frame, codec};
//!
//! let frame = Frame::send(1, "hello", Some("tok-1".to_string()));
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{codes, Frame, FrameType};
pub use version::{Version, PROTOCOL_VERSION};
