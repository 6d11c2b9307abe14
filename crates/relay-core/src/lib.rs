//! # relay-core
//!
//! Reliable-delivery engine for the Relay message relay.
//!
//! Every accepted message is written exactly once to a durable log, fanned
//! out to every process, and replayable to reconnecting clients from their
//! last-seen offset.
//!
//! - **Log** - Append-only, token-deduplicated message log (SQLite backed)
//! - **Bus** - Cross-process fan-out, in-process or through a TCP hub
//! - **Registry** - Per-process map of attached connections
//! - **Cursor** - Replay-then-live recovery state per connection
//! - **Session** - Inbound append/publish/ack handling and outbound feed
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  append   ┌─────────────┐
//! │   Session   │──────────▶│ Durable Log │◀─── replay ───┐
//! └─────────────┘           └─────────────┘               │
//!        │ publish                                  ┌─────────────┐
//!        ▼                                          │ SessionFeed │
//! ┌─────────────┐  dispatch ┌─────────────┐ mailbox └─────────────┘
//! │ Fan-out Bus │──────────▶│  Registry   │────────────────▲
//! └─────────────┘           └─────────────┘
//! ```

pub mod bus;
pub mod cluster;
pub mod cursor;
pub mod log;
pub mod message;
pub mod registry;
pub mod session;
pub mod sqlite;

pub use bus::{BusError, Dispatcher, EventHandler, FanoutBus, LocalBus};
pub use cluster::{BusHub, ClusterBus, ClusterConfig, DEFAULT_LINK_QUEUE};
pub use cursor::{CursorState, RecoveryCursor};
pub use log::{AppendOutcome, DurableLog, LogError, ReplayStream};
pub use message::{Message, MessageId};
pub use registry::{ConnectionId, Registry, DEFAULT_MAILBOX_CAPACITY};
pub use session::{ClientSink, Handshake, Inbound, Relay, Session, SessionError, SessionFeed};
pub use sqlite::{LogConfig, SqliteLog};
