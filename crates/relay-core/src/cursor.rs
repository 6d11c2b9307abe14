//! Recovery cursor for a connecting session.
//!
//! A session starts `CatchingUp`: it replays the log after the client's
//! last-seen offset, then goes `Live`. The live mailbox is attached before
//! replay starts, so anything published during the replay window waits in
//! the mailbox; the cursor's watermark drops the part of it the replay
//! already covered.
//!
//! The watermark is only ever raised by replayed rows. A replay pass reads a
//! snapshot of the log, and the log commits ids in order, so every id at or
//! below the highest replayed id was part of that pass. Live events above the
//! watermark are always let through, even when they arrive out of id order
//! from different processes.

use crate::message::MessageId;
use std::fmt;

/// Delivery phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Replaying the log; live events wait in the mailbox.
    CatchingUp,
    /// Replay done; live events are delivered as they arrive.
    Live,
}

impl fmt::Display for CursorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CursorState::CatchingUp => write!(f, "catching-up"),
            CursorState::Live => write!(f, "live"),
        }
    }
}

/// Per-session replay/live bookkeeping.
#[derive(Debug, Clone)]
pub struct RecoveryCursor {
    state: CursorState,
    /// Offset the replay pass starts after.
    start: MessageId,
    /// Highest id the client is known to hold.
    watermark: MessageId,
}

impl RecoveryCursor {
    /// Cursor that must replay everything after `last_seen` (0 if absent).
    #[must_use]
    pub fn catching_up(last_seen: Option<MessageId>) -> Self {
        let start = last_seen.unwrap_or(0);
        Self {
            state: CursorState::CatchingUp,
            start,
            watermark: start,
        }
    }

    /// Cursor for a client known to have missed nothing.
    #[must_use]
    pub fn live(last_seen: Option<MessageId>) -> Self {
        Self {
            state: CursorState::Live,
            ..Self::catching_up(last_seen)
        }
    }

    /// Pick the initial state for a connection.
    ///
    /// Only a transport-level recovery combined with a log head that the
    /// client already holds skips the replay. Without a known head the cursor
    /// always catches up.
    #[must_use]
    pub fn for_connect(recovered: bool, last_seen: Option<MessageId>, head: Option<MessageId>) -> Self {
        let caught_up = match (head, last_seen) {
            (Some(head), Some(seen)) => head <= seen,
            (Some(0), None) => true,
            _ => false,
        };
        if recovered && caught_up {
            Self::live(last_seen)
        } else {
            Self::catching_up(last_seen)
        }
    }

    /// Current phase.
    #[must_use]
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Check if the cursor is live.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state == CursorState::Live
    }

    /// Offset the replay pass starts after.
    #[must_use]
    pub fn replay_from(&self) -> MessageId {
        self.start
    }

    /// Highest id the client is known to hold.
    #[must_use]
    pub fn watermark(&self) -> MessageId {
        self.watermark
    }

    /// Decide whether a replayed row is delivered.
    ///
    /// Rows must arrive in ascending order; anything at or below the
    /// watermark is a repeat and is skipped.
    pub fn admit_replayed(&mut self, id: MessageId) -> bool {
        debug_assert!(!self.is_live(), "replayed row after going live");
        if id <= self.watermark {
            return false;
        }
        self.watermark = id;
        true
    }

    /// Mark the replay pass as fully drained.
    pub fn finish_replay(&mut self) {
        self.state = CursorState::Live;
    }

    /// Decide whether a live event is delivered.
    ///
    /// Events already covered by the replay (or by the client's own offset)
    /// are dropped.
    #[must_use]
    pub fn admit_live(&self, id: MessageId) -> bool {
        id > self.watermark
    }
}
