//! The durable log contract.
//!
//! The log is the only source of truth for ordering and de-duplication.
//! Every process appends to the same log; uniqueness of idempotency tokens is
//! enforced by the storage layer itself, never by a read-then-write check.

use crate::message::{Message, MessageId};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;

/// Durable log errors.
#[derive(Debug, Error)]
pub enum LogError {
    /// The storage layer failed (I/O, locking, corruption).
    ///
    /// Retryable from the client's point of view.
    #[error("Storage failure: {0}")]
    Storage(String),

    /// A blocking storage task died before reporting back.
    #[error("Storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<rusqlite::Error> for LogError {
    fn from(e: rusqlite::Error) -> Self {
        LogError::Storage(e.to_string())
    }
}

/// Outcome of an append that reached the storage layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// A new row was written.
    Appended(Message),
    /// The idempotency token was already present; nothing was written.
    Duplicate,
}

/// Append-only, token-deduplicated message log.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Append a message.
    ///
    /// A `None` token opts out of de-duplication (at-most-once semantics for
    /// the sender).
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the storage layer fails. A repeated token is
    /// not an error; it is reported as [`AppendOutcome::Duplicate`].
    async fn append(&self, content: &str, token: Option<&str>) -> Result<AppendOutcome, LogError>;

    /// Stream every message with `id > offset`, ascending.
    ///
    /// The stream is lazy and finite. Calling this again starts a fresh pass.
    /// Dropping the stream abandons the pass and releases its resources.
    fn stream_after(&self, offset: MessageId) -> ReplayStream;

    /// The highest assigned offset, 0 for an empty log.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the storage layer fails.
    async fn head(&self) -> Result<MessageId, LogError>;
}

/// A lazy stream of replayed rows.
///
/// Rows are produced by a storage task into a bounded channel, so at most the
/// channel capacity is buffered in memory regardless of backlog size.
#[derive(Debug)]
pub struct ReplayStream {
    rows: mpsc::Receiver<Result<Message, LogError>>,
}

impl ReplayStream {
    /// Wrap the receiving end of a producer channel.
    #[must_use]
    pub fn new(rows: mpsc::Receiver<Result<Message, LogError>>) -> Self {
        Self { rows }
    }

    /// Build a stream from already materialized rows.
    #[must_use]
    pub fn from_rows(rows: Vec<Result<Message, LogError>>) -> Self {
        let (tx, rx) = mpsc::channel(rows.len().max(1));
        for row in rows {
            // Capacity covers every row.
            let _ = tx.try_send(row);
        }
        Self::new(rx)
    }
}

impl Stream for ReplayStream {
    type Item = Result<Message, LogError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rows.poll_recv(cx)
    }
}
