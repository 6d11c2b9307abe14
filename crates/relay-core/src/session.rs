//! Connection sessions.
//!
//! [`Relay`] ties one process's durable log, fan-out bus, and connection
//! registry together. Attaching a connection yields two halves:
//!
//! - [`Session`] handles inbound chat messages (append, publish, ack)
//! - [`SessionFeed`] owns the mailbox and recovery cursor and produces the
//!   outbound stream: replay first, then live events
//!
//! The halves are separate so a connection loop can wait on the feed while
//! handling inbound frames through the session.

use crate::bus::{BusError, FanoutBus};
use crate::cursor::{CursorState, RecoveryCursor};
use crate::log::{AppendOutcome, DurableLog, LogError};
use crate::message::{Message, MessageId};
use crate::registry::{ConnectionId, Mailbox, Registry, DEFAULT_MAILBOX_CAPACITY};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Replay from the log failed part way; the session is not live.
    #[error("Replay failed: {0}")]
    Replay(#[source] LogError),

    /// The client could not be written to.
    #[error("Emit failed: {0}")]
    Emit(String),

    /// The client closed the connection.
    #[error("Connection closed")]
    Closed,
}

/// Outbound capability of one client connection.
#[async_trait]
pub trait ClientSink: Send {
    /// Deliver a message to the client.
    async fn emit(&mut self, message: &Message) -> Result<(), SessionError>;
}

/// What the transport knows about a new connection.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Process-local connection id.
    pub connection_id: ConnectionId,
    /// The transport resumed a previous connection without loss.
    pub recovered: bool,
    /// Highest id the client claims to hold.
    pub last_seen_offset: Option<MessageId>,
}

impl Handshake {
    /// A fresh (not recovered) connection.
    #[must_use]
    pub fn new(connection_id: ConnectionId, last_seen_offset: Option<MessageId>) -> Self {
        Self {
            connection_id,
            recovered: false,
            last_seen_offset,
        }
    }

    /// Mark the connection as recovered by the transport.
    #[must_use]
    pub fn recovered(mut self, recovered: bool) -> Self {
        self.recovered = recovered;
        self
    }
}

/// Result of handling one inbound chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Appended and published; the sender was acked.
    ///
    /// `broadcast` is `false` if the bus only reached this process.
    Accepted { id: MessageId, broadcast: bool },
    /// Already in the log; the sender was acked, nothing was published.
    Duplicate,
    /// Storage failed; no ack, the client will retry with the same token.
    Withheld,
}

/// A process's reliable-delivery engine.
#[derive(Clone)]
pub struct Relay {
    log: Arc<dyn DurableLog>,
    bus: Arc<dyn FanoutBus>,
    registry: Arc<Registry>,
}

impl Relay {
    /// Build the engine and subscribe its registry to the bus.
    #[must_use]
    pub fn new(log: Arc<dyn DurableLog>, bus: Arc<dyn FanoutBus>) -> Self {
        Self::with_mailbox_capacity(log, bus, DEFAULT_MAILBOX_CAPACITY)
    }

    /// Like [`Relay::new`], with mailboxes holding `capacity` live messages.
    ///
    /// A session that falls further behind has its live feed ended.
    #[must_use]
    pub fn with_mailbox_capacity(
        log: Arc<dyn DurableLog>,
        bus: Arc<dyn FanoutBus>,
        capacity: usize,
    ) -> Self {
        let registry = Arc::new(Registry::with_capacity(capacity));
        bus.subscribe(registry.clone());
        debug!(bus = bus.name(), "Relay engine ready");
        Self { log, bus, registry }
    }

    /// The durable log.
    #[must_use]
    pub fn log(&self) -> &Arc<dyn DurableLog> {
        &self.log
    }

    /// The local connection registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Attach a connection.
    ///
    /// The mailbox is registered before anything else so no message
    /// published from here on can be missed by the session.
    pub async fn attach(&self, handshake: Handshake) -> (Session, SessionFeed) {
        let mailbox = self.registry.register(handshake.connection_id.clone());

        let head = if handshake.recovered {
            match self.log.head().await {
                Ok(head) => Some(head),
                Err(e) => {
                    warn!(connection = %handshake.connection_id, error = %e, "Head lookup failed; replaying");
                    None
                }
            }
        } else {
            None
        };
        let cursor =
            RecoveryCursor::for_connect(handshake.recovered, handshake.last_seen_offset, head);

        debug!(
            connection = %handshake.connection_id,
            recovered = handshake.recovered,
            offset = cursor.replay_from(),
            state = %cursor.state(),
            "Session attached"
        );

        let session = Session {
            id: handshake.connection_id,
            relay: self.clone(),
        };
        let feed = SessionFeed {
            log: Arc::clone(&self.log),
            cursor,
            mailbox,
        };
        (session, feed)
    }
}

/// Inbound half of an attached connection.
///
/// Dropping it unregisters the connection, which ends its feed.
pub struct Session {
    id: ConnectionId,
    relay: Relay,
}

impl Session {
    /// The connection id.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Handle a chat message from the client.
    ///
    /// `ack` is called at most once: after the publish was initiated for a
    /// new message, or right away for a duplicate. It is not called when
    /// storage fails.
    pub async fn on_client_message<A>(&self, content: &str, token: Option<&str>, ack: A) -> Inbound
    where
        A: FnOnce() + Send,
    {
        match self.relay.log.append(content, token).await {
            Ok(AppendOutcome::Appended(message)) => {
                let id = message.id;
                let broadcast = match self.relay.bus.publish(message).await {
                    Ok(()) => true,
                    Err(e @ BusError::Unavailable(_)) => {
                        warn!(connection = %self.id, id, error = %e, "Bus unavailable; delivered locally only");
                        false
                    }
                    Err(e) => {
                        warn!(connection = %self.id, id, error = %e, "Publish failed");
                        false
                    }
                };
                ack();
                trace!(connection = %self.id, id, "Message accepted");
                Inbound::Accepted { id, broadcast }
            }
            Ok(AppendOutcome::Duplicate) => {
                ack();
                debug!(connection = %self.id, "Duplicate token acknowledged");
                Inbound::Duplicate
            }
            Err(e) => {
                warn!(connection = %self.id, error = %e, "Append failed; withholding ack");
                Inbound::Withheld
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.relay.registry.unregister(&self.id);
    }
}

/// Outbound half of an attached connection.
pub struct SessionFeed {
    log: Arc<dyn DurableLog>,
    cursor: RecoveryCursor,
    mailbox: Mailbox,
}

impl SessionFeed {
    /// Current phase.
    #[must_use]
    pub fn state(&self) -> CursorState {
        self.cursor.state()
    }

    /// The recovery cursor.
    #[must_use]
    pub fn cursor(&self) -> &RecoveryCursor {
        &self.cursor
    }

    /// Replay the log tail to the client and go live.
    ///
    /// Returns the number of replayed messages. On error the feed stays
    /// `CatchingUp`; the connection should be closed so the client
    /// reconnects. Dropping the returned future abandons the replay.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Replay`] if the log fails mid-stream, or
    /// whatever the sink reports if the client goes away.
    pub async fn catch_up<S>(&mut self, sink: &mut S) -> Result<usize, SessionError>
    where
        S: ClientSink + ?Sized,
    {
        if self.cursor.is_live() {
            return Ok(0);
        }

        let mut rows = self.log.stream_after(self.cursor.replay_from());
        let mut replayed = 0;
        while let Some(row) = rows.next().await {
            let message = row.map_err(SessionError::Replay)?;
            if self.cursor.admit_replayed(message.id) {
                sink.emit(&message).await?;
                replayed += 1;
            }
        }

        self.cursor.finish_replay();
        debug!(replayed, watermark = self.cursor.watermark(), "Replay complete");
        Ok(replayed)
    }

    /// Wait for the next live message the client has not seen.
    ///
    /// Returns `None` once the connection is unregistered.
    pub async fn next_live(&mut self) -> Option<Arc<Message>> {
        debug_assert!(self.cursor.is_live(), "next_live before catch_up");
        loop {
            let message = self.mailbox.recv().await?;
            if self.cursor.admit_live(message.id) {
                return Some(message);
            }
            trace!(id = message.id, "Dropped live event covered by replay");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::log::ReplayStream;
    use crate::sqlite::SqliteLog;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Sink that records what a client would see.
    #[derive(Default)]
    struct Client {
        seen: Vec<(String, MessageId)>,
    }

    #[async_trait]
    impl ClientSink for Client {
        async fn emit(&mut self, message: &Message) -> Result<(), SessionError> {
            self.seen.push((message.content.clone(), message.id));
            Ok(())
        }
    }

    /// Sink whose connection drops after `limit` messages.
    struct Flaky {
        limit: usize,
        sent: usize,
    }

    #[async_trait]
    impl ClientSink for Flaky {
        async fn emit(&mut self, _message: &Message) -> Result<(), SessionError> {
            if self.sent == self.limit {
                return Err(SessionError::Emit("connection dropped".into()));
            }
            self.sent += 1;
            Ok(())
        }
    }

    /// Log that fails every append and breaks replay after one row.
    struct BrokenLog;

    #[async_trait]
    impl DurableLog for BrokenLog {
        async fn append(&self, _: &str, _: Option<&str>) -> Result<AppendOutcome, LogError> {
            Err(LogError::Storage("disk full".into()))
        }

        fn stream_after(&self, _offset: MessageId) -> ReplayStream {
            ReplayStream::from_rows(vec![
                Ok(Message::new(1, "partial")),
                Err(LogError::Storage("read error".into())),
            ])
        }

        async fn head(&self) -> Result<MessageId, LogError> {
            Err(LogError::Storage("unavailable".into()))
        }
    }

    fn relay() -> (TempDir, Relay) {
        let dir = tempfile::tempdir().unwrap();
        let log = SqliteLog::open_path(dir.path().join("chat.db")).unwrap();
        (dir, Relay::new(Arc::new(log), Arc::new(LocalBus::new())))
    }

    async fn connect(relay: &Relay, name: &str, offset: Option<MessageId>) -> (Session, SessionFeed, Client) {
        let (session, mut feed) = relay.attach(Handshake::new(name.into(), offset)).await;
        let mut client = Client::default();
        feed.catch_up(&mut client).await.unwrap();
        (session, feed, client)
    }

    async fn live(feed: &mut SessionFeed) -> Option<(String, MessageId)> {
        tokio::time::timeout(Duration::from_millis(100), feed.next_live())
            .await
            .ok()
            .flatten()
            .map(|m| (m.content.clone(), m.id))
    }

    #[tokio::test]
    async fn test_hello_scenario() {
        let (_dir, relay) = relay();
        let (sender, mut sender_feed, _) = connect(&relay, "conn-1", None).await;
        let (_watcher, mut watcher_feed, _) = connect(&relay, "conn-2", None).await;

        let acked = AtomicBool::new(false);
        let outcome = sender
            .on_client_message("hello", Some("tok-1"), || acked.store(true, Ordering::SeqCst))
            .await;
        assert_eq!(
            outcome,
            Inbound::Accepted {
                id: 1,
                broadcast: true
            }
        );
        assert!(acked.load(Ordering::SeqCst));
        assert_eq!(live(&mut sender_feed).await, Some(("hello".into(), 1)));
        assert_eq!(live(&mut watcher_feed).await, Some(("hello".into(), 1)));

        // The ack was lost; the client retries with the same token.
        let acked = AtomicBool::new(false);
        let outcome = sender
            .on_client_message("hello", Some("tok-1"), || acked.store(true, Ordering::SeqCst))
            .await;
        assert_eq!(outcome, Inbound::Duplicate);
        assert!(acked.load(Ordering::SeqCst));
        assert_eq!(live(&mut watcher_feed).await, None);

        // A new client replays exactly the one message, then goes live.
        let (_late, late_feed, late_client) = connect(&relay, "conn-3", Some(0)).await;
        assert_eq!(late_client.seen, vec![("hello".to_string(), 1)]);
        assert_eq!(late_feed.state(), CursorState::Live);
    }

    #[tokio::test]
    async fn test_replay_starts_after_offset() {
        let (_dir, relay) = relay();
        let (writer, _feed, _) = connect(&relay, "writer", None).await;
        for i in 1..=4 {
            let token = format!("tok-{}", i);
            writer
                .on_client_message(&format!("m{}", i), Some(token.as_str()), || {})
                .await;
        }

        let (_s, _f, client) = connect(&relay, "reader", Some(2)).await;
        let ids: Vec<_> = client.seen.iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_no_duplicates_across_replay_boundary() {
        let (_dir, relay) = relay();
        let (writer, _wf, _) = connect(&relay, "writer", None).await;
        writer.on_client_message("one", Some("tok-1"), || {}).await;

        // Attach first, then publish while the reader has not replayed yet.
        let (_reader, mut feed) = relay.attach(Handshake::new("reader".into(), Some(0))).await;
        writer.on_client_message("two", Some("tok-2"), || {}).await;

        let mut client = Client::default();
        feed.catch_up(&mut client).await.unwrap();
        assert_eq!(
            client.seen,
            vec![("one".to_string(), 1), ("two".to_string(), 2)]
        );

        // "two" also sits in the mailbox; it must not be delivered again.
        writer.on_client_message("three", Some("tok-3"), || {}).await;
        assert_eq!(live(&mut feed).await, Some(("three".into(), 3)));
        assert_eq!(live(&mut feed).await, None);
    }

    #[tokio::test]
    async fn test_recovered_client_skips_replay_when_caught_up() {
        let (_dir, relay) = relay();
        let (writer, _wf, _) = connect(&relay, "writer", None).await;
        writer.on_client_message("one", Some("tok-1"), || {}).await;

        let handshake = Handshake::new("back".into(), Some(1)).recovered(true);
        let (_s, mut feed) = relay.attach(handshake).await;
        assert_eq!(feed.state(), CursorState::Live);

        let mut client = Client::default();
        assert_eq!(feed.catch_up(&mut client).await.unwrap(), 0);
        assert!(client.seen.is_empty());
    }

    #[tokio::test]
    async fn test_recovered_client_behind_head_still_replays() {
        let (_dir, relay) = relay();
        let (writer, _wf, _) = connect(&relay, "writer", None).await;
        writer.on_client_message("one", Some("tok-1"), || {}).await;
        writer.on_client_message("two", Some("tok-2"), || {}).await;

        let handshake = Handshake::new("back".into(), Some(1)).recovered(true);
        let (_s, mut feed) = relay.attach(handshake).await;
        assert_eq!(feed.state(), CursorState::CatchingUp);

        let mut client = Client::default();
        feed.catch_up(&mut client).await.unwrap();
        assert_eq!(client.seen, vec![("two".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_storage_failure_withholds_ack() {
        let relay = Relay::new(Arc::new(BrokenLog), Arc::new(LocalBus::new()));
        let (session, _feed) = relay.attach(Handshake::new("conn-1".into(), None)).await;

        let acked = AtomicBool::new(false);
        let outcome = session
            .on_client_message("hello", Some("tok-1"), || acked.store(true, Ordering::SeqCst))
            .await;

        assert_eq!(outcome, Inbound::Withheld);
        assert!(!acked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_replay_never_goes_live() {
        let relay = Relay::new(Arc::new(BrokenLog), Arc::new(LocalBus::new()));
        // Head lookup fails too, so even a recovered client replays.
        let handshake = Handshake::new("conn-1".into(), None).recovered(true);
        let (_session, mut feed) = relay.attach(handshake).await;

        let mut client = Client::default();
        let result = feed.catch_up(&mut client).await;

        assert!(matches!(result, Err(SessionError::Replay(_))));
        assert_eq!(feed.state(), CursorState::CatchingUp);
        assert_eq!(client.seen, vec![("partial".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_dropped_connection_abandons_replay() {
        let (_dir, relay) = relay();
        let (writer, _wf, _) = connect(&relay, "writer", None).await;
        for i in 0..20 {
            let token = format!("tok-{}", i);
            writer.on_client_message("x", Some(token.as_str()), || {}).await;
        }

        let (_s, mut feed) = relay.attach(Handshake::new("flaky".into(), None)).await;
        let mut sink = Flaky { limit: 5, sent: 0 };
        assert!(matches!(
            feed.catch_up(&mut sink).await,
            Err(SessionError::Emit(_))
        ));
        assert_eq!(feed.state(), CursorState::CatchingUp);

        // A fresh connection starts its own pass from its own offset.
        let (_s2, _f2, client) = connect(&relay, "flaky-again", Some(5)).await;
        assert_eq!(client.seen.len(), 15);
    }

    #[tokio::test]
    async fn test_dropping_session_unregisters() {
        let (_dir, relay) = relay();
        let (session, mut feed, _) = connect(&relay, "conn-1", None).await;
        assert_eq!(relay.registry().len(), 1);

        drop(session);
        assert!(relay.registry().is_empty());
        assert!(feed.next_live().await.is_none());
    }

    #[tokio::test]
    async fn test_lagging_feed_ends_and_resumes_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let log = SqliteLog::open_path(dir.path().join("chat.db")).unwrap();
        let relay = Relay::with_mailbox_capacity(Arc::new(log), Arc::new(LocalBus::new()), 2);

        let (writer, _wf, _) = connect(&relay, "writer", None).await;
        let (_slow, mut slow_feed, _) = connect(&relay, "slow", None).await;
        for i in 1..=3 {
            let token = format!("tok-{}", i);
            writer
                .on_client_message(&format!("m{}", i), Some(token.as_str()), || {})
                .await;
        }

        // The third message overflowed the mailbox: buffered ones drain, then the feed ends.
        assert_eq!(live(&mut slow_feed).await, Some(("m1".into(), 1)));
        assert_eq!(live(&mut slow_feed).await, Some(("m2".into(), 2)));
        assert!(slow_feed.next_live().await.is_none());
        assert!(!relay.registry().contains(&"slow".into()));

        // Reconnecting with the last seen offset replays what was dropped.
        let (_back, back_feed, client) = connect(&relay, "slow", Some(2)).await;
        assert_eq!(client.seen, vec![("m3".to_string(), 3)]);
        assert_eq!(back_feed.state(), CursorState::Live);
    }

    #[tokio::test]
    async fn test_cross_process_fan_out() {
        use crate::cluster::{BusHub, ClusterBus, ClusterConfig};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");
        let hub = Arc::new(BusHub::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let runner = Arc::clone(&hub);
        tokio::spawn(async move { runner.run().await });

        let worker = |name: &str| {
            let mut config = ClusterConfig::new(hub.local_addr().unwrap(), name);
            config.reconnect = Duration::from_millis(20);
            let bus = Arc::new(ClusterBus::start(config));
            let log = Arc::new(SqliteLog::open_path(&path).unwrap());
            (Relay::new(log, bus.clone()), bus)
        };
        let (process_a, bus_a) = worker("a");
        let (process_b, bus_b) = worker("b");
        for _ in 0..200 {
            if bus_a.is_connected() && bus_b.is_connected() && hub.peer_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (sender, _sf, _) = connect(&process_a, "on-a", None).await;
        let (_receiver, mut feed_b, _) = connect(&process_b, "on-b", None).await;

        let outcome = sender.on_client_message("hello", Some("tok-1"), || {}).await;
        assert_eq!(
            outcome,
            Inbound::Accepted {
                id: 1,
                broadcast: true
            }
        );

        let delivered = tokio::time::timeout(Duration::from_secs(2), feed_b.next_live())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*delivered, Message::new(1, "hello"));

        // The same token through the other process is still a duplicate.
        let (retry_on_b, _rf, _) = connect(&process_b, "retry-on-b", Some(1)).await;
        let outcome = retry_on_b.on_client_message("hello", Some("tok-1"), || {}).await;
        assert_eq!(outcome, Inbound::Duplicate);
    }
}
