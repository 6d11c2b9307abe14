//! Connection handlers for the Relay server.
//!
//! Each WebSocket goes through three stages:
//!
//! 1. Handshake: the client's `connect` frame carries its last-seen offset
//!    and optionally the id of a connection it is resuming
//! 2. Catch-up: the log tail after that offset is replayed
//! 3. Live: inbound `send` frames are appended, published and acked while
//!    live events from the bus are forwarded

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard, Phase};
use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_core::{
    ClientSink, ConnectionId, Handshake, Inbound, Message, Relay, Session, SessionError,
};
use relay_protocol::{codec, codes, Frame, PROTOCOL_VERSION};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type WsSender = SplitSink<WebSocket, WsMessage>;
type WsReceiver = SplitStream<WebSocket>;

/// Inbound frames read ahead of the session; the reader waits when full.
const INBOUND_QUEUE: usize = 64;

/// Shared server state.
pub struct AppState {
    /// The reliable-delivery engine.
    pub relay: Relay,
    /// Server configuration.
    pub config: Config,
    /// Connections closed within the resume window, with their close time.
    recently_closed: DashMap<String, Instant>,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(relay: Relay, config: Config) -> Self {
        Self {
            relay,
            config,
            recently_closed: DashMap::new(),
        }
    }

    /// Remember a closed connection so it can be resumed.
    fn remember_closed(&self, id: &ConnectionId) {
        let window = self.config.recovery_window();
        self.recently_closed
            .retain(|_, closed| closed.elapsed() <= window);
        self.recently_closed.insert(id.to_string(), Instant::now());
    }

    /// Claim a resume of `id`. Each closed connection can be resumed once.
    fn claim_resume(&self, id: &str) -> bool {
        let window = self.config.recovery_window();
        self.recently_closed
            .remove(id)
            .is_some_and(|(_, closed)| closed.elapsed() <= window)
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(relay: Relay, config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let ws_path = config.transport.websocket_path.clone();
    let state = Arc::new(AppState::new(relay, config));

    let listener = TcpListener::bind(addr).await?;

    info!("Relay server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, ws_path);

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "role": state.config.cluster.role,
        "connections": state.relay.registry().len(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Writes replayed messages to the socket.
struct WsSink<'a> {
    sender: &'a mut WsSender,
}

#[async_trait]
impl<'a> ClientSink for WsSink<'a> {
    async fn emit(&mut self, message: &Message) -> Result<(), SessionError> {
        send_frame(self.sender, &message.to_client_frame())
            .await
            .map_err(|e| SessionError::Emit(e.to_string()))?;
        metrics::record_delivery(Phase::Replay);
        Ok(())
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (mut sender, mut receiver) = socket.split();
    let mut read_buffer = BytesMut::with_capacity(4096);
    let idle = state.config.idle_timeout();

    let first = tokio::time::timeout(idle, next_frame(&mut receiver, &mut read_buffer)).await;
    let (version, offset, resume) = match first {
        Ok(Some(Frame::Connect {
            version,
            offset,
            resume,
        })) => (version, offset, resume),
        Ok(Some(frame)) => {
            warn!(frame_type = ?frame.frame_type(), "Frame before connect");
            let reject = Frame::error(0, codes::HANDSHAKE_REQUIRED, "expected connect");
            let _ = send_frame(&mut sender, &reject).await;
            return;
        }
        Ok(None) => {
            debug!("WebSocket closed before handshake");
            return;
        }
        Err(_) => {
            debug!("Handshake timed out");
            return;
        }
    };

    let Some(negotiated) = PROTOCOL_VERSION.negotiate(version) else {
        warn!(version, "Unsupported protocol version");
        let reject = Frame::error(
            0,
            codes::UNSUPPORTED_VERSION,
            format!("Unsupported version {version}, server speaks {PROTOCOL_VERSION}"),
        );
        let _ = send_frame(&mut sender, &reject).await;
        return;
    };

    let recovered = resume
        .as_deref()
        .is_some_and(|id| state.claim_resume(id));
    let connection_id = match resume {
        Some(id) if recovered => ConnectionId::new(id),
        _ => ConnectionId::generate(),
    };

    let (session, mut feed) = state
        .relay
        .attach(Handshake::new(connection_id.clone(), offset).recovered(recovered))
        .await;

    let connected = Frame::connected(
        connection_id.as_str(),
        negotiated.major,
        u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX),
        recovered,
    );
    if send_frame(&mut sender, &connected).await.is_err() {
        debug!(connection = %connection_id, "Failed to send Connected frame");
        close(&state, session);
        return;
    }

    debug!(connection = %connection_id, recovered, ?offset, "WebSocket connected");

    let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let mut reader = tokio::spawn(read_frames(
        receiver,
        read_buffer,
        inbound_tx,
        idle,
        connection_id.clone(),
    ));

    // A client that goes away mid-replay abandons it.
    let replay = {
        let mut sink = WsSink {
            sender: &mut sender,
        };
        tokio::select! {
            result = feed.catch_up(&mut sink) => result,
            _ = &mut reader => Err(SessionError::Closed),
        }
    };

    match replay {
        Ok(replayed) => {
            debug!(connection = %connection_id, replayed, state = %feed.state(), "Caught up");
        }
        Err(SessionError::Replay(e)) => {
            warn!(connection = %connection_id, error = %e, "Replay failed; closing");
            metrics::record_replay_failure();
            let notice = Frame::error(0, codes::REPLAY_FAILED, "Replay failed, reconnect");
            let _ = send_frame(&mut sender, &notice).await;
            reader.abort();
            close(&state, session);
            return;
        }
        Err(e) => {
            debug!(connection = %connection_id, error = %e, "Replay abandoned");
            reader.abort();
            close(&state, session);
            return;
        }
    }

    loop {
        tokio::select! {
            live = feed.next_live() => {
                let Some(message) = live else { break };
                if send_frame(&mut sender, &message.to_client_frame()).await.is_err() {
                    break;
                }
                metrics::record_delivery(Phase::Live);
            }

            inbound = inbound_rx.recv() => {
                let Some(frame) = inbound else { break };
                if let Err(e) = handle_frame(frame, &session, &mut sender).await {
                    debug!(connection = %connection_id, error = %e, "Send failed");
                    break;
                }
            }
        }
    }

    reader.abort();
    close(&state, session);
}

/// Detach a session and open its resume window.
fn close(state: &AppState, session: Session) {
    let id = session.id().clone();
    drop(session);
    state.remember_closed(&id);
    debug!(connection = %id, "WebSocket disconnected");
}

/// Handle a decoded frame from a live connection.
async fn handle_frame(frame: Frame, session: &Session, sender: &mut WsSender) -> Result<()> {
    match frame {
        Frame::Send { id, content, token } => {
            let start = Instant::now();
            let mut acked = false;
            let outcome = session
                .on_client_message(&content, token.as_deref(), || acked = true)
                .await;

            match outcome {
                Inbound::Accepted { broadcast, .. } => {
                    metrics::record_appended();
                    if !broadcast {
                        metrics::record_bus_unavailable();
                    }
                }
                Inbound::Duplicate => metrics::record_duplicate(),
                Inbound::Withheld => metrics::record_storage_failure(),
            }

            if acked {
                send_frame(sender, &Frame::ack(id)).await?;
            }
            metrics::record_latency(start.elapsed().as_secs_f64());
        }

        Frame::Ping { timestamp } => {
            send_frame(sender, &Frame::pong(timestamp)).await?;
        }

        Frame::Pong { .. } => {}

        Frame::Connect { .. } => {
            debug!(connection = %session.id(), "Connect frame (already connected)");
        }

        other => {
            warn!(connection = %session.id(), frame_type = ?other.frame_type(), "Unexpected frame type");
        }
    }

    Ok(())
}

/// Forward inbound frames until the socket closes or goes idle.
async fn read_frames(
    mut receiver: WsReceiver,
    mut buffer: BytesMut,
    inbound: mpsc::Sender<Frame>,
    idle: Duration,
    connection_id: ConnectionId,
) {
    loop {
        match tokio::time::timeout(idle, next_frame(&mut receiver, &mut buffer)).await {
            Ok(Some(frame)) => {
                if inbound.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => {
                debug!(connection = %connection_id, "Idle timeout");
                break;
            }
        }
    }
}

/// Read until a whole frame is buffered.
///
/// Returns `None` once the socket is closed, broken, or sends garbage.
async fn next_frame(receiver: &mut WsReceiver, buffer: &mut BytesMut) -> Option<Frame> {
    loop {
        match codec::decode_from(buffer) {
            Ok(Some(frame)) => return Some(frame),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Undecodable frame");
                return None;
            }
        }

        match receiver.next().await? {
            Ok(WsMessage::Binary(data)) => buffer.extend_from_slice(&data),
            Ok(WsMessage::Text(text)) => buffer.extend_from_slice(text.as_bytes()),
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_)) => {}
            Ok(WsMessage::Close(_)) => return None,
            Err(e) => {
                debug!(error = %e, "WebSocket error");
                return None;
            }
        }
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSender, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    sender.send(WsMessage::Binary(data.to_vec())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream::SplitStream as ClientStream;
    use relay_core::{LocalBus, SqliteLog};
    use std::net::SocketAddr;
    use tempfile::TempDir;
    use tokio::net::TcpStream;
    use tokio_tungstenite::{
        connect_async, tungstenite::Message as ClientMessage, MaybeTlsStream, WebSocketStream,
    };

    type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct TestClient {
        sink: SplitSink<ClientWs, ClientMessage>,
        stream: ClientStream<ClientWs>,
        buffer: BytesMut,
    }

    impl TestClient {
        async fn open(addr: SocketAddr, connect: Frame) -> Self {
            let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
            let (sink, stream) = ws.split();
            let mut client = Self {
                sink,
                stream,
                buffer: BytesMut::new(),
            };
            client.send(&connect).await;
            client
        }

        async fn send(&mut self, frame: &Frame) {
            let data = codec::encode(frame).unwrap();
            self.sink
                .send(ClientMessage::Binary(data.to_vec()))
                .await
                .unwrap();
        }

        /// Next frame, or `None` on close or after a quiet period.
        async fn recv(&mut self) -> Option<Frame> {
            tokio::time::timeout(Duration::from_millis(500), async {
                loop {
                    if let Some(frame) = codec::decode_from(&mut self.buffer).unwrap() {
                        return Some(frame);
                    }
                    match self.stream.next().await? {
                        Ok(ClientMessage::Binary(data)) => self.buffer.extend_from_slice(&data),
                        Ok(ClientMessage::Close(_)) | Err(_) => return None,
                        Ok(_) => {}
                    }
                }
            })
            .await
            .ok()
            .flatten()
        }

        async fn connected(&mut self) -> (String, bool) {
            match self.recv().await {
                Some(Frame::Connected {
                    connection_id,
                    recovered,
                    ..
                }) => (connection_id, recovered),
                other => panic!("expected connected, got {other:?}"),
            }
        }

        /// Collect frames until the connection goes quiet.
        async fn drain(&mut self) -> Vec<Frame> {
            let mut frames = Vec::new();
            while let Some(frame) = self.recv().await {
                frames.push(frame);
            }
            frames
        }
    }

    async fn spawn_server() -> (TempDir, SocketAddr, Arc<AppState>) {
        let dir = tempfile::tempdir().unwrap();
        let log = SqliteLog::open_path(dir.path().join("chat.db")).unwrap();
        let relay = Relay::new(Arc::new(log), Arc::new(LocalBus::new()));
        let state = Arc::new(AppState::new(relay, Config::default()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app(Arc::clone(&state));
        tokio::spawn(async move { axum::serve(listener, router).await });

        (dir, addr, state)
    }

    fn connect(offset: Option<u64>, resume: Option<String>) -> Frame {
        Frame::connect(PROTOCOL_VERSION.major, offset, resume)
    }

    #[tokio::test]
    async fn test_send_is_acked_and_broadcast() {
        let (_dir, addr, _state) = spawn_server().await;
        let mut alice = TestClient::open(addr, connect(None, None)).await;
        let mut bob = TestClient::open(addr, connect(None, None)).await;
        let (_, recovered) = alice.connected().await;
        assert!(!recovered);
        bob.connected().await;

        alice
            .send(&Frame::send(7, "hello", Some("tok-1".into())))
            .await;

        let frames = alice.drain().await;
        assert!(frames.contains(&Frame::ack(7)));
        assert!(frames.contains(&Frame::message(1, "hello")));
        assert_eq!(bob.drain().await, vec![Frame::message(1, "hello")]);
    }

    #[tokio::test]
    async fn test_retry_with_same_token_is_acked_once_delivered() {
        let (_dir, addr, _state) = spawn_server().await;
        let mut alice = TestClient::open(addr, connect(None, None)).await;
        let mut bob = TestClient::open(addr, connect(None, None)).await;
        alice.connected().await;
        bob.connected().await;

        alice.send(&Frame::send(1, "hi", Some("tok-1".into()))).await;
        alice.send(&Frame::send(2, "hi", Some("tok-1".into()))).await;

        let frames = alice.drain().await;
        assert!(frames.contains(&Frame::ack(1)));
        assert!(frames.contains(&Frame::ack(2)));
        assert_eq!(bob.drain().await, vec![Frame::message(1, "hi")]);
    }

    #[tokio::test]
    async fn test_reconnect_replays_missed_messages() {
        let (_dir, addr, _state) = spawn_server().await;
        let mut writer = TestClient::open(addr, connect(None, None)).await;
        writer.connected().await;
        for (i, text) in ["one", "two", "three"].into_iter().enumerate() {
            writer.send(&Frame::send(i as u64, text, None)).await;
        }
        writer.drain().await;

        let mut reader = TestClient::open(addr, connect(Some(1), None)).await;
        reader.connected().await;
        assert_eq!(
            reader.drain().await,
            vec![Frame::message(2, "two"), Frame::message(3, "three")]
        );
    }

    #[tokio::test]
    async fn test_resume_within_window_is_recovered() {
        let (_dir, addr, state) = spawn_server().await;
        let mut first = TestClient::open(addr, connect(None, None)).await;
        let (id, _) = first.connected().await;
        drop(first);

        for _ in 0..100 {
            if state.recently_closed.contains_key(&id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut second = TestClient::open(addr, connect(None, Some(id.clone()))).await;
        let (resumed_id, recovered) = second.connected().await;
        assert!(recovered);
        assert_eq!(resumed_id, id);
        drop(second);

        // Unknown ids are never recovered.
        let mut third = TestClient::open(addr, connect(None, Some("conn_unknown".into()))).await;
        let (fresh_id, recovered) = third.connected().await;
        assert!(!recovered);
        assert_ne!(fresh_id, "conn_unknown");
    }

    #[tokio::test]
    async fn test_version_mismatch_is_rejected() {
        let (_dir, addr, _state) = spawn_server().await;
        let mut client = TestClient::open(addr, Frame::connect(9, None, None)).await;

        match client.recv().await {
            Some(Frame::Error { code, .. }) => assert_eq!(code, codes::UNSUPPORTED_VERSION),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(client.recv().await, None);
    }

    #[tokio::test]
    async fn test_frame_before_connect_is_rejected() {
        let (_dir, addr, _state) = spawn_server().await;
        let mut client = TestClient::open(addr, Frame::ping()).await;

        match client.recv().await {
            Some(Frame::Error { code, .. }) => assert_eq!(code, codes::HANDSHAKE_REQUIRED),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_resume_is_claimed_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = SqliteLog::open_path(dir.path().join("chat.db")).unwrap();
        let relay = Relay::new(Arc::new(log), Arc::new(LocalBus::new()));
        let state = AppState::new(relay, Config::default());

        state.remember_closed(&ConnectionId::from("conn-1"));
        assert!(state.claim_resume("conn-1"));
        assert!(!state.claim_resume("conn-1"));
        assert!(!state.claim_resume("conn-2"));
    }

    #[test]
    fn test_resume_window_expires() {
        let dir = tempfile::tempdir().unwrap();
        let log = SqliteLog::open_path(dir.path().join("chat.db")).unwrap();
        let relay = Relay::new(Arc::new(log), Arc::new(LocalBus::new()));
        let mut config = Config::default();
        config.recovery.max_disconnection_ms = 0;
        let state = AppState::new(relay, config);

        state.remember_closed(&ConnectionId::from("conn-1"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!state.claim_resume("conn-1"));
    }
}
