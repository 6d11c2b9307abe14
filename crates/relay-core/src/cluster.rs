//! Cross-process fan-out over a TCP hub.
//!
//! ```text
//!   worker A ──┐                ┌── worker B
//!   (ClusterBus)   relay frames   (ClusterBus)
//!              └──▶  BusHub  ◀──┘
//! ```
//!
//! Each worker keeps one link to the hub. Publishing dispatches locally and
//! then sends a `relay` frame up the link; the hub forwards it to every other
//! link. The hub keeps no history, so a worker that is disconnected while a
//! message is published never sees it live.
//!
//! Link queues are bounded. The hub closes a link whose queue is full and
//! the worker reconnects; a worker whose own queue is full reports the bus
//! as unavailable for that publish.

use crate::bus::{BusError, Dispatcher, EventHandler, FanoutBus};
use crate::message::Message;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use relay_protocol::{codec, Frame};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Default number of encoded frames queued per link.
pub const DEFAULT_LINK_QUEUE: usize = 4096;

type PeerMap = DashMap<u64, mpsc::Sender<Bytes>>;

/// Relays `relay` frames between worker links.
pub struct BusHub {
    listener: TcpListener,
    peers: Arc<PeerMap>,
    next_peer: AtomicU64,
    queue: usize,
}

impl BusHub {
    /// Bind the hub listener.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, BusError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Fan-out hub listening on {}", addr);
        Ok(Self {
            listener,
            peers: Arc::new(DashMap::new()),
            next_peer: AtomicU64::new(1),
            queue: DEFAULT_LINK_QUEUE,
        })
    }

    /// Set how many frames each worker link may have queued.
    #[must_use]
    pub fn with_queue(mut self, queue: usize) -> Self {
        self.queue = queue.max(1);
        self
    }

    /// Get the local address the hub is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Number of worker links currently attached.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Accept worker links until the listener fails.
    ///
    /// Dropping the future closes every worker link.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting a connection fails.
    pub async fn run(&self) -> Result<(), BusError> {
        let mut links = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted?;
                    let peer_id = self.next_peer.fetch_add(1, Ordering::Relaxed);
                    debug!(peer = peer_id, %addr, "Worker link accepted");

                    let (tx, rx) = mpsc::channel(self.queue);
                    self.peers.insert(peer_id, tx);
                    links.spawn(serve_link(stream, peer_id, Arc::clone(&self.peers), rx));
                }
                Some(_) = links.join_next(), if !links.is_empty() => {}
            }
        }
    }
}

/// Removes a link from the peer map however its task ends.
struct PeerEntry {
    peers: Arc<PeerMap>,
    peer_id: u64,
}

impl Drop for PeerEntry {
    fn drop(&mut self) {
        self.peers.remove(&self.peer_id);
    }
}

/// Serve one worker link until either direction ends.
async fn serve_link(stream: TcpStream, peer_id: u64, peers: Arc<PeerMap>, rx: mpsc::Receiver<Bytes>) {
    let entry = PeerEntry {
        peers: Arc::clone(&peers),
        peer_id,
    };
    let (reader, writer) = stream.into_split();
    let mut worker = String::from("unknown");

    tokio::select! {
        () = serve_peer(reader, peer_id, &peers, &mut worker) => {}
        result = write_link(writer, rx) => {
            if let Err(e) = result {
                warn!(peer = peer_id, error = %e, "Worker link write failed");
            }
        }
    }

    drop(entry);
    info!(peer = peer_id, worker = %worker, "Worker link closed");
}

/// Drain a link's outbound queue into its socket.
///
/// Returns once the queue's sender is gone and the backlog is written.
async fn write_link(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) -> Result<(), BusError> {
    while let Some(data) = rx.recv().await {
        writer.write_all(&data).await?;
    }
    Ok(())
}

/// Read frames from one worker link, forwarding relays to every other link.
///
/// Records the worker's announced name in `worker`.
async fn serve_peer(mut reader: OwnedReadHalf, peer_id: u64, peers: &PeerMap, worker: &mut String) {
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                warn!(peer = peer_id, error = %e, "Worker link read failed");
                return;
            }
        }

        loop {
            match codec::decode_from(&mut buf) {
                Ok(Some(Frame::Join { worker: name })) => {
                    info!(peer = peer_id, worker = %name, "Worker joined");
                    *worker = name;
                }
                Ok(Some(frame @ Frame::Relay { .. })) => forward(peers, peer_id, &frame),
                Ok(Some(other)) => {
                    warn!(peer = peer_id, frame_type = ?other.frame_type(), "Unexpected frame on hub link");
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = peer_id, error = %e, "Invalid frame on hub link");
                    return;
                }
            }
        }
    }
}

fn forward(peers: &PeerMap, origin: u64, frame: &Frame) {
    let data = match codec::encode(frame) {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "Failed to re-encode relay frame");
            return;
        }
    };
    let mut backed_up = Vec::new();
    for peer in peers.iter().filter(|p| *p.key() != origin) {
        match peer.value().try_send(data.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => backed_up.push(*peer.key()),
            // Closed: the link is being torn down.
            Err(TrySendError::Closed(_)) => {}
        }
    }
    // Dropping the sender lets the writer drain its backlog and close the link.
    for peer_id in backed_up {
        warn!(peer = peer_id, "Worker link backed up; closing it");
        peers.remove(&peer_id);
    }
}

/// Worker-side cluster bus configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Address of the hub.
    pub hub_addr: SocketAddr,
    /// Name announced to the hub.
    pub worker: String,
    /// Delay between reconnect attempts.
    pub reconnect: Duration,
    /// Frames queued for the hub before publishes report the bus unavailable.
    pub queue: usize,
}

impl ClusterConfig {
    /// Configuration with a one-second reconnect delay.
    #[must_use]
    pub fn new(hub_addr: SocketAddr, worker: impl Into<String>) -> Self {
        Self {
            hub_addr,
            worker: worker.into(),
            reconnect: Duration::from_secs(1),
            queue: DEFAULT_LINK_QUEUE,
        }
    }
}

type LinkSlot = RwLock<Option<mpsc::Sender<Bytes>>>;

/// Fan-out bus for one worker in a multi-process deployment.
pub struct ClusterBus {
    dispatcher: Arc<Dispatcher>,
    link: Arc<LinkSlot>,
    hub_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ClusterBus {
    /// Start the bus and its background hub link.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(config: ClusterConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::new());
        let link: Arc<LinkSlot> = Arc::new(RwLock::new(None));
        let hub_addr = config.hub_addr;

        let task = tokio::spawn(maintain_link(
            config,
            Arc::clone(&dispatcher),
            Arc::clone(&link),
        ));

        Self {
            dispatcher,
            link,
            hub_addr,
            task,
        }
    }

    /// Check if the hub link is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

impl Drop for ClusterBus {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn set_link(link: &LinkSlot, tx: Option<mpsc::Sender<Bytes>>) {
    *link.write().unwrap_or_else(PoisonError::into_inner) = tx;
}

async fn maintain_link(config: ClusterConfig, dispatcher: Arc<Dispatcher>, link: Arc<LinkSlot>) {
    loop {
        match TcpStream::connect(config.hub_addr).await {
            Ok(stream) => {
                let result = run_link(stream, &config, &dispatcher, &link).await;
                set_link(&link, None);
                match result {
                    Ok(()) => warn!(hub = %config.hub_addr, "Hub closed the link"),
                    Err(e) => warn!(hub = %config.hub_addr, error = %e, "Hub link failed"),
                }
            }
            Err(e) => {
                debug!(hub = %config.hub_addr, error = %e, "Hub unreachable");
            }
        }
        tokio::time::sleep(config.reconnect).await;
    }
}

async fn run_link(
    stream: TcpStream,
    config: &ClusterConfig,
    dispatcher: &Dispatcher,
    link: &LinkSlot,
) -> Result<(), BusError> {
    let (mut reader, mut writer) = stream.into_split();
    writer
        .write_all(&codec::encode(&Frame::join(config.worker.clone()))?)
        .await?;

    let (tx, rx) = mpsc::channel(config.queue.max(1));
    set_link(link, Some(tx));
    info!(hub = %config.hub_addr, worker = %config.worker, "Connected to fan-out hub");

    let inbound = async {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            if reader.read_buf(&mut buf).await? == 0 {
                return Ok::<(), BusError>(());
            }
            while let Some(frame) = codec::decode_from(&mut buf)? {
                match Message::from_frame(frame) {
                    Some(message) => dispatcher.dispatch(&Arc::new(message)),
                    None => warn!("Unexpected frame from hub"),
                }
            }
        }
    };

    tokio::select! {
        result = inbound => result,
        result = write_link(writer, rx) => result,
    }
}

#[async_trait]
impl FanoutBus for ClusterBus {
    async fn publish(&self, message: Message) -> Result<(), BusError> {
        let message = Arc::new(message);
        self.dispatcher.dispatch(&message);

        let data = codec::encode(&message.to_relay_frame())?;
        let link = self.link.read().unwrap_or_else(PoisonError::into_inner);
        match link.as_ref().map(|tx| tx.try_send(data)) {
            Some(Ok(())) => Ok(()),
            Some(Err(TrySendError::Full(_))) => Err(BusError::Unavailable(format!(
                "link to hub at {} is backed up",
                self.hub_addr
            ))),
            Some(Err(TrySendError::Closed(_))) | None => Err(BusError::Unavailable(format!(
                "no link to hub at {}",
                self.hub_addr
            ))),
        }
    }

    fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        self.dispatcher.subscribe(handler);
    }

    fn name(&self) -> &'static str {
        "cluster"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::Recorder;

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    async fn spawn_hub(addr: SocketAddr) -> (Arc<BusHub>, JoinHandle<Result<(), BusError>>) {
        let hub = Arc::new(BusHub::bind(addr).await.unwrap());
        let runner = Arc::clone(&hub);
        let handle = tokio::spawn(async move { runner.run().await });
        (hub, handle)
    }

    async fn start_hub() -> Arc<BusHub> {
        spawn_hub("127.0.0.1:0".parse().unwrap()).await.0
    }

    fn worker(hub: &BusHub, name: &str) -> (ClusterBus, Arc<Recorder>) {
        let mut config = ClusterConfig::new(hub.local_addr().unwrap(), name);
        config.reconnect = Duration::from_millis(20);
        let bus = ClusterBus::start(config);
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(recorder.clone());
        (bus, recorder)
    }

    #[tokio::test]
    async fn test_publish_reaches_other_worker_once() {
        let hub = start_hub().await;
        let (bus_a, seen_a) = worker(&hub, "worker-a");
        let (bus_b, seen_b) = worker(&hub, "worker-b");
        eventually(|| bus_a.is_connected() && bus_b.is_connected()).await;
        eventually(|| hub.peer_count() == 2).await;

        bus_a.publish(Message::new(1, "hello")).await.unwrap();

        // Local delivery is synchronous with publish.
        assert_eq!(seen_a.ids(), vec![1]);
        eventually(|| seen_b.ids() == vec![1]).await;

        // The hub never echoes back to the origin.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen_a.ids(), vec![1]);
    }

    #[tokio::test]
    async fn test_unreachable_hub_still_delivers_locally() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);

        let bus = ClusterBus::start(ClusterConfig::new(addr, "lonely"));
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(recorder.clone());

        let result = bus.publish(Message::new(7, "local only")).await;
        assert!(matches!(result, Err(BusError::Unavailable(_))));
        assert_eq!(recorder.ids(), vec![7]);
    }

    #[tokio::test]
    async fn test_hub_survives_a_departed_worker() {
        let hub = start_hub().await;
        let (bus_a, seen_a) = worker(&hub, "worker-a");
        let (bus_b, _seen_b) = worker(&hub, "worker-b");
        let (bus_c, seen_c) = worker(&hub, "worker-c");
        eventually(|| hub.peer_count() == 3).await;
        eventually(|| bus_a.is_connected() && bus_b.is_connected() && bus_c.is_connected()).await;

        drop(bus_b);
        eventually(|| hub.peer_count() == 2).await;

        bus_c.publish(Message::new(3, "still here")).await.unwrap();
        eventually(|| seen_a.ids() == vec![3]).await;
        assert_eq!(seen_c.ids(), vec![3]);
    }

    #[tokio::test]
    async fn test_workers_relink_after_hub_restart() {
        let (hub, handle) = spawn_hub("127.0.0.1:0".parse().unwrap()).await;
        let addr = hub.local_addr().unwrap();
        let (bus_a, _seen_a) = worker(&hub, "worker-a");
        let (bus_b, seen_b) = worker(&hub, "worker-b");
        eventually(|| hub.peer_count() == 2).await;
        eventually(|| bus_a.is_connected() && bus_b.is_connected()).await;

        // Stopping the hub closes both links and frees the address.
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        drop(hub);
        eventually(|| !bus_a.is_connected() && !bus_b.is_connected()).await;

        let (hub, _handle) = spawn_hub(addr).await;
        eventually(|| hub.peer_count() == 2).await;
        eventually(|| bus_a.is_connected() && bus_b.is_connected()).await;

        bus_a.publish(Message::new(5, "after restart")).await.unwrap();
        eventually(|| seen_b.ids() == vec![5]).await;
    }

    #[test]
    fn test_backed_up_peer_is_closed() {
        let peers = PeerMap::new();
        let (origin_tx, _origin_rx) = mpsc::channel(1);
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(4);
        peers.insert(1, origin_tx);
        peers.insert(2, slow_tx);
        peers.insert(3, fast_tx);

        let frame = Message::new(1, "x").to_relay_frame();
        forward(&peers, 1, &frame);
        assert_eq!(peers.len(), 3);

        forward(&peers, 1, &frame);
        assert!(!peers.contains_key(&2));
        assert!(peers.contains_key(&1) && peers.contains_key(&3));

        // The slow link drains what it had, then its queue ends.
        assert!(slow_rx.try_recv().is_ok());
        assert!(matches!(
            slow_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(fast_rx.try_recv().is_ok() && fast_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_backed_up_link_reports_unavailable() {
        let (tx, _rx) = mpsc::channel(1);
        let dispatcher = Arc::new(Dispatcher::new());
        let recorder = Arc::new(Recorder::default());
        dispatcher.subscribe(recorder.clone());
        let bus = ClusterBus {
            dispatcher,
            link: Arc::new(RwLock::new(Some(tx))),
            hub_addr: "127.0.0.1:9".parse().unwrap(),
            task: tokio::spawn(async {}),
        };

        bus.publish(Message::new(1, "queued")).await.unwrap();
        let result = bus.publish(Message::new(2, "no room")).await;
        assert!(matches!(result, Err(BusError::Unavailable(_))));
        assert_eq!(recorder.ids(), vec![1, 2]);
    }
}
