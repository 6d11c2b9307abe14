//! End-to-end throughput benchmark for Relay.
//!
//! Every client sends tokened chat messages and counts the acks it gets back
//! and the messages delivered to it, against a running server.

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{codec, Frame, PROTOCOL_VERSION};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_URL: &str = "ws://127.0.0.1:5050/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;
/// Sends allowed in flight per client before waiting for acks.
const WINDOW: u64 = 32;

#[derive(Default)]
struct Counters {
    acked: AtomicU64,
    delivered: AtomicU64,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = args.get(2).cloned().unwrap_or_else(|| SERVER_URL.to_string());

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Relay End-to-End Throughput Benchmark                ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_chat_benchmark(num_clients, url).await;
}

async fn run_chat_benchmark(num_clients: usize, url: String) {
    println!("📊 Chat Benchmark: {} clients against {}", num_clients, url);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let counters = Arc::new(Counters::default());
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let counters = Arc::clone(&counters);
        let barrier = Arc::clone(&barrier);
        let url = url.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(client_id, &url, counters, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    barrier.wait().await;
    println!("✓ All {} clients connected", num_clients);

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    counters.acked.store(0, Ordering::SeqCst);
    counters.delivered.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed().as_secs_f64();
    let acked = counters.acked.load(Ordering::SeqCst);
    let delivered = counters.delivered.load(Ordering::SeqCst);

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Clients:              {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed
    );
    println!(
        "║  Acked sends:          {:>10.0} msg/s                    ║",
        acked as f64 / elapsed
    );
    println!(
        "║  Deliveries:           {:>10.0} msg/s                    ║",
        delivered as f64 / elapsed
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    url: &str,
    counters: Arc<Counters>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();

    // Any replay lands in the warmup window.
    let connect = Frame::connect(PROTOCOL_VERSION.major, None, None);
    sender
        .send(Message::Binary(codec::encode(&connect)?.to_vec()))
        .await?;

    let mut recv_buf = BytesMut::with_capacity(65536);
    loop {
        match receiver.next().await {
            Some(Ok(Message::Binary(data))) => recv_buf.extend_from_slice(&data),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Err("closed during handshake".into()),
        }
        match codec::decode_from(&mut recv_buf)? {
            Some(Frame::Connected { .. }) => break,
            Some(Frame::Error { message, .. }) => return Err(message.into()),
            _ => {}
        }
    }

    barrier.wait().await;

    let in_flight = Arc::new(AtomicU64::new(0));
    let recv_in_flight = Arc::clone(&in_flight);
    let recv_counters = Arc::clone(&counters);
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            if let Ok(Message::Binary(data)) = result {
                recv_buf.extend_from_slice(&data);
                while let Ok(Some(frame)) = codec::decode_from(&mut recv_buf) {
                    match frame {
                        Frame::Ack { .. } => {
                            recv_counters.acked.fetch_add(1, Ordering::Relaxed);
                            recv_in_flight.fetch_sub(1, Ordering::Relaxed);
                        }
                        Frame::Message { .. } => {
                            recv_counters.delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => {}
                    }
                }
            }
        }
    });

    let mut request_id = 0u64;
    loop {
        if in_flight.load(Ordering::Relaxed) >= WINDOW {
            tokio::task::yield_now().await;
            continue;
        }

        request_id += 1;
        let token = format!("bench-{}-{}", client_id, request_id);
        let frame = Frame::send(request_id, "benchmark payload", Some(token));
        in_flight.fetch_add(1, Ordering::Relaxed);
        if sender
            .send(Message::Binary(codec::encode(&frame)?.to_vec()))
            .await
            .is_err()
        {
            break;
        }
    }

    recv_task.abort();
    Ok(())
}
