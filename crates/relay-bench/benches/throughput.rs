//! Throughput benchmarks for Relay.
//!
//! These benchmarks measure the raw message throughput of the log, the
//! replay path, and local fan-out.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures_util::StreamExt;
use relay_core::{DurableLog, LogConfig, Message, Registry, SqliteLog};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;

fn open_log(dir: &TempDir) -> SqliteLog {
    SqliteLog::open(LogConfig::new(dir.path().join("bench.db"))).unwrap()
}

/// Benchmark log appends.
fn bench_append(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("append");
    group.throughput(Throughput::Elements(1));

    group.bench_function("untokened", |b| {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);
        b.iter(|| rt.block_on(log.append(black_box("hello"), None)).unwrap());
    });

    group.bench_function("fresh_token", |b| {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);
        let mut i = 0u64;
        b.iter(|| {
            let token = format!("tok-{}", i);
            i += 1;
            rt.block_on(log.append("hello", Some(token.as_str()))).unwrap()
        });
    });

    group.bench_function("duplicate_token", |b| {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);
        rt.block_on(log.append("hello", Some("tok-dup"))).unwrap();
        b.iter(|| rt.block_on(log.append("hello", Some(black_box("tok-dup")))).unwrap());
    });

    group.finish();
}

/// Benchmark replaying a log tail.
fn bench_replay(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("replay");

    for size in [100u64, 1000, 10000].iter() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);
        rt.block_on(async {
            for i in 0..*size {
                log.append(&format!("message {}", i), None).await.unwrap();
            }
        });

        group.throughput(Throughput::Elements(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let mut rows = log.stream_after(0);
                    let mut count = 0;
                    while let Some(row) = rows.next().await {
                        black_box(row.unwrap());
                        count += 1;
                    }
                    count
                })
            });
        });
    }

    group.finish();
}

/// Benchmark local fan-out scenarios.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    for size in [10, 100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let registry = Registry::new();
            let mut mailboxes: Vec<_> = (0..size)
                .map(|i| registry.register(format!("conn-{}", i).as_str().into()))
                .collect();
            let message = Arc::new(Message::new(1, "broadcast"));

            b.iter(|| {
                registry.broadcast_all(black_box(Arc::clone(&message)));
                for mailbox in &mut mailboxes {
                    let _ = mailbox.try_recv();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_append, bench_replay, bench_fanout);
criterion_main!(benches);
