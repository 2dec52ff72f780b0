//! echo-bench — tokio load generator for a tempo server.
//!
//! Opens N concurrent connections and runs M write/read round trips on
//! each, verifying every echoed payload. Prints a stats line every few
//! seconds and a throughput summary at the end.
//!
//! Usage:
//!     echo-bench [host] [port] [connections] [rounds] [payload_bytes]
//!
//! Defaults: 127.0.0.1 7070 64 1000 512

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct Stats {
    connects: AtomicU64,
    rounds: AtomicU64,
    bytes_out: AtomicU64,
    bytes_in: AtomicU64,
    errors: AtomicU64,
}

impl Stats {
    fn new() -> Self {
        Self {
            connects: AtomicU64::new(0),
            rounds: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    fn print(&self, elapsed_secs: f64) {
        eprintln!(
            "[{:.1}s] connects={} rounds={} bytes_out={} bytes_in={} err={}",
            elapsed_secs,
            self.connects.load(Ordering::Relaxed),
            self.rounds.load(Ordering::Relaxed),
            self.bytes_out.load(Ordering::Relaxed),
            self.bytes_in.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        );
    }
}

async fn run_client(
    addr: String,
    rounds: u64,
    payload_bytes: usize,
    seed: u8,
    stats: Arc<Stats>,
) {
    let mut stream = match TcpStream::connect(&addr).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("echo-bench: connect failed: {}", e);
            stats.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    stats.connects.fetch_add(1, Ordering::Relaxed);

    let payload: Vec<u8> = (0..payload_bytes)
        .map(|i| seed.wrapping_add(i as u8))
        .collect();
    let mut echoed = vec![0u8; payload_bytes];

    for _ in 0..rounds {
        if let Err(e) = stream.write_all(&payload).await {
            eprintln!("echo-bench: write failed: {}", e);
            stats.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
        stats
            .bytes_out
            .fetch_add(payload_bytes as u64, Ordering::Relaxed);

        if let Err(e) = stream.read_exact(&mut echoed).await {
            eprintln!("echo-bench: read failed: {}", e);
            stats.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
        stats
            .bytes_in
            .fetch_add(payload_bytes as u64, Ordering::Relaxed);

        if echoed != payload {
            eprintln!("echo-bench: payload mismatch");
            stats.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
        stats.rounds.fetch_add(1, Ordering::Relaxed);
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let host = args.get(1).cloned().unwrap_or_else(|| "127.0.0.1".into());
    let port: u16 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(7070);
    let connections: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(64);
    let rounds: u64 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(1000);
    let payload_bytes: usize = args.get(5).and_then(|s| s.parse().ok()).unwrap_or(512);

    let addr = format!("{}:{}", host, port);
    eprintln!(
        "echo-bench: {} connections x {} rounds x {} bytes against {}",
        connections, rounds, payload_bytes, addr
    );

    let stats = Arc::new(Stats::new());
    let start = Instant::now();

    let reporter = {
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                stats.print(start.elapsed().as_secs_f64());
            }
        })
    };

    let mut tasks = Vec::with_capacity(connections);
    for i in 0..connections {
        tasks.push(tokio::spawn(run_client(
            addr.clone(),
            rounds,
            payload_bytes,
            i as u8,
            Arc::clone(&stats),
        )));
    }
    for t in tasks {
        let _ = t.await;
    }
    reporter.abort();

    let elapsed = start.elapsed().as_secs_f64();
    stats.print(elapsed);
    let bytes = stats.bytes_in.load(Ordering::Relaxed);
    let rounds_done = stats.rounds.load(Ordering::Relaxed);
    eprintln!(
        "echo-bench: {:.0} rounds/s, {:.2} MiB/s echoed",
        rounds_done as f64 / elapsed.max(f64::EPSILON),
        bytes as f64 / (1024.0 * 1024.0) / elapsed.max(f64::EPSILON),
    );

    if stats.errors.load(Ordering::Relaxed) > 0 {
        std::process::exit(1);
    }
}
