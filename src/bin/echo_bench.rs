//! echo-bench: load generator for the tcp-engines server.
//!
//! Opens one thread per client; each sends a fixed number of lines, waits for
//! one reply per line, then disconnects. Totals are logged when all clients
//! have finished.

use clap::Parser;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[command(name = "echo-bench")]
#[command(about = "Benchmark client for the tcp-engines echo server", long_about = None)]
struct BenchArgs {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 18081)]
    port: u16,

    /// Number of concurrent clients
    #[arg(short, long, default_value_t = 100)]
    clients: usize,

    /// Messages per client
    #[arg(short, long, default_value_t = 10)]
    messages: usize,

    /// Pause between messages, in milliseconds
    #[arg(short, long, default_value_t = 100)]
    interval: u64,
}

#[derive(Default)]
struct BenchStats {
    connections_ok: AtomicU64,
    connections_failed: AtomicU64,
    messages_ok: AtomicU64,
    messages_failed: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Megabits per second for `bytes` moved in `elapsed`.
fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    bytes as f64 * 8.0 / (1024.0 * 1024.0) / secs
}

fn run_client(id: usize, args: &BenchArgs, stats: &BenchStats) {
    let mut stream = match TcpStream::connect((args.host.as_str(), args.port)) {
        Ok(stream) => stream,
        Err(e) => {
            debug!(client = id, error = %e, "Connect failed");
            stats.connections_failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    stats.connections_ok.fetch_add(1, Ordering::Relaxed);

    let mut buf = [0u8; 1024];
    for n in 1..=args.messages {
        let message = format!("Hello from client {id} message {n}\n");

        match stream.write_all(message.as_bytes()) {
            Ok(()) => {
                stats.messages_ok.fetch_add(1, Ordering::Relaxed);
                stats
                    .bytes_sent
                    .fetch_add(message.len() as u64, Ordering::Relaxed);

                match stream.read(&mut buf) {
                    Ok(received) if received > 0 => {
                        stats
                            .bytes_received
                            .fetch_add(received as u64, Ordering::Relaxed);
                    }
                    _ => {
                        stats.messages_failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(e) => {
                debug!(client = id, error = %e, "Send failed");
                stats.messages_failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        if args.interval > 0 {
            thread::sleep(Duration::from_millis(args.interval));
        }
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let args = BenchArgs::parse();
    info!(
        clients = args.clients,
        messages = args.messages,
        target = %format!("{}:{}", args.host, args.port),
        "Starting benchmark"
    );

    let stats = Arc::new(BenchStats::default());
    let started = Instant::now();

    let handles: Vec<_> = (0..args.clients)
        .filter_map(|id| {
            let args = args.clone();
            let stats = Arc::clone(&stats);
            thread::Builder::new()
                .name(format!("client-{id}"))
                .spawn(move || run_client(id, &args, &stats))
                .inspect_err(|e| warn!(client = id, error = %e, "Failed to spawn client thread"))
                .ok()
        })
        .collect();

    for handle in handles {
        if handle.join().is_err() {
            warn!("Client thread panicked");
        }
    }

    let elapsed = started.elapsed();
    let messages_ok = stats.messages_ok.load(Ordering::Relaxed);
    let sent = stats.bytes_sent.load(Ordering::Relaxed);
    let received = stats.bytes_received.load(Ordering::Relaxed);
    let msg_per_sec = if elapsed.as_secs_f64() > 0.0 {
        messages_ok as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };

    info!(
        duration_ms = elapsed.as_millis() as u64,
        connections_ok = stats.connections_ok.load(Ordering::Relaxed),
        connections_failed = stats.connections_failed.load(Ordering::Relaxed),
        messages_ok,
        messages_failed = stats.messages_failed.load(Ordering::Relaxed),
        bytes_sent = sent,
        bytes_received = received,
        "Benchmark results"
    );
    info!(
        msg_per_sec = %format!("{msg_per_sec:.2}"),
        sent_mbps = %format!("{:.2}", mbps(sent, elapsed)),
        received_mbps = %format!("{:.2}", mbps(received, elapsed)),
        "Throughput"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = BenchArgs::parse_from(["echo-bench"]);
        assert_eq!(args.host, "127.0.0.1");
        assert_eq!(args.port, 18081);
        assert_eq!(args.clients, 100);
        assert_eq!(args.messages, 10);
        assert_eq!(args.interval, 100);
    }

    #[test]
    fn test_short_flags() {
        let args = BenchArgs::parse_from(["echo-bench", "-p", "9000", "-c", "5", "-m", "3", "-i", "0"]);
        assert_eq!(args.port, 9000);
        assert_eq!(args.clients, 5);
        assert_eq!(args.messages, 3);
        assert_eq!(args.interval, 0);
    }

    #[test]
    fn test_mbps() {
        assert_eq!(mbps(1024 * 1024, Duration::from_secs(8)), 1.0);
        assert_eq!(mbps(100, Duration::ZERO), 0.0);
    }
}
