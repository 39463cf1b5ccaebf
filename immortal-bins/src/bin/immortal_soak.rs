//! Immortal Stream Soak Test
//!
//! This binary combines:
//! - A local TCP generator service emitting a verification pattern
//! - A Stream fronting that service
//! - A client that is cut off at random intervals, either from its own side
//!   or by the stream, and reattaches with its read offset
//!
//! Every byte the client receives is checked against the pattern, so a
//! single lost, duplicated or reordered byte fails the run.

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use immortal_bins::common::{
    init_logging, install_shutdown_handler, spawn_metrics_server, CommonArgs,
};
use immortal_core::monitoring::MetricsRegistry;
use immortal_core::testing::{pattern, pattern_mismatch};
use immortal_core::{memory_pair, write_all, Connection, Stream, StreamId};
use rand::Rng;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Soak test for immortal streams")]
struct SoakArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Bytes the generator service emits before the run ends
    #[arg(long, default_value = "67108864")]
    total_bytes: u64,

    /// Size of each generator write
    #[arg(long, default_value = "16384")]
    chunk_size: usize,

    /// Shortest time a client stays attached, in milliseconds
    #[arg(long, default_value = "5")]
    min_attach_ms: u64,

    /// Longest time a client stays attached, in milliseconds
    #[arg(long, default_value = "200")]
    max_attach_ms: u64,
}

#[derive(Debug, Default)]
struct SoakStats {
    attachments: u64,
    client_cuts: u64,
    stream_cuts: u64,
    received: u64,
}

fn main() -> Result<()> {
    let args = SoakArgs::parse();
    let config = args.common.load_config()?;
    init_logging(&config.logging)?;

    if args.min_attach_ms == 0 || args.min_attach_ms > args.max_attach_ms {
        bail!("attach window must satisfy 0 < min_attach_ms <= max_attach_ms");
    }
    if args.chunk_size == 0 {
        bail!("chunk_size must be positive");
    }

    info!("=== Immortal: stream soak test ===");
    info!("Total bytes: {}", args.total_bytes);
    info!(
        "Attach window: {}..={} ms",
        args.min_attach_ms, args.max_attach_ms
    );

    let shutdown = install_shutdown_handler()?;

    let metrics = MetricsRegistry::new().context("Failed to create metrics registry")?;
    let metrics_thread = match &config.metrics {
        Some(server_config) => Some(spawn_metrics_server(
            server_config.clone(),
            metrics.clone(),
            shutdown.clone(),
        )?),
        None => None,
    };

    let port = spawn_generator(args.total_bytes, args.chunk_size)?;
    let stream = Arc::new(Stream::with_metrics(
        StreamId::generate(),
        "soak",
        port,
        config.stream.clone(),
        metrics,
    ));
    let local = TcpStream::connect(("127.0.0.1", port))
        .with_context(|| format!("Failed to connect to generator on port {port}"))?;
    stream.start(local)?;
    info!("Stream {} fronting generator on port {}", stream.id(), port);

    let started = Instant::now();
    let result = run_client(&stream, &args, &shutdown);
    let elapsed = started.elapsed();

    let info = stream.info();
    stream.close()?;
    shutdown.store(true, Ordering::SeqCst);
    if let Some(handle) = metrics_thread {
        if handle.join().is_err() {
            warn!("Metrics thread panicked");
        }
    }

    let stats = result?;
    print_stats(&stats, elapsed);
    info!("Stream bytes sent: {}", info.bytes_sent);

    if stats.received < args.total_bytes {
        warn!(
            "Stopped early after {} of {} bytes",
            stats.received, args.total_bytes
        );
    } else {
        info!("All {} bytes verified", stats.received);
    }

    Ok(())
}

/// Local service: a single connection receiving the pattern
fn spawn_generator(total: u64, chunk: usize) -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("Failed to bind generator")?;
    let port = listener.local_addr()?.port();

    thread::Builder::new()
        .name("generator".to_string())
        .spawn(move || {
            let conn = match listener.accept() {
                Ok((conn, _)) => conn,
                Err(e) => {
                    error!("Generator accept failed: {}", e);
                    return;
                }
            };
            let mut offset = 0u64;
            while offset < total {
                let len = chunk.min((total - offset) as usize);
                if let Err(e) = write_all(&conn, &pattern(offset, len)) {
                    warn!("Generator stopped at offset {}: {}", offset, e);
                    return;
                }
                offset += len as u64;
            }
            info!("Generator finished after {} bytes", offset);
            // Keep the connection open; the stream ends when it sees EOF
            let mut buf = [0u8; 64];
            while matches!(Connection::read(&conn, &mut buf), Ok(n) if n > 0) {}
        })?;

    Ok(port)
}

/// Attach, read until cut, verify, repeat
fn run_client(stream: &Arc<Stream>, args: &SoakArgs, shutdown: &AtomicBool) -> Result<SoakStats> {
    let mut rng = rand::thread_rng();
    let mut stats = SoakStats::default();
    let mut buf = vec![0u8; 64 * 1024];

    while stats.received < args.total_bytes && !shutdown.load(Ordering::SeqCst) {
        let (client, attach) = memory_pair();
        let client = Arc::new(client);
        stream
            .handle_reconnect(attach, stats.received)
            .with_context(|| format!("Reattach at offset {} failed", stats.received))?;
        stats.attachments += 1;

        let attach_for = Duration::from_millis(rng.gen_range(args.min_attach_ms..=args.max_attach_ms));
        let cut_by_stream = rng.gen_bool(0.5);
        let cutter = {
            let client = client.clone();
            let stream = stream.clone();
            thread::spawn(move || {
                thread::sleep(attach_for);
                if cut_by_stream {
                    let _ = stream.force_disconnect();
                } else {
                    let _ = client.close();
                }
            })
        };

        loop {
            match client.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Some(at) = pattern_mismatch(stats.received, &buf[..n]) {
                        bail!(
                            "Byte mismatch at offset {} after {} attachments",
                            at,
                            stats.attachments
                        );
                    }
                    stats.received += n as u64;
                    if stats.received >= args.total_bytes {
                        break;
                    }
                }
            }
        }

        if cutter.join().is_err() {
            warn!("Cutter thread panicked");
        }
        if cut_by_stream {
            stats.stream_cuts += 1;
        } else {
            stats.client_cuts += 1;
        }
        if stream.is_closed() && stats.received < args.total_bytes {
            bail!("Stream closed at offset {}", stats.received);
        }
    }

    Ok(stats)
}

/// Print final statistics
fn print_stats(stats: &SoakStats, elapsed: Duration) {
    info!("=== Final Statistics ===");
    info!("Attachments: {}", stats.attachments);
    info!("Client-side cuts: {}", stats.client_cuts);
    info!("Stream-side cuts: {}", stats.stream_cuts);
    info!("Bytes verified: {}", stats.received);

    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        info!(
            "Throughput: {:.2} MiB/s",
            stats.received as f64 / (1024.0 * 1024.0) / secs
        );
    }
}
