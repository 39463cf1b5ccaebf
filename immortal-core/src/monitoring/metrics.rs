//! Prometheus metrics for pipes and streams
//!
//! Provides metric families for:
//! - Reconnects (attempts, successes, failures by trigger)
//! - Dropped connections by component
//! - Traffic (bytes written, read, replayed)
//! - Stream lifecycle (active streams, client reattachments)
//!
//! Every pipe family carries a `pipe` label with the pipe's configured name.

use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use std::sync::Arc;
use tracing::info;

const NAMESPACE: &str = "immortal";

/// Central registry for all Prometheus metrics
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<Registry>,
    pipes: Arc<PipeMetrics>,
    streams: Arc<StreamMetrics>,
}

impl MetricsRegistry {
    /// Create a new registry with all metric families registered
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let pipes = Arc::new(PipeMetrics::new(&registry)?);
        let streams = Arc::new(StreamMetrics::new(&registry)?);

        info!("Prometheus metrics registry initialized");

        Ok(Self {
            registry,
            pipes,
            streams,
        })
    }

    /// Underlying Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pipes(&self) -> &PipeMetrics {
        &self.pipes
    }

    pub fn streams(&self) -> &StreamMetrics {
        &self.streams
    }
}

/// Backed pipe metrics
pub struct PipeMetrics {
    /// Reconnection procedures started, by `pipe` and `trigger`
    pub reconnect_attempts_total: IntCounterVec,
    /// Reconnection procedures that installed a connection
    pub reconnect_successes_total: IntCounterVec,
    /// Reconnection procedures that failed
    pub reconnect_failures_total: IntCounterVec,
    /// Connections dropped after an I/O error, by `pipe` and `component`
    pub connection_errors_total: IntCounterVec,
    /// Bytes accepted by `write`
    pub bytes_written_total: IntCounterVec,
    /// Bytes returned by `read`
    pub bytes_read_total: IntCounterVec,
    /// Bytes resent to a fresh connection
    pub bytes_replayed_total: IntCounterVec,
    /// 1 while connected, 0 otherwise
    pub connected: IntGaugeVec,
}

fn counter(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let family = IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)?;
    registry.register(Box::new(family.clone()))?;
    Ok(family)
}

impl PipeMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let reconnect_attempts_total = counter(
            registry,
            "pipe_reconnect_attempts_total",
            "Reconnection procedures started",
            &["pipe", "trigger"],
        )?;
        let reconnect_successes_total = counter(
            registry,
            "pipe_reconnect_successes_total",
            "Reconnection procedures that installed a connection",
            &["pipe", "trigger"],
        )?;
        let reconnect_failures_total = counter(
            registry,
            "pipe_reconnect_failures_total",
            "Reconnection procedures that failed",
            &["pipe", "trigger"],
        )?;
        let connection_errors_total = counter(
            registry,
            "pipe_connection_errors_total",
            "Connections dropped after an I/O error",
            &["pipe", "component"],
        )?;
        let bytes_written_total = counter(
            registry,
            "pipe_bytes_written_total",
            "Bytes accepted by write",
            &["pipe"],
        )?;
        let bytes_read_total = counter(
            registry,
            "pipe_bytes_read_total",
            "Bytes returned by read",
            &["pipe"],
        )?;
        let bytes_replayed_total = counter(
            registry,
            "pipe_bytes_replayed_total",
            "Bytes resent to a fresh connection",
            &["pipe"],
        )?;

        let connected = IntGaugeVec::new(
            Opts::new(
                "pipe_connected",
                "Connection status (1 = connected, 0 = disconnected)",
            )
            .namespace(NAMESPACE),
            &["pipe"],
        )?;
        registry.register(Box::new(connected.clone()))?;

        Ok(Self {
            reconnect_attempts_total,
            reconnect_successes_total,
            reconnect_failures_total,
            connection_errors_total,
            bytes_written_total,
            bytes_read_total,
            bytes_replayed_total,
            connected,
        })
    }
}

/// Stream lifecycle metrics
pub struct StreamMetrics {
    /// Streams started and not yet closed
    pub active: IntGauge,
    /// Client connections handed to `handle_reconnect`, by `stream`
    pub client_reconnects_total: IntCounterVec,
}

impl StreamMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let active = IntGauge::new("immortal_streams_active", "Streams currently running")?;
        registry.register(Box::new(active.clone()))?;

        let client_reconnects_total = counter(
            registry,
            "stream_client_reconnects_total",
            "Client connections attached to a stream",
            &["stream"],
        )?;

        Ok(Self {
            active,
            client_reconnects_total,
        })
    }
}
