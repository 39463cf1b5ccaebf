use crate::monitoring::MetricsServerConfig;
use crate::pipe::DEFAULT_RING_CAPACITY;
use crate::resilience::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stream: StreamConfig,
    pub logging: LoggingConfig,
    /// Metrics endpoint; disabled when absent
    pub metrics: Option<MetricsServerConfig>,
}

/// Backed pipe configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Name used in logs and as the `pipe` metrics label
    pub name: String,

    /// Replay buffer size in bytes; bounds how far a peer may fall behind
    pub ring_capacity: usize,

    /// Retry policy for reconnects after connection loss (None = never retry)
    pub retry: Option<BackoffConfig>,

    /// Reconnect on connection loss; when false the pipe stays
    /// disconnected until `connect` or `force_reconnect`
    pub auto_reconnect: bool,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            name: "pipe".to_string(),
            ring_capacity: DEFAULT_RING_CAPACITY,
            retry: None,
            auto_reconnect: true,
        }
    }
}

impl PipeConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Stream configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Pipe carrying the client side
    pub pipe: PipeConfig,

    /// Buffer size for each copy direction
    pub copy_buffer_size: usize,

    /// How long `handle_reconnect` waits for the replay handshake
    #[serde(with = "super::duration_ms", rename = "handshake_timeout_ms")]
    pub handshake_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            pipe: PipeConfig::default(),
            copy_buffer_size: 32 * 1024,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
