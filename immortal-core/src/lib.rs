//! Immortal Core - byte streams that survive connection loss
//!
//! A [`BackedPipe`] looks like one long-lived duplex byte stream even though
//! the connection underneath may be dropped and replaced any number of
//! times. Both sides count the bytes they have read; on reconnect they swap
//! those counts and each writer replays exactly what its peer is missing
//! from a bounded ring buffer.
//!
//! ## Architecture
//! - **Synchronous**: blocking reads and writes on plain threads
//! - **Single-flight reconnects**: concurrent triggers share one dial
//! - **Generation tracking**: errors from replaced connections are ignored
//! - **Pluggable dialing**: the caller's [`Reconnector`] owns transport and
//!   handshake, the pipe owns replay
//!
//! ## Core Modules
//! - `core`: `Connection`, `Context`, in-memory pairs, error types
//! - `pipe`: ring buffer, backed reader and writer, `BackedPipe`
//! - `stream`: `Stream`, a local service bridged to reattachable clients
//! - `resilience`: retry policies for automatic reconnects
//! - `monitoring`: Prometheus metrics and the scrape endpoint
//! - `config`: JSON configuration
//! - `testing`: mock connections and scripted reconnectors

pub mod config;
pub mod core;
pub mod monitoring;
pub mod pipe;
pub mod resilience;
pub mod stream;
pub mod testing;
pub mod utils;

// Re-export core types
pub use crate::core::{
    memory_pair, memory_pair_with_capacity, write_all, Connection, Context, ContextError,
    MemoryConnection, PipeError, RingBufferError, SharedConnection, StreamError, StreamId,
};

pub use config::{Config, LoggingConfig, PipeConfig, StreamConfig};
pub use monitoring::{MetricsRegistry, MetricsServer, MetricsServerConfig};
pub use pipe::{BackedPipe, BackedReader, BackedWriter, Reconnected, Reconnector, RingBuffer};
pub use resilience::{BackoffConfig, ExponentialBackoff, NoRetry, RetryPolicy};
pub use stream::{Stream, StreamInfo};

// Re-export error types
pub use anyhow::{Error, Result};

/// Prelude for convenient imports
pub mod prelude {
    // Connections and cancellation
    pub use crate::core::{
        memory_pair, memory_pair_with_capacity, Connection, Context, ContextError,
        MemoryConnection, SharedConnection,
    };

    // Pipes and streams
    pub use crate::pipe::{BackedPipe, Reconnected, Reconnector};
    pub use crate::stream::{Stream, StreamInfo};
    pub use crate::core::StreamId;

    // Configuration
    pub use crate::config::{PipeConfig, StreamConfig};

    // Error types
    pub use crate::core::{PipeError, StreamError};
}
