//! Domain error types for the backed pipe stack
//!
//! Transient connection failures never show up here: the reader and writer
//! swallow them and report through error callbacks instead. What remains is
//! lifecycle (closed pipe), handshake failures, and caller context errors.

use super::context::ContextError;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors from [`RingBuffer::read_last`](crate::pipe::RingBuffer::read_last)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RingBufferError {
    /// Nothing has been written yet (or everything was evicted)
    #[error("ring buffer is empty")]
    Empty,

    /// More bytes were requested than the buffer currently holds
    #[error("requested {requested} bytes but only {available} available")]
    Insufficient {
        /// Bytes asked for
        requested: usize,
        /// Bytes currently held
        available: usize,
    },
}

/// Errors surfaced by the backed reader, writer and pipe
///
/// `Clone` so a single reconnect result can be handed to every caller that
/// joined the attempt.
#[derive(Debug, Error, Clone)]
pub enum PipeError {
    /// The pipe was closed; the single terminal error
    #[error("read/write on closed pipe")]
    Closed,

    /// `connect` called while a connection is live
    #[error("pipe is already connected")]
    AlreadyConnected,

    /// The caller's reconnector returned an error
    #[error("reconnect failed: {0:#}")]
    ReconnectFailed(Arc<anyhow::Error>),

    /// The remote acknowledged bytes that were never written
    #[error("remote acknowledged {acknowledged} bytes but only {written} were written")]
    InvalidAcknowledgement {
        /// Remote reader sequence number
        acknowledged: u64,
        /// Local writer sequence number
        written: u64,
    },

    /// The unacknowledged tail was already evicted from the replay buffer
    #[error("replay gap of {gap} bytes exceeds the {buffered} bytes still buffered")]
    ReplayGapTooLarge {
        /// Bytes the remote is missing
        gap: u64,
        /// Bytes the ring buffer still holds
        buffered: usize,
    },

    /// Writing the replay to the new connection failed
    #[error("replay to new connection failed: {0}")]
    Replay(Arc<io::Error>),

    /// Reading the replay slice from the ring buffer failed
    #[error("replay buffer: {0}")]
    Buffer(#[from] RingBufferError),

    /// Closing the underlying connection failed
    #[error("closing connection: {0}")]
    Io(Arc<io::Error>),

    /// The caller's context ended first
    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Errors surfaced by [`Stream`](crate::stream::Stream)
#[derive(Debug, Error, Clone)]
pub enum StreamError {
    /// The stream was closed
    #[error("stream is closed")]
    Closed,

    /// `start` was called twice
    #[error("stream already started")]
    AlreadyStarted,

    /// A client tried to attach before `start`
    #[error("stream not started")]
    NotStarted,

    /// The client-side pipe failed
    #[error(transparent)]
    Pipe(#[from] PipeError),
}

impl PipeError {
    /// Whether this is the terminal closed-pipe error
    pub fn is_closed(&self) -> bool {
        matches!(self, PipeError::Closed)
    }
}

impl From<PipeError> for io::Error {
    fn from(err: PipeError) -> Self {
        let kind = match &err {
            PipeError::Closed => io::ErrorKind::BrokenPipe,
            PipeError::Context(_) => io::ErrorKind::TimedOut,
            PipeError::AlreadyConnected => io::ErrorKind::AlreadyExists,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
