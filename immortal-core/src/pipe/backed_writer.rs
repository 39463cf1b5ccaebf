//! Writer that buffers everything it accepts for replay
//!
//! Every write lands in the [`RingBuffer`] and advances the sequence number
//! whether or not a connection is installed. When connected the bytes are
//! also forwarded; a forwarding failure drops the connection and reports an
//! [`ErrorEvent`], but the write still succeeds because the data can be
//! replayed later.

use super::events::{Component, ErrorCallback, ErrorEvent};
use super::ring_buffer::RingBuffer;
use crate::core::{write_all, PipeError, SharedConnection};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

struct WriterState {
    conn: Option<SharedConnection>,
    generation: u64,
    sequence_num: u64,
    replayed: u64,
    closed: bool,
}

/// Writer over a hot-swappable, unreliable connection
pub struct BackedWriter {
    buffer: RingBuffer,
    state: Mutex<WriterState>,
    /// Mirrors `state.conn.is_some()`; readable while a write holds the lock
    connected: AtomicBool,
    on_error: RwLock<Option<ErrorCallback>>,
}

impl BackedWriter {
    /// Create a disconnected writer with a replay buffer of `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: RingBuffer::new(capacity),
            state: Mutex::new(WriterState {
                conn: None,
                generation: 0,
                sequence_num: 0,
                replayed: 0,
                closed: false,
            }),
            connected: AtomicBool::new(false),
            on_error: RwLock::new(None),
        }
    }

    /// Install the callback invoked when a connection is dropped
    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        *self.on_error.write() = Some(Arc::new(callback));
    }

    /// Buffer `buf` and forward it if connected
    ///
    /// Always reports the full length on success. Forwarding happens under
    /// the writer lock so concurrent writes reach the wire in the same order
    /// they reach the buffer.
    pub fn write(&self, buf: &[u8]) -> Result<usize, PipeError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PipeError::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        self.buffer.write(buf);
        state.sequence_num += buf.len() as u64;

        let Some(conn) = state.conn.clone() else {
            return Ok(buf.len());
        };

        if let Err(error) = write_all(conn.as_ref(), buf) {
            let generation = state.generation;
            state.conn = None;
            self.connected.store(false, Ordering::SeqCst);
            drop(state);

            debug!(generation, error = %error, "backed writer lost connection");
            self.notify(ErrorEvent::new(Component::Writer, generation, error));
        }

        Ok(buf.len())
    }

    fn notify(&self, event: ErrorEvent) {
        let callback = self.on_error.read().clone();
        if let Some(callback) = callback {
            callback(&event);
        }
    }

    /// First half of the reconnect handshake: bytes written so far
    pub fn begin_reconnect(&self) -> u64 {
        self.state.lock().sequence_num
    }

    /// Replay what the remote is missing, then install `conn`
    ///
    /// `remote_reader_seq` is how many of our bytes the remote has already
    /// received. Replay and installation happen inside one critical section,
    /// so no application write can reach `conn` ahead of the replayed tail.
    /// Returns the new connection generation.
    pub fn complete_reconnect(
        &self,
        conn: SharedConnection,
        remote_reader_seq: u64,
    ) -> Result<u64, PipeError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PipeError::Closed);
        }

        if remote_reader_seq > state.sequence_num {
            return Err(PipeError::InvalidAcknowledgement {
                acknowledged: remote_reader_seq,
                written: state.sequence_num,
            });
        }

        let gap = state.sequence_num - remote_reader_seq;
        let buffered = self.buffer.len();
        if gap > buffered as u64 {
            return Err(PipeError::ReplayGapTooLarge { gap, buffered });
        }

        if gap > 0 {
            let replay = self.buffer.read_last(gap as usize)?;
            write_all(conn.as_ref(), &replay).map_err(|e| PipeError::Replay(Arc::new(e)))?;
            state.replayed += gap;
            debug!(gap, remote_reader_seq, "replayed unacknowledged bytes");
        }

        state.conn = Some(conn);
        state.generation += 1;
        self.connected.store(true, Ordering::SeqCst);
        Ok(state.generation)
    }

    /// Drop the current connection without reporting an error
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        if state.conn.take().is_some() {
            state.generation += 1;
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Close the writer; idempotent
    pub fn close(&self) -> Result<(), PipeError> {
        let mut state = self.state.lock();
        state.closed = true;
        state.conn = None;
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Total bytes accepted by `write`
    pub fn sequence_num(&self) -> u64 {
        self.state.lock().sequence_num
    }

    /// Total bytes resent by reconnect handshakes
    pub fn replayed_bytes(&self) -> u64 {
        self.state.lock().replayed
    }

    /// Whether a connection is installed
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Current connection generation
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Bytes currently available for replay
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Replay buffer capacity
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
