//! Reader that blocks instead of failing while disconnected
//!
//! `read` parks on a condition variable until a connection is installed or
//! the reader is closed. I/O errors (and end of stream) drop the connection,
//! notify the error callback and go back to waiting, so a disconnect is never
//! visible to the caller. `sequence_num` counts every byte handed out.
//!
//! Reconnection is a two-call handshake: [`BackedReader::begin_reconnect`]
//! reports how much has been read, the orchestrator dials without holding
//! any reader lock, then [`BackedReader::complete_reconnect`] installs the
//! result. Reads still running on a replaced connection are counted once
//! they return; [`BackedReader::settle`] waits for them so the sequence
//! number reported to the next connection includes every delivered byte.

use super::events::{eof_error, Component, ErrorCallback, ErrorEvent};
use crate::core::{Context, ContextError, PipeError, SharedConnection};
use parking_lot::{Condvar, Mutex, RwLock};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How often `settle` re-checks its context
const SETTLE_SLICE: Duration = Duration::from_millis(25);

struct ReaderState {
    conn: Option<SharedConnection>,
    generation: u64,
    sequence_num: u64,
    /// Calls currently inside `Connection::read`
    in_flight: usize,
    closed: bool,
}

impl ReaderState {
    fn finish_read(&mut self, cond: &Condvar) {
        self.in_flight -= 1;
        if self.in_flight == 0 {
            cond.notify_all();
        }
    }
}

/// Reader over a hot-swappable, unreliable connection
pub struct BackedReader {
    state: Mutex<ReaderState>,
    cond: Condvar,
    /// Mirrors `state.conn.is_some()` so status checks never contend with reads
    connected: AtomicBool,
    on_error: RwLock<Option<ErrorCallback>>,
}

impl BackedReader {
    /// Create a disconnected reader
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ReaderState {
                conn: None,
                generation: 0,
                sequence_num: 0,
                in_flight: 0,
                closed: false,
            }),
            cond: Condvar::new(),
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

    /// Read into `buf`, blocking while disconnected
    ///
    /// Returns `PipeError::Closed` once the reader is closed, including for
    /// calls that were blocked when `close` ran.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, PipeError> {
        loop {
            let (conn, generation) = {
                let mut state = self.state.lock();
                let conn = loop {
                    if state.closed {
                        return Err(PipeError::Closed);
                    }
                    if let Some(conn) = &state.conn {
                        break conn.clone();
                    }
                    self.cond.wait(&mut state);
                };
                if buf.is_empty() {
                    return Ok(0);
                }
                state.in_flight += 1;
                (conn, state.generation)
            };

            // No lock held here: close and reconnect must not wait on the network
            let result = conn.read(buf);

            let mut state = self.state.lock();
            state.finish_read(&self.cond);
            let error = match result {
                Ok(n) if n > 0 => {
                    state.sequence_num += n as u64;
                    return Ok(n);
                }
                Ok(_) => eof_error(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => e,
            };

            if state.closed {
                return Err(PipeError::Closed);
            }
            if state.generation != generation {
                // Already replaced by a reconnect; retry on the new connection
                continue;
            }
            state.conn = None;
            self.connected.store(false, Ordering::SeqCst);
            drop(state);

            debug!(generation, error = %error, "backed reader lost connection");
            self.notify(ErrorEvent::new(Component::Reader, generation, error));
        }
    }

    fn notify(&self, event: ErrorEvent) {
        let callback = self.on_error.read().clone();
        if let Some(callback) = callback {
            callback(&event);
        }
    }

    /// First half of the reconnect handshake
    ///
    /// Returns the current sequence number, or 0 when closed (nothing to
    /// negotiate).
    pub fn begin_reconnect(&self) -> u64 {
        let state = self.state.lock();
        if state.closed {
            0
        } else {
            state.sequence_num
        }
    }

    /// Second half of the reconnect handshake
    ///
    /// `None` means the attempt failed upstream and leaves the reader as it
    /// was. Otherwise the connection is installed, blocked reads wake up and
    /// the new generation is returned (`None` if the reader is closed).
    pub fn complete_reconnect(&self, conn: Option<SharedConnection>) -> Option<u64> {
        let conn = conn?;
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.conn = Some(conn);
        state.generation += 1;
        self.connected.store(true, Ordering::SeqCst);
        self.cond.notify_all();
        Some(state.generation)
    }

    /// Wait until reads started on earlier connections have returned
    ///
    /// Call after the old connection is closed so those reads are unblocked.
    /// Returns immediately once the reader is closed.
    pub fn settle(&self, ctx: &Context) -> Result<(), ContextError> {
        let mut state = self.state.lock();
        while state.in_flight > 0 && !state.closed {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            self.cond.wait_for(&mut state, ctx.wait_slice(SETTLE_SLICE));
        }
        Ok(())
    }

    /// Drop the current connection without reporting an error
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        if state.conn.take().is_some() {
            state.generation += 1;
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Close the reader; idempotent
    pub fn close(&self) -> Result<(), PipeError> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.conn = None;
        self.connected.store(false, Ordering::SeqCst);
        self.cond.notify_all();
        Ok(())
    }

    /// Total bytes delivered to callers
    pub fn sequence_num(&self) -> u64 {
        self.state.lock().sequence_num
    }

    /// Whether a connection is installed
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Current connection generation
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Default for BackedReader {
    fn default() -> Self {
        Self::new()
    }
}
