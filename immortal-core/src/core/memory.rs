//! In-memory duplex connections
//!
//! [`memory_pair`] returns two connected endpoints, each direction backed by a
//! bounded byte queue. Writers block while the queue is full, which keeps the
//! amount of in-flight data bounded. Closing an endpoint lets the peer drain
//! what was already queued and then read end-of-stream; writes in either
//! direction fail once either side has closed.

use super::connection::Connection;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

/// Default per-direction queue size
pub const DEFAULT_MEMORY_CAPACITY: usize = 64 * 1024;

struct Direction {
    state: Mutex<DirectionState>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
}

struct DirectionState {
    queue: VecDeque<u8>,
    writer_closed: bool,
    reader_closed: bool,
}

impl Direction {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DirectionState {
                queue: VecDeque::new(),
                writer_closed: false,
                reader_closed: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity: capacity.max(1),
        })
    }
}

/// One end of an in-memory duplex connection
pub struct MemoryConnection {
    inbound: Arc<Direction>,
    outbound: Arc<Direction>,
}

/// Create a connected pair with the default queue size
pub fn memory_pair() -> (MemoryConnection, MemoryConnection) {
    memory_pair_with_capacity(DEFAULT_MEMORY_CAPACITY)
}

/// Create a connected pair whose queues hold at most `capacity` bytes each way
pub fn memory_pair_with_capacity(capacity: usize) -> (MemoryConnection, MemoryConnection) {
    let a_to_b = Direction::new(capacity);
    let b_to_a = Direction::new(capacity);

    let a = MemoryConnection {
        inbound: b_to_a.clone(),
        outbound: a_to_b.clone(),
    };
    let b = MemoryConnection {
        inbound: a_to_b,
        outbound: b_to_a,
    };
    (a, b)
}

impl MemoryConnection {
    /// Bytes queued for this endpoint that have not been read yet
    pub fn pending(&self) -> usize {
        self.inbound.state.lock().queue.len()
    }
}

impl Connection for MemoryConnection {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.inbound.state.lock();
        loop {
            if state.reader_closed {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "read on closed memory connection",
                ));
            }
            if !state.queue.is_empty() {
                let n = buf.len().min(state.queue.len());
                for (slot, byte) in buf.iter_mut().zip(state.queue.drain(..n)) {
                    *slot = byte;
                }
                self.inbound.writable.notify_all();
                return Ok(n);
            }
            if state.writer_closed {
                return Ok(0);
            }
            self.inbound.readable.wait(&mut state);
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.outbound.state.lock();
        loop {
            if state.writer_closed || state.reader_closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "write on closed memory connection",
                ));
            }
            let space = self.outbound.capacity.saturating_sub(state.queue.len());
            if space > 0 {
                let n = space.min(buf.len());
                state.queue.extend(&buf[..n]);
                self.outbound.readable.notify_all();
                return Ok(n);
            }
            self.outbound.writable.wait(&mut state);
        }
    }

    fn close(&self) -> io::Result<()> {
        {
            let mut state = self.inbound.state.lock();
            state.reader_closed = true;
            state.queue.clear();
            self.inbound.readable.notify_all();
            self.inbound.writable.notify_all();
        }
        {
            let mut state = self.outbound.state.lock();
            state.writer_closed = true;
            self.outbound.readable.notify_all();
            self.outbound.writable.notify_all();
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let _ = Connection::close(self);
    }
}
