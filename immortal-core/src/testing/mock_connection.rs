//! Scriptable connection for exercising pipe failure paths
//!
//! Inbound bytes are queued by the test, outbound bytes are captured, and
//! read or write errors can be injected at any point. Reads block like a
//! socket until data, end of stream, an injected error, or `close`.

use crate::core::Connection;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct MockState {
    inbound: VecDeque<u8>,
    inbound_closed: bool,
    outbound: Vec<u8>,
    read_error: Option<io::ErrorKind>,
    write_error: Option<io::ErrorKind>,
    closed: bool,
    reads: usize,
    writes: usize,
}

/// In-memory connection with error injection
#[derive(Default)]
pub struct MockConnection {
    state: Mutex<MockState>,
    cond: Condvar,
}

impl MockConnection {
    /// Connection with nothing to read yet
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connection with `data` already waiting to be read
    pub fn with_inbound(data: &[u8]) -> Arc<Self> {
        let conn = Self::new();
        conn.push_inbound(data);
        conn
    }

    /// Queue bytes for the next reads
    pub fn push_inbound(&self, data: &[u8]) {
        let mut state = self.state.lock();
        state.inbound.extend(data);
        self.cond.notify_all();
    }

    /// Reads return end of stream once the queue drains
    pub fn close_inbound(&self) {
        self.state.lock().inbound_closed = true;
        self.cond.notify_all();
    }

    /// Fail every following read with `kind`
    pub fn set_read_error(&self, kind: io::ErrorKind) {
        self.state.lock().read_error = Some(kind);
        self.cond.notify_all();
    }

    /// Fail every following write with `kind`
    pub fn set_write_error(&self, kind: io::ErrorKind) {
        self.state.lock().write_error = Some(kind);
    }

    pub fn clear_errors(&self) {
        let mut state = self.state.lock();
        state.read_error = None;
        state.write_error = None;
    }

    /// Everything written so far
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().outbound.clone()
    }

    /// Block until at least `len` bytes were written or `timeout` passes
    pub fn wait_written(&self, len: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.outbound.len() < len {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return state.outbound.len() >= len;
            }
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Calls to `read` that returned
    pub fn read_calls(&self) -> usize {
        self.state.lock().reads
    }

    /// Calls to `write` that returned
    pub fn write_calls(&self) -> usize {
        self.state.lock().writes
    }
}

impl Connection for MockConnection {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let result = loop {
            if let Some(kind) = state.read_error {
                break Err(io::Error::new(kind, "injected read error"));
            }
            if state.closed {
                break Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "mock connection closed",
                ));
            }
            if !state.inbound.is_empty() {
                let n = buf.len().min(state.inbound.len());
                for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
                    *slot = byte;
                }
                break Ok(n);
            }
            if state.inbound_closed {
                break Ok(0);
            }
            self.cond.wait(&mut state);
        };
        state.reads += 1;
        result
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.writes += 1;
        if let Some(kind) = state.write_error {
            return Err(io::Error::new(kind, "injected write error"));
        }
        if state.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock connection closed",
            ));
        }
        state.outbound.extend_from_slice(buf);
        self.cond.notify_all();
        Ok(buf.len())
    }

    fn close(&self) -> io::Result<()> {
        self.state.lock().closed = true;
        self.cond.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_reads_queued_bytes_in_order() {
        let conn = MockConnection::with_inbound(b"abcdef");
        let mut buf = [0u8; 4];
        assert_eq!(conn.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(conn.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[test]
    fn test_injected_errors() {
        let conn = MockConnection::new();
        conn.set_write_error(io::ErrorKind::ConnectionReset);
        assert_eq!(
            conn.write(b"x").unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );

        conn.clear_errors();
        assert_eq!(conn.write(b"x").unwrap(), 1);
        assert_eq!(conn.written(), b"x");
    }

    #[test]
    fn test_close_unblocks_reader() {
        let conn = MockConnection::new();
        let reader = conn.clone();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 1];
            reader.read(&mut buf)
        });

        thread::sleep(Duration::from_millis(20));
        conn.close().unwrap();
        let err = handle.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(conn.write(b"x").is_err());
    }

    #[test]
    fn test_wait_written() {
        let conn = MockConnection::new();
        assert!(!conn.wait_written(1, Duration::from_millis(10)));

        let writer = conn.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            writer.write(b"late").unwrap();
        });
        assert!(conn.wait_written(4, Duration::from_secs(5)));
    }
}
