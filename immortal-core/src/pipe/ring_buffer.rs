//! Fixed-capacity circular byte store with FIFO eviction
//!
//! Holds the trailing bytes written through a backed writer so they can be
//! replayed to a reattached peer. The allocation is made once and never
//! grows, which puts a hard bound on how much unacknowledged data can ever
//! be replayed.

use crate::core::RingBufferError;
use parking_lot::RwLock;

/// Default capacity: 64 MiB
pub const DEFAULT_RING_CAPACITY: usize = 64 * 1024 * 1024;

/// Circular byte buffer keeping the most recent `capacity` bytes
pub struct RingBuffer {
    inner: RwLock<RingState>,
}

struct RingState {
    buf: Box<[u8]>,
    /// Index of the oldest byte
    start: usize,
    /// Bytes currently held
    size: usize,
}

impl RingState {
    #[inline]
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Copy `data` in at `pos`, wrapping at the end of the allocation
    fn copy_in(&mut self, pos: usize, data: &[u8]) {
        let cap = self.capacity();
        let first = data.len().min(cap - pos);
        self.buf[pos..pos + first].copy_from_slice(&data[..first]);
        self.buf[..data.len() - first].copy_from_slice(&data[first..]);
    }
}

impl RingBuffer {
    /// Create a buffer holding at most `capacity` bytes
    ///
    /// # Panics
    /// If `capacity` is zero; configuration validation rejects that earlier.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            inner: RwLock::new(RingState {
                buf: vec![0u8; capacity].into_boxed_slice(),
                start: 0,
                size: 0,
            }),
        }
    }

    /// Append `data`, evicting the oldest bytes to make room
    ///
    /// Returns `(written, evicted)`. Input longer than the capacity keeps only
    /// its trailing `capacity` bytes.
    pub fn write(&self, data: &[u8]) -> (usize, usize) {
        if data.is_empty() {
            return (0, 0);
        }

        let mut state = self.inner.write();
        let cap = state.capacity();

        if data.len() > cap {
            let evicted = data.len() - cap;
            state.buf.copy_from_slice(&data[evicted..]);
            state.start = 0;
            state.size = cap;
            return (cap, evicted);
        }

        let free = cap - state.size;
        let evicted = data.len().saturating_sub(free);
        if evicted > 0 {
            state.start = (state.start + evicted) % cap;
            state.size -= evicted;
        }

        let end = (state.start + state.size) % cap;
        state.copy_in(end, data);
        state.size += data.len();

        (data.len(), evicted)
    }

    /// Copy out the most recent `n` bytes without consuming them
    pub fn read_last(&self, n: usize) -> Result<Vec<u8>, RingBufferError> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let state = self.inner.read();
        if state.size == 0 {
            return Err(RingBufferError::Empty);
        }
        if n > state.size {
            return Err(RingBufferError::Insufficient {
                requested: n,
                available: state.size,
            });
        }

        let cap = state.capacity();
        let from = (state.start + state.size - n) % cap;
        let first = n.min(cap - from);

        let mut out = Vec::with_capacity(n);
        out.extend_from_slice(&state.buf[from..from + first]);
        out.extend_from_slice(&state.buf[..n - first]);
        Ok(out)
    }

    /// Bytes currently held
    pub fn len(&self) -> usize {
        self.inner.read().size
    }

    /// Whether nothing is held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed capacity
    pub fn capacity(&self) -> usize {
        self.inner.read().capacity()
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.read();
        f.debug_struct("RingBuffer")
            .field("capacity", &state.capacity())
            .field("size", &state.size)
            .field("start", &state.start)
            .finish()
    }
}
