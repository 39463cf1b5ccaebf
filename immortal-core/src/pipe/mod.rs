//! Sequence-tracked replay over replaceable connections
//!
//! - `RingBuffer`: bounded replay storage
//! - `BackedReader` / `BackedWriter`: halves that hide disconnects
//! - `BackedPipe`: duplex façade with single-flight reconnection
//! - `Reconnector`: caller-supplied dial and handshake

pub mod backed_pipe;
pub mod backed_reader;
pub mod backed_writer;
pub mod events;
pub mod reconnector;
pub mod ring_buffer;
pub mod singleflight;

mod ring_buffer_proptest;

pub use backed_pipe::{BackedPipe, Trigger};
pub use backed_reader::BackedReader;
pub use backed_writer::BackedWriter;
pub use events::{Component, ErrorCallback, ErrorEvent};
pub use reconnector::{Reconnected, Reconnector};
pub use ring_buffer::{RingBuffer, DEFAULT_RING_CAPACITY};
pub use singleflight::SingleFlight;
