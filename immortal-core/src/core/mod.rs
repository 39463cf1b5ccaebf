//! Core building blocks shared by the pipe and stream layers
//!
//! - `Context`: cancellation scopes with deadlines
//! - `Connection`: the byte-stream endpoint a pipe rides on
//! - `MemoryConnection`: bounded in-memory duplex pairs
//! - Domain error types

pub mod connection;
pub mod context;
pub mod errors;
pub mod memory;
pub mod types;

// Re-export commonly used types
pub use connection::{write_all, Connection, SharedConnection};
pub use context::{Context, ContextError};
pub use errors::{PipeError, RingBufferError, StreamError};
pub use memory::{memory_pair, memory_pair_with_capacity, MemoryConnection};
pub use types::StreamId;
