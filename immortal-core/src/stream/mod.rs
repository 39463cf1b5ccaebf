//! Immortal streams
//!
//! A [`Stream`] keeps a local service connection alive across client
//! disconnects. Each client reattaches with the number of stream bytes it
//! already received and gets back the number of its own bytes the stream
//! received, so both directions resume without loss or duplication.

mod handoff;
pub mod immortal_stream;
pub mod info;

pub use immortal_stream::Stream;
pub use info::StreamInfo;
