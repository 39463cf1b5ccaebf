//! Testing utilities for pipes, streams and their integration tests
//!
//! - `MockConnection`: scriptable connection with error injection
//! - `ScriptedReconnector`: queued reconnect outcomes, call tracking, gating
//! - Byte-pattern and polling helpers

pub mod helpers;
pub mod mock_connection;
pub mod scripted;

pub use helpers::*;
pub use mock_connection::MockConnection;
pub use scripted::ScriptedReconnector;
