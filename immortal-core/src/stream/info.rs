use crate::core::StreamId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Point-in-time description of a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: StreamId,
    pub name: String,
    /// Port of the local service the stream fronts
    pub tcp_port: u16,
    pub created_at: SystemTime,
    pub last_connection_at: Option<SystemTime>,
    pub last_disconnection_at: Option<SystemTime>,
    pub connected: bool,
    /// Bytes forwarded from the local service toward the client
    pub bytes_sent: u64,
    /// Bytes forwarded from the client to the local service
    pub bytes_received: u64,
}

/// Connection timestamps, shared with the pipe's error callback
#[derive(Debug, Default)]
pub(crate) struct Activity {
    inner: Mutex<Timestamps>,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Timestamps {
    pub last_connection_at: Option<SystemTime>,
    pub last_disconnection_at: Option<SystemTime>,
}

impl Activity {
    pub fn connected(&self) {
        self.inner.lock().last_connection_at = Some(SystemTime::now());
    }

    pub fn disconnected(&self) {
        self.inner.lock().last_disconnection_at = Some(SystemTime::now());
    }

    pub fn snapshot(&self) -> Timestamps {
        *self.inner.lock()
    }
}
