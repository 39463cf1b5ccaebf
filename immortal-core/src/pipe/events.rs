//! Connection-loss notifications
//!
//! The backed reader and writer never surface transient I/O errors to their
//! callers. Instead they drop the failed connection and report an
//! [`ErrorEvent`] through the installed [`ErrorCallback`].

use std::fmt;
use std::io;
use std::sync::Arc;

/// Which half of the pipe observed the failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Reader,
    Writer,
}

impl Component {
    /// Stable lowercase name, used as a metrics label
    pub const fn as_str(&self) -> &'static str {
        match self {
            Component::Reader => "reader",
            Component::Writer => "writer",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connection was dropped after an I/O error or end of stream
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// Side that saw the error
    pub component: Component,
    /// Connection generation of the component when the error happened
    pub generation: u64,
    /// The raw error; end of stream is reported as `UnexpectedEof`
    pub error: Arc<io::Error>,
}

impl ErrorEvent {
    pub(crate) fn new(component: Component, generation: u64, error: io::Error) -> Self {
        Self {
            component,
            generation,
            error: Arc::new(error),
        }
    }

    /// Whether the peer closed the stream cleanly
    pub fn is_eof(&self) -> bool {
        self.error.kind() == io::ErrorKind::UnexpectedEof
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} connection lost (generation {}): {}",
            self.component, self.generation, self.error
        )
    }
}

/// Callback invoked whenever a connection is dropped
pub type ErrorCallback = Arc<dyn Fn(&ErrorEvent) + Send + Sync>;

pub(crate) fn eof_error() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer")
}
