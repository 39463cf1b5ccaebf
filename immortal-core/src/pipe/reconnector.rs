//! Caller-supplied dial and handshake

use crate::core::{Connection, Context, SharedConnection};
use std::sync::Arc;

/// Outcome of a successful dial
pub struct Reconnected {
    /// Fresh connection to the remote
    pub conn: SharedConnection,
    /// How many of our bytes the remote has already received
    pub reader_seq_num: u64,
}

impl Reconnected {
    pub fn new<C: Connection>(conn: C, reader_seq_num: u64) -> Self {
        Self {
            conn: Arc::new(conn),
            reader_seq_num,
        }
    }

    /// Wrap a connection that is already shared
    pub fn shared(conn: SharedConnection, reader_seq_num: u64) -> Self {
        Self {
            conn,
            reader_seq_num,
        }
    }
}

impl std::fmt::Debug for Reconnected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconnected")
            .field("reader_seq_num", &self.reader_seq_num)
            .finish_non_exhaustive()
    }
}

/// Establishes a new connection to the remote end of a pipe
///
/// `writer_seq_num` is how many bytes the local writer has accepted; the
/// implementation sends it to the remote (so the remote can replay its own
/// output) and returns the remote's reader offset. The context is canceled
/// when the pipe closes, so implementations should check it while blocking.
pub trait Reconnector: Send + Sync + 'static {
    fn reconnect(&self, ctx: &Context, writer_seq_num: u64) -> anyhow::Result<Reconnected>;
}

impl<F> Reconnector for F
where
    F: Fn(&Context, u64) -> anyhow::Result<Reconnected> + Send + Sync + 'static,
{
    fn reconnect(&self, ctx: &Context, writer_seq_num: u64) -> anyhow::Result<Reconnected> {
        self(ctx, writer_seq_num)
    }
}
