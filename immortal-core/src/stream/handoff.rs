//! Hands client connections from `Stream::handle_reconnect` to the pipe
//!
//! The stream's pipe does not dial anything. Its reconnector waits on a
//! channel for the next client a caller attaches, together with the
//! client's read offset, and returns it as the new connection.

use crate::core::{Context, SharedConnection};
use crate::pipe::{Reconnected, Reconnector};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;
use tracing::debug;

/// How often a waiting reconnect re-checks its context
const POLL: Duration = Duration::from_millis(50);

pub(crate) struct PendingClient {
    pub conn: SharedConnection,
    /// Bytes of stream output the client already has
    pub read_seq: u64,
}

/// Sending half, owned by the stream
pub(crate) struct ClientHandoff {
    tx: Sender<PendingClient>,
    rx: Receiver<PendingClient>,
}

/// Receiving half, owned by the pipe
pub(crate) struct ClientAcceptor {
    rx: Receiver<PendingClient>,
}

impl ClientHandoff {
    pub fn new() -> (Self, ClientAcceptor) {
        let (tx, rx) = unbounded();
        let acceptor = ClientAcceptor { rx: rx.clone() };
        (Self { tx, rx }, acceptor)
    }

    /// Queue `client` for the next reconnect, closing any client nobody took
    pub fn offer(&self, client: PendingClient) {
        self.discard_pending();
        // The acceptor lives as long as the stream, so this cannot fail
        let _ = self.tx.send(client);
    }

    /// Close clients that were offered but never picked up
    pub fn discard_pending(&self) -> usize {
        let mut discarded = 0;
        while let Ok(stale) = self.rx.try_recv() {
            let _ = stale.conn.close();
            discarded += 1;
        }
        discarded
    }
}

impl Reconnector for ClientAcceptor {
    fn reconnect(&self, ctx: &Context, writer_seq_num: u64) -> anyhow::Result<Reconnected> {
        debug!(writer_seq_num, "waiting for client connection");
        loop {
            if let Some(err) = ctx.err() {
                return Err(anyhow::Error::new(err).context("waiting for client connection"));
            }
            match self.rx.recv_timeout(ctx.wait_slice(POLL)) {
                Ok(client) => return Ok(Reconnected::shared(client.conn, client.read_seq)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    anyhow::bail!("client handoff closed")
                }
            }
        }
    }
}
