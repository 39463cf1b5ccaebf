//! Reconnector driven by a queue of scripted outcomes

use crate::core::{Context, SharedConnection};
use crate::pipe::{Reconnected, Reconnector};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

enum Step {
    Connect {
        conn: SharedConnection,
        reader_seq_num: u64,
    },
    Fail(String),
}

#[derive(Default)]
struct Script {
    steps: Mutex<VecDeque<Step>>,
    writer_seqs: Mutex<Vec<u64>>,
    signal: Mutex<Option<Sender<u64>>>,
    gate: Mutex<Option<Receiver<()>>>,
}

/// Hands out queued connections and failures in order
///
/// Clones share the same script, so a test can keep one handle after
/// moving another into a pipe.
#[derive(Clone, Default)]
pub struct ScriptedReconnector {
    script: Arc<Script>,
}

impl ScriptedReconnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next call succeeds with `conn`; the remote claims `reader_seq_num`
    pub fn push_connection(&self, conn: SharedConnection, reader_seq_num: u64) {
        self.script.steps.lock().push_back(Step::Connect {
            conn,
            reader_seq_num,
        });
    }

    /// Next call fails with `message`
    pub fn push_failure(&self, message: impl Into<String>) {
        self.script
            .steps
            .lock()
            .push_back(Step::Fail(message.into()));
    }

    /// Calls made so far
    pub fn calls(&self) -> usize {
        self.script.writer_seqs.lock().len()
    }

    /// Writer sequence number passed to each call
    pub fn writer_seqs(&self) -> Vec<u64> {
        self.script.writer_seqs.lock().clone()
    }

    /// Receive the writer sequence number of every call as it starts
    pub fn signal(&self) -> Receiver<u64> {
        let (tx, rx) = unbounded();
        *self.script.signal.lock() = Some(tx);
        rx
    }

    /// Hold every call until a message arrives on the returned sender
    ///
    /// Held calls still return early when their context ends.
    pub fn gate(&self) -> Sender<()> {
        let (tx, rx) = unbounded();
        *self.script.gate.lock() = Some(rx);
        tx
    }
}

impl Reconnector for ScriptedReconnector {
    fn reconnect(&self, ctx: &Context, writer_seq_num: u64) -> anyhow::Result<Reconnected> {
        self.script.writer_seqs.lock().push(writer_seq_num);
        if let Some(signal) = self.script.signal.lock().as_ref() {
            let _ = signal.send(writer_seq_num);
        }

        let gate = self.script.gate.lock().clone();
        if let Some(gate) = gate {
            loop {
                if let Some(err) = ctx.err() {
                    return Err(err.into());
                }
                match gate.recv_timeout(ctx.wait_slice(Duration::from_millis(10))) {
                    Ok(()) => break,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }

        match self.script.steps.lock().pop_front() {
            Some(Step::Connect {
                conn,
                reader_seq_num,
            }) => Ok(Reconnected::shared(conn, reader_seq_num)),
            Some(Step::Fail(message)) => Err(anyhow::anyhow!(message)),
            None => Err(anyhow::anyhow!("no scripted connection left")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnection;

    #[test]
    fn test_outcomes_in_order() {
        let script = ScriptedReconnector::new();
        script.push_failure("refused");
        script.push_connection(MockConnection::new(), 3);

        let ctx = Context::background();
        let err = script.reconnect(&ctx, 5).unwrap_err();
        assert!(err.to_string().contains("refused"));

        let ok = script.reconnect(&ctx, 7).unwrap();
        assert_eq!(ok.reader_seq_num, 3);

        assert!(script.reconnect(&ctx, 9).is_err());
        assert_eq!(script.writer_seqs(), vec![5, 7, 9]);
    }

    #[test]
    fn test_gate_respects_context() {
        let script = ScriptedReconnector::new();
        let _gate = script.gate();
        script.push_connection(MockConnection::new(), 0);

        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        assert!(script.reconnect(&ctx, 0).is_err());
    }
}
