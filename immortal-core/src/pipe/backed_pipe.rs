//! Resilient duplex byte stream
//!
//! [`BackedPipe`] pairs a [`BackedReader`] and a [`BackedWriter`] over one
//! replaceable connection. Applications read and write as if the link never
//! fails: reads block while disconnected, writes are buffered for replay,
//! and a background supervisor reconnects when either half reports that its
//! connection was dropped.
//!
//! ## Reconnection
//! Every path into the reconnection procedure (`connect`, `force_reconnect`,
//! connection loss) goes through one single-flight group, so concurrent
//! triggers share a single dial:
//! 1. Drop the live connection and detach the reader and writer
//! 2. Ask the [`Reconnector`] for a new connection and the remote's offset
//! 3. Replay the unacknowledged tail and install the connection in the writer
//! 4. Install the connection in the reader
//! 5. Mark connected and wake waiters
//!
//! ```
//! use immortal_core::prelude::*;
//! use std::io::Write;
//!
//! let (local, remote) = memory_pair();
//!
//! let slot = parking_lot::Mutex::new(Some(local));
//! let reconnector = move |_: &Context, _writer_seq: u64| -> anyhow::Result<Reconnected> {
//!     let conn = slot.lock().take().ok_or_else(|| anyhow::anyhow!("no more connections"))?;
//!     Ok(Reconnected::new(conn, 0))
//! };
//! let pipe = BackedPipe::new(&Context::background(), reconnector);
//!
//! (&pipe).write_all(b"queued before connect").unwrap();
//! pipe.connect(&Context::background()).unwrap();
//!
//! let mut buf = [0u8; 21];
//! let mut read = 0;
//! while read < buf.len() {
//!     read += remote.read(&mut buf[read..]).unwrap();
//! }
//! assert_eq!(&buf, b"queued before connect");
//! ```

use super::backed_reader::BackedReader;
use super::backed_writer::BackedWriter;
use super::events::{Component, ErrorCallback, ErrorEvent};
use super::reconnector::Reconnector;
use super::singleflight::SingleFlight;
use crate::config::PipeConfig;
use crate::core::{Context, ContextError, PipeError, SharedConnection};
use crate::monitoring::{MetricsRegistry, PipeMetrics};
use crate::resilience::{policy_from_config, RetryPolicy};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use prometheus::IntCounterVec;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often `wait_for_connection` re-checks its context
const WAIT_SLICE: Duration = Duration::from_millis(25);

/// What started a reconnection procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Explicit `connect`
    Connect,
    /// Explicit `force_reconnect`
    Force,
    /// A dropped connection reported by the reader or writer
    ConnectionLost,
}

impl Trigger {
    /// Metrics label value
    pub const fn as_str(&self) -> &'static str {
        match self {
            Trigger::Connect => "connect",
            Trigger::Force => "force",
            Trigger::ConnectionLost => "connection_lost",
        }
    }
}

/// How long the replay watcher sleeps between context checks
const WATCH_SLICE: Duration = Duration::from_secs(60);

/// Closes a dialed connection if its attempt ends while the replay is still
/// being written, so a peer that stops reading cannot hold the writer lock
struct ReplayWatch {
    stop: Context,
    fired: Arc<Mutex<Option<bool>>>,
}

impl ReplayWatch {
    fn spawn(attempt: &Context, conn: SharedConnection) -> Self {
        let stop = attempt.child();
        // None while replaying; Some(closed) once settled
        let fired = Arc::new(Mutex::new(None));

        let watch = stop.clone();
        let outcome = fired.clone();
        thread::spawn(move || {
            while watch.sleep(WATCH_SLICE).is_ok() {}
            let mut outcome = outcome.lock();
            if outcome.is_none() {
                let _ = conn.close();
                *outcome = Some(true);
            }
        });

        Self { stop, fired }
    }

    /// Stop watching; true if the watcher already closed the connection
    fn finish(self) -> bool {
        let fired = {
            let mut fired = self.fired.lock();
            *fired.get_or_insert(false)
        };
        self.stop.cancel();
        fired
    }
}

enum SupervisorEvent {
    ConnectionLost(ErrorEvent),
    Shutdown,
}

struct PipeState {
    conn: Option<SharedConnection>,
    /// Dialed connection still being replayed into; not yet installed
    pending: Option<SharedConnection>,
    connected: bool,
    closed: bool,
    /// Set by `disconnect`; connection-loss events are ignored until the
    /// next successful reconnect
    suspended: bool,
    reconnects: u64,
}

struct Shared {
    name: String,
    ctx: Context,
    reader: BackedReader,
    writer: BackedWriter,
    reconnector: Box<dyn Reconnector>,
    state: Mutex<PipeState>,
    state_cond: Condvar,
    flight: SingleFlight<Result<(), PipeError>>,
    retry: Mutex<Box<dyn RetryPolicy>>,
    auto_reconnect: bool,
    metrics: Option<MetricsRegistry>,
    events: Sender<SupervisorEvent>,
    on_error: RwLock<Option<ErrorCallback>>,
}

/// Duplex byte stream that survives connection loss
pub struct BackedPipe {
    shared: Arc<Shared>,
}

impl BackedPipe {
    /// Create a disconnected pipe with the default configuration
    pub fn new<R: Reconnector>(ctx: &Context, reconnector: R) -> Self {
        Self::build(ctx, reconnector, PipeConfig::default(), None)
    }

    /// Create a disconnected pipe from `config`
    pub fn with_config<R: Reconnector>(ctx: &Context, reconnector: R, config: PipeConfig) -> Self {
        Self::build(ctx, reconnector, config, None)
    }

    /// Like [`with_config`](Self::with_config), recording into `metrics`
    pub fn with_metrics<R: Reconnector>(
        ctx: &Context,
        reconnector: R,
        config: PipeConfig,
        metrics: MetricsRegistry,
    ) -> Self {
        Self::build(ctx, reconnector, config, Some(metrics))
    }

    fn build<R: Reconnector>(
        ctx: &Context,
        reconnector: R,
        config: PipeConfig,
        metrics: Option<MetricsRegistry>,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();

        let shared = Arc::new(Shared {
            ctx: ctx.child(),
            reader: BackedReader::new(),
            writer: BackedWriter::new(config.ring_capacity),
            reconnector: Box::new(reconnector),
            state: Mutex::new(PipeState {
                conn: None,
                pending: None,
                connected: false,
                closed: false,
                suspended: false,
                reconnects: 0,
            }),
            state_cond: Condvar::new(),
            flight: SingleFlight::new(),
            retry: Mutex::new(policy_from_config(config.retry.as_ref())),
            auto_reconnect: config.auto_reconnect,
            metrics,
            events: events_tx.clone(),
            on_error: RwLock::new(None),
            name: config.name,
        });

        let reader_tx = events_tx.clone();
        shared.reader.set_error_callback(move |event| {
            let _ = reader_tx.send(SupervisorEvent::ConnectionLost(event.clone()));
        });
        shared.writer.set_error_callback(move |event| {
            let _ = events_tx.send(SupervisorEvent::ConnectionLost(event.clone()));
        });

        if let Some(metrics) = &shared.metrics {
            metrics.pipes().connected.with_label_values(&[shared.name.as_str()]).set(0);
        }

        let supervisor = shared.clone();
        thread::spawn(move || supervisor.supervise(events_rx));

        debug!(pipe = %shared.name, capacity = config.ring_capacity, "backed pipe created");

        Self { shared }
    }

    /// Establish the first connection
    ///
    /// Fails with `AlreadyConnected` if a connection is live.
    pub fn connect(&self, ctx: &Context) -> Result<(), PipeError> {
        {
            let state = self.shared.state.lock();
            if state.closed {
                return Err(PipeError::Closed);
            }
        }
        if self.connected() {
            return Err(PipeError::AlreadyConnected);
        }
        self.shared.reconnect(ctx, Trigger::Connect)
    }

    /// Replace the connection, dropping the live one first
    pub fn force_reconnect(&self, ctx: &Context) -> Result<(), PipeError> {
        if self.shared.state.lock().closed {
            return Err(PipeError::Closed);
        }
        self.shared.reconnect(ctx, Trigger::Force)
    }

    /// Read into `buf`, blocking while disconnected
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, PipeError> {
        if self.shared.state.lock().closed {
            return Err(PipeError::Closed);
        }
        let n = self.shared.reader.read(buf)?;
        if let Some(metrics) = &self.shared.metrics {
            metrics
                .pipes()
                .bytes_read_total
                .with_label_values(&[self.shared.name.as_str()])
                .inc_by(n as u64);
        }
        Ok(n)
    }

    /// Write `buf`; buffered for replay and forwarded when connected
    pub fn write(&self, buf: &[u8]) -> Result<usize, PipeError> {
        if self.shared.state.lock().closed {
            return Err(PipeError::Closed);
        }
        let n = self.shared.writer.write(buf)?;
        if let Some(metrics) = &self.shared.metrics {
            metrics
                .pipes()
                .bytes_written_total
                .with_label_values(&[self.shared.name.as_str()])
                .inc_by(n as u64);
        }
        Ok(n)
    }

    /// Block until connected, closed, or `ctx` ends
    pub fn wait_for_connection(&self, ctx: &Context) -> Result<(), PipeError> {
        let mut state = self.shared.state.lock();
        loop {
            if state.closed {
                return Err(PipeError::Closed);
            }
            if self.shared.is_connected(&state) {
                return Ok(());
            }
            if let Some(err) = ctx.err() {
                return Err(PipeError::Context(err));
            }
            self.shared
                .state_cond
                .wait_for(&mut state, ctx.wait_slice(WAIT_SLICE));
        }
    }

    /// Whether a connection is installed in both halves
    pub fn connected(&self) -> bool {
        let state = self.shared.state.lock();
        self.shared.is_connected(&state)
    }

    /// Drop the live connection without reconnecting
    ///
    /// Reads block and writes buffer until the next `connect` or
    /// `force_reconnect`.
    pub fn disconnect(&self) -> Result<(), PipeError> {
        let conn = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(PipeError::Closed);
            }
            state.connected = false;
            state.suspended = true;
            state.conn.take()
        };
        self.shared.set_connected_gauge(false);

        self.shared.reader.disconnect();
        let result = conn.map_or(Ok(()), |conn| conn.close());
        self.shared.writer.disconnect();

        info!(pipe = %self.shared.name, "backed pipe disconnected");
        result.map_err(|e| PipeError::Io(Arc::new(e)))
    }

    /// Close the pipe; idempotent
    ///
    /// Pending and future reads and writes fail with `Closed`.
    pub fn close(&self) -> Result<(), PipeError> {
        self.shared.close()
    }

    /// Invoke `callback` for every dropped connection, stale or not
    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        *self.shared.on_error.write() = Some(Arc::new(callback));
    }

    /// Bytes delivered to readers so far
    pub fn reader_sequence_num(&self) -> u64 {
        self.shared.reader.sequence_num()
    }

    /// Bytes accepted from writers so far
    pub fn writer_sequence_num(&self) -> u64 {
        self.shared.writer.sequence_num()
    }

    /// Successful reconnection procedures so far
    pub fn reconnects(&self) -> u64 {
        self.shared.state.lock().reconnects
    }

    /// Callers currently waiting on an in-flight reconnect
    pub fn reconnect_waiters(&self) -> usize {
        self.shared.flight.waiters()
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Configured pipe name
    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl Shared {
    fn is_connected(&self, state: &PipeState) -> bool {
        !state.closed && state.connected && self.reader.connected() && self.writer.connected()
    }

    fn set_connected_gauge(&self, connected: bool) {
        if let Some(metrics) = &self.metrics {
            metrics
                .pipes()
                .connected
                .with_label_values(&[self.name.as_str()])
                .set(i64::from(connected));
        }
    }

    fn count(&self, select: impl Fn(&PipeMetrics) -> &IntCounterVec, label: &str) {
        if let Some(metrics) = &self.metrics {
            select(metrics.pipes())
                .with_label_values(&[self.name.as_str(), label])
                .inc();
        }
    }

    fn reconnect(&self, ctx: &Context, trigger: Trigger) -> Result<(), PipeError> {
        match self.flight.run(ctx, || self.run_reconnect(ctx, trigger)) {
            Ok(result) => result,
            Err(err) => Err(PipeError::Context(err)),
        }
    }

    fn run_reconnect(&self, caller: &Context, trigger: Trigger) -> Result<(), PipeError> {
        let attempt = self.ctx.merge(caller);
        self.count(|m| &m.reconnect_attempts_total, trigger.as_str());

        let result = self.try_reconnect(&attempt, trigger);
        match &result {
            Ok(()) => self.count(|m| &m.reconnect_successes_total, trigger.as_str()),
            Err(err) => {
                self.count(|m| &m.reconnect_failures_total, trigger.as_str());
                warn!(pipe = %self.name, trigger = trigger.as_str(), error = %err, "reconnect failed");
            }
        }
        result
    }

    fn try_reconnect(&self, ctx: &Context, trigger: Trigger) -> Result<(), PipeError> {
        let old = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PipeError::Closed);
            }
            state.connected = false;
            state.conn.take()
        };
        self.set_connected_gauge(false);

        self.reader.disconnect();
        if let Some(old) = old {
            if let Err(e) = old.close() {
                debug!(pipe = %self.name, error = %e, "closing replaced connection failed");
            }
        }
        self.writer.disconnect();

        // Bytes still in flight from the old connection count toward reader_seq
        if let Err(err) = self.reader.settle(ctx) {
            if self.state.lock().closed {
                return Err(PipeError::Closed);
            }
            return Err(PipeError::Context(err));
        }

        let reader_seq = self.reader.begin_reconnect();
        let writer_seq = self.writer.begin_reconnect();
        debug!(
            pipe = %self.name,
            trigger = trigger.as_str(),
            reader_seq,
            writer_seq,
            "dialing"
        );

        let reconnected = match self.reconnector.reconnect(ctx, writer_seq) {
            Ok(reconnected) => reconnected,
            Err(e) => {
                self.reader.complete_reconnect(None);
                if self.state.lock().closed {
                    return Err(PipeError::Closed);
                }
                if let Some(err) = ctx.err() {
                    return Err(PipeError::Context(err));
                }
                return Err(PipeError::ReconnectFailed(Arc::new(e)));
            }
        };
        let conn = reconnected.conn;

        {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                let _ = conn.close();
                return Err(PipeError::Closed);
            }
            state.pending = Some(conn.clone());
        }

        let replayed_before = self.writer.replayed_bytes();
        let watch = ReplayWatch::spawn(ctx, conn.clone());
        let installed = self.writer.complete_reconnect(conn.clone(), reconnected.reader_seq_num);
        let interrupted = watch.finish();
        self.state.lock().pending = None;
        let installed = match installed {
            Ok(_) if interrupted => {
                // The attempt ended right after the replay; `conn` is already closed
                self.writer.disconnect();
                Err(PipeError::Context(ctx.err().unwrap_or(ContextError::Canceled)))
            }
            other => other,
        };
        if let Err(err) = installed {
            let _ = conn.close();
            if self.state.lock().closed {
                return Err(PipeError::Closed);
            }
            if interrupted {
                if let Some(err) = ctx.err() {
                    return Err(PipeError::Context(err));
                }
            }
            return Err(err);
        }
        let replayed = self.writer.replayed_bytes() - replayed_before;
        if let Some(metrics) = &self.metrics {
            metrics
                .pipes()
                .bytes_replayed_total
                .with_label_values(&[self.name.as_str()])
                .inc_by(replayed);
        }

        if self.reader.complete_reconnect(Some(conn.clone())).is_none() {
            self.writer.disconnect();
            let _ = conn.close();
            return Err(PipeError::Closed);
        }

        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            self.reader.disconnect();
            let _ = conn.close();
            self.writer.disconnect();
            return Err(PipeError::Closed);
        }
        state.conn = Some(conn);
        state.connected = true;
        state.suspended = false;
        state.reconnects += 1;
        let reconnects = state.reconnects;
        self.state_cond.notify_all();
        drop(state);

        self.set_connected_gauge(true);
        info!(
            pipe = %self.name,
            trigger = trigger.as_str(),
            replayed,
            remote_reader_seq = reconnected.reader_seq_num,
            reconnects,
            "backed pipe connected"
        );
        Ok(())
    }

    fn close(&self) -> Result<(), PipeError> {
        let conn = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.connected = false;
            self.state_cond.notify_all();
            if let Some(pending) = state.pending.take() {
                let _ = pending.close();
            }
            state.conn.take()
        };

        self.ctx.cancel();
        let _ = self.reader.close();
        let result = conn.map_or(Ok(()), |conn| conn.close());
        let _ = self.writer.close();
        let _ = self.events.send(SupervisorEvent::Shutdown);

        self.set_connected_gauge(false);
        info!(pipe = %self.name, "backed pipe closed");

        result.map_err(|e| PipeError::Io(Arc::new(e)))
    }

    fn supervise(&self, events: Receiver<SupervisorEvent>) {
        for event in events.iter() {
            match event {
                SupervisorEvent::ConnectionLost(event) => self.handle_connection_lost(&event),
                SupervisorEvent::Shutdown => break,
            }
        }
        debug!(pipe = %self.name, "supervisor stopped");
    }

    /// Whether `event` still describes the installed state of its component
    fn is_live(&self, event: &ErrorEvent) -> bool {
        {
            let state = self.state.lock();
            if state.closed || state.suspended {
                return false;
            }
        }
        match event.component {
            Component::Reader => {
                !self.reader.connected() && self.reader.generation() == event.generation
            }
            Component::Writer => {
                !self.writer.connected() && self.writer.generation() == event.generation
            }
        }
    }

    /// Detach both halves from a dead connection and wait for an explicit
    /// `connect` or `force_reconnect`
    ///
    /// Runs inside the reconnect flight so it never tears down a connection
    /// installed concurrently.
    fn release_lost_connection(&self, event: &ErrorEvent) {
        while self.is_live(event) {
            let mut released = false;
            let outcome = self.flight.run(&self.ctx, || {
                if self.is_live(event) {
                    self.release(event);
                }
                released = true;
                Ok(())
            });
            if released || outcome.is_err() {
                return;
            }
        }
    }

    fn release(&self, event: &ErrorEvent) {
        let conn = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.connected = false;
            state.suspended = true;
            state.conn.take()
        };
        self.set_connected_gauge(false);

        self.reader.disconnect();
        if let Some(conn) = conn {
            let _ = conn.close();
        }
        self.writer.disconnect();
        warn!(pipe = %self.name, %event, "connection lost, waiting for reconnect");
    }

    fn handle_connection_lost(&self, event: &ErrorEvent) {
        let callback = self.on_error.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
        if let Some(metrics) = &self.metrics {
            metrics
                .pipes()
                .connection_errors_total
                .with_label_values(&[self.name.as_str(), event.component.as_str()])
                .inc();
        }

        if !self.auto_reconnect {
            self.release_lost_connection(event);
            return;
        }

        loop {
            if !self.is_live(event) {
                debug!(pipe = %self.name, %event, "ignoring stale connection error");
                return;
            }

            warn!(pipe = %self.name, %event, "connection lost, reconnecting");
            match self.reconnect(&self.ctx, Trigger::ConnectionLost) {
                // A joined attempt may predate this failure; re-check before returning
                Ok(()) => self.retry.lock().reset(),
                Err(PipeError::Closed) | Err(PipeError::Context(_)) => return,
                Err(_) => {
                    let delay = self.retry.lock().next_delay();
                    let Some(delay) = delay else {
                        warn!(pipe = %self.name, "giving up on automatic reconnect");
                        self.retry.lock().reset();
                        return;
                    };
                    debug!(pipe = %self.name, ?delay, "retrying reconnect");
                    if self.ctx.sleep(delay).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

impl Drop for BackedPipe {
    fn drop(&mut self) {
        let _ = self.shared.close();
    }
}

impl io::Read for &BackedPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        BackedPipe::read(*self, buf).map_err(io::Error::from)
    }
}

impl io::Write for &BackedPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        BackedPipe::write(*self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for BackedPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }
}

impl io::Write for BackedPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for BackedPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackedPipe")
            .field("name", &self.shared.name)
            .field("connected", &self.connected())
            .field("reader_seq", &self.reader_sequence_num())
            .field("writer_seq", &self.writer_sequence_num())
            .finish()
    }
}
