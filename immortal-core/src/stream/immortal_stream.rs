//! A local service connection that outlives its remote clients
//!
//! A [`Stream`] owns one connection to a local TCP service and a
//! [`BackedPipe`] toward whichever client is currently attached. Clients
//! come and go through [`Stream::handle_reconnect`]; bytes the local service
//! produced while no client was attached are replayed to the next one, and
//! the service never notices the gap.

use super::handoff::{ClientAcceptor, ClientHandoff, PendingClient};
use super::info::{Activity, StreamInfo};
use crate::config::StreamConfig;
use crate::core::{write_all, Connection, Context, PipeError, SharedConnection, StreamError, StreamId};
use crate::monitoring::MetricsRegistry;
use crate::pipe::BackedPipe;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::SystemTime;
use tracing::{debug, info, warn};

struct Lifecycle {
    started: bool,
    closed: bool,
    local: Option<SharedConnection>,
}

struct StreamInner {
    id: StreamId,
    name: String,
    tcp_port: u16,
    config: StreamConfig,
    created_at: SystemTime,
    pipe: BackedPipe,
    handoff: ClientHandoff,
    /// Serializes client attachment
    attach: Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
    activity: Arc<Activity>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    metrics: Option<MetricsRegistry>,
}

/// Local service connection bridged to a reattachable client
pub struct Stream {
    inner: Arc<StreamInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Stream {
    pub fn new(id: StreamId, name: impl Into<String>, tcp_port: u16, config: StreamConfig) -> Self {
        Self::build(id, name.into(), tcp_port, config, None)
    }

    /// Like [`new`](Self::new), recording into `metrics`
    pub fn with_metrics(
        id: StreamId,
        name: impl Into<String>,
        tcp_port: u16,
        config: StreamConfig,
        metrics: MetricsRegistry,
    ) -> Self {
        Self::build(id, name.into(), tcp_port, config, Some(metrics))
    }

    fn build(
        id: StreamId,
        name: String,
        tcp_port: u16,
        config: StreamConfig,
        metrics: Option<MetricsRegistry>,
    ) -> Self {
        let (handoff, acceptor) = ClientHandoff::new();

        let mut pipe_config = config.pipe.clone();
        pipe_config.name = name.clone();
        // Only handle_reconnect may pick the next client
        pipe_config.auto_reconnect = false;

        let pipe = build_pipe(acceptor, pipe_config, metrics.clone());

        let activity = Arc::new(Activity::default());
        let on_lost = activity.clone();
        pipe.set_error_callback(move |_| on_lost.disconnected());

        debug!(stream = %id, name = %name, tcp_port, "stream created");

        Self {
            inner: Arc::new(StreamInner {
                id,
                name,
                tcp_port,
                config,
                created_at: SystemTime::now(),
                pipe,
                handoff,
                attach: Mutex::new(()),
                lifecycle: Mutex::new(Lifecycle {
                    started: false,
                    closed: false,
                    local: None,
                }),
                activity,
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                metrics,
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Begin copying between `local` and the client pipe
    pub fn start<C: Connection>(&self, local: C) -> Result<(), StreamError> {
        let local: SharedConnection = Arc::new(local);
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.closed {
                return Err(StreamError::Closed);
            }
            if lifecycle.started {
                return Err(StreamError::AlreadyStarted);
            }
            lifecycle.started = true;
            lifecycle.local = Some(local.clone());
        }

        if let Some(metrics) = &self.inner.metrics {
            metrics.streams().active.inc();
        }

        let to_client = {
            let inner = self.inner.clone();
            let local = local.clone();
            thread::spawn(move || inner.copy_local_to_client(local))
        };
        let to_local = {
            let inner = self.inner.clone();
            thread::spawn(move || inner.copy_client_to_local(local))
        };
        self.threads.lock().extend([to_client, to_local]);

        info!(stream = %self.inner.id, name = %self.inner.name, "stream started");
        Ok(())
    }

    /// Attach a new client, replacing the current one
    ///
    /// `client_read_seq` is how many stream bytes the client already
    /// received; everything after it is replayed. Returns how many bytes the
    /// stream has received from clients, so the client can replay its own
    /// unacknowledged output.
    pub fn handle_reconnect<C: Connection>(
        &self,
        conn: C,
        client_read_seq: u64,
    ) -> Result<u64, StreamError> {
        let conn: SharedConnection = Arc::new(conn);
        let _attach = self.inner.attach.lock();

        {
            let lifecycle = self.inner.lifecycle.lock();
            if lifecycle.closed {
                let _ = conn.close();
                return Err(StreamError::Closed);
            }
            if !lifecycle.started {
                return Err(StreamError::NotStarted);
            }
        }

        self.detach_client()?;

        self.inner.handoff.offer(PendingClient {
            conn,
            read_seq: client_read_seq,
        });

        let ctx = Context::background().with_timeout(self.inner.config.handshake_timeout);
        if let Err(err) = self.inner.pipe.force_reconnect(&ctx) {
            self.inner.handoff.discard_pending();
            warn!(stream = %self.inner.id, client_read_seq, error = %err, "client reattach failed");
            return Err(match err {
                PipeError::Closed => StreamError::Closed,
                other => StreamError::Pipe(other),
            });
        }

        self.inner.activity.connected();
        if let Some(metrics) = &self.inner.metrics {
            metrics
                .streams()
                .client_reconnects_total
                .with_label_values(&[self.inner.name.as_str()])
                .inc();
        }

        let stream_read_seq = self.inner.pipe.reader_sequence_num();
        info!(
            stream = %self.inner.id,
            client_read_seq,
            stream_read_seq,
            "client attached"
        );
        Ok(stream_read_seq)
    }

    /// Drop the current client; the stream keeps running and waits for the
    /// next `handle_reconnect`
    pub fn force_disconnect(&self) -> Result<(), StreamError> {
        let _attach = self.inner.attach.lock();
        self.detach_client()
    }

    fn detach_client(&self) -> Result<(), StreamError> {
        if self.inner.pipe.connected() {
            self.inner.activity.disconnected();
        }
        match self.inner.pipe.disconnect() {
            Ok(()) => Ok(()),
            Err(PipeError::Closed) => Err(StreamError::Closed),
            Err(err) => {
                debug!(stream = %self.inner.id, error = %err, "closing previous client failed");
                Ok(())
            }
        }
    }

    /// Whether a client is attached
    pub fn is_connected(&self) -> bool {
        self.inner.pipe.connected()
    }

    pub fn info(&self) -> StreamInfo {
        let timestamps = self.inner.activity.snapshot();
        StreamInfo {
            id: self.inner.id,
            name: self.inner.name.clone(),
            tcp_port: self.inner.tcp_port,
            created_at: self.inner.created_at,
            last_connection_at: timestamps.last_connection_at,
            last_disconnection_at: timestamps.last_disconnection_at,
            connected: self.is_connected(),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
        }
    }

    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the stream has shut down, by `close` or because the local
    /// service went away
    pub fn is_closed(&self) -> bool {
        self.inner.lifecycle.lock().closed
    }

    /// Shut down and wait for the copy threads; idempotent
    pub fn close(&self) -> Result<(), StreamError> {
        let result = self.inner.shutdown();

        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() != current && handle.join().is_err() {
                warn!(stream = %self.inner.id, "copy thread panicked");
            }
        }

        result
    }
}

fn build_pipe(
    acceptor: ClientAcceptor,
    config: crate::config::PipeConfig,
    metrics: Option<MetricsRegistry>,
) -> BackedPipe {
    let ctx = Context::background();
    match metrics {
        Some(metrics) => BackedPipe::with_metrics(&ctx, acceptor, config, metrics),
        None => BackedPipe::with_config(&ctx, acceptor, config),
    }
}

impl StreamInner {
    /// Local service output toward the client
    fn copy_local_to_client(&self, local: SharedConnection) {
        let mut buf = vec![0u8; self.config.copy_buffer_size];
        loop {
            match local.read(&mut buf) {
                Ok(0) => {
                    debug!(stream = %self.id, "local service closed the connection");
                    break;
                }
                Ok(n) => {
                    if self.pipe.write(&buf[..n]).is_err() {
                        break;
                    }
                    self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if !self.is_closed() {
                        warn!(stream = %self.id, error = %e, "reading from local service failed");
                    }
                    break;
                }
            }
        }
        let _ = self.shutdown();
    }

    /// Client input toward the local service
    fn copy_client_to_local(&self, local: SharedConnection) {
        let mut buf = vec![0u8; self.config.copy_buffer_size];
        loop {
            match self.pipe.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => {
                    if let Err(e) = write_all(local.as_ref(), &buf[..n]) {
                        if !self.is_closed() {
                            warn!(stream = %self.id, error = %e, "writing to local service failed");
                        }
                        break;
                    }
                    self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(_) => break,
            }
        }
        let _ = self.shutdown();
    }

    fn is_closed(&self) -> bool {
        self.lifecycle.lock().closed
    }

    fn shutdown(&self) -> Result<(), StreamError> {
        let (local, started) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.closed {
                return Ok(());
            }
            lifecycle.closed = true;
            (lifecycle.local.take(), lifecycle.started)
        };

        self.handoff.discard_pending();
        let pipe_result = self.pipe.close();
        if let Some(local) = local {
            if let Err(e) = local.close() {
                debug!(stream = %self.id, error = %e, "closing local connection failed");
            }
        }

        if started {
            if let Some(metrics) = &self.metrics {
                metrics.streams().active.dec();
            }
        }
        info!(stream = %self.id, name = %self.name, "stream closed");

        pipe_result.map_err(StreamError::from)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory_pair;
    use crate::testing::{read_exact, wait_until};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn started() -> (Stream, crate::core::MemoryConnection) {
        let (service, local) = memory_pair();
        let stream = Stream::new(StreamId::generate(), "shell", 22, StreamConfig::default());
        stream.start(local).unwrap();
        (stream, service)
    }

    #[test]
    fn test_lifecycle_errors() {
        let stream = Stream::new(StreamId::generate(), "shell", 22, StreamConfig::default());
        let (_client, attach) = memory_pair();
        assert!(matches!(
            stream.handle_reconnect(attach, 0),
            Err(StreamError::NotStarted)
        ));

        let (_service, local) = memory_pair();
        stream.start(local).unwrap();
        let (_service2, local2) = memory_pair();
        assert!(matches!(stream.start(local2), Err(StreamError::AlreadyStarted)));

        stream.close().unwrap();
        stream.close().unwrap();
        let (_client, attach) = memory_pair();
        assert!(matches!(
            stream.handle_reconnect(attach, 0),
            Err(StreamError::Closed)
        ));
        assert!(matches!(stream.force_disconnect(), Err(StreamError::Closed)));
    }

    #[test]
    fn test_output_before_attach_is_replayed() {
        let (stream, service) = started();
        write_all(&service, b"motd\n").unwrap();
        assert!(wait_until(WAIT, || stream.info().bytes_sent == 5));

        let (client, attach) = memory_pair();
        assert_eq!(stream.handle_reconnect(attach, 0).unwrap(), 0);
        assert!(stream.is_connected());
        assert_eq!(read_exact(&client, 5).unwrap(), b"motd\n");

        write_all(&client, b"ls\n").unwrap();
        assert_eq!(read_exact(&service, 3).unwrap(), b"ls\n");
    }

    #[test]
    fn test_reattach_resumes_both_directions() {
        let (stream, service) = started();

        let (client, attach) = memory_pair();
        stream.handle_reconnect(attach, 0).unwrap();
        write_all(&client, b"ping").unwrap();
        assert_eq!(read_exact(&service, 4).unwrap(), b"ping");
        write_all(&service, b"pong").unwrap();
        assert_eq!(read_exact(&client, 4).unwrap(), b"pong");

        stream.force_disconnect().unwrap();
        assert!(!stream.is_connected());
        write_all(&service, b" while away").unwrap();
        assert!(wait_until(WAIT, || stream.info().bytes_sent == 15));

        // The client saw "pong" plus nothing else
        let (client, attach) = memory_pair();
        assert_eq!(stream.handle_reconnect(attach, 4).unwrap(), 4);
        assert_eq!(read_exact(&client, 11).unwrap(), b" while away");
    }

    #[test]
    fn test_lost_client_waits_for_reattach() {
        let (stream, service) = started();

        let (client, attach) = memory_pair();
        stream.handle_reconnect(attach, 0).unwrap();
        write_all(&service, b"abc").unwrap();
        assert_eq!(read_exact(&client, 3).unwrap(), b"abc");

        client.close().unwrap();
        assert!(wait_until(WAIT, || !stream.is_connected()));
        assert!(stream.info().last_disconnection_at.is_some());

        write_all(&service, b"def").unwrap();
        assert!(wait_until(WAIT, || stream.info().bytes_sent == 6));
        assert!(!stream.is_connected());

        let (client, attach) = memory_pair();
        stream.handle_reconnect(attach, 3).unwrap();
        assert_eq!(read_exact(&client, 3).unwrap(), b"def");
    }

    #[test]
    fn test_invalid_client_offset_is_rejected() {
        let (stream, service) = started();
        write_all(&service, b"12345").unwrap();
        assert!(wait_until(WAIT, || stream.info().bytes_sent == 5));

        let (_client, attach) = memory_pair();
        let err = stream.handle_reconnect(attach, 99).unwrap_err();
        assert!(matches!(
            err,
            StreamError::Pipe(PipeError::InvalidAcknowledgement {
                acknowledged: 99,
                written: 5
            })
        ));
        assert!(!stream.is_connected());

        let (client, attach) = memory_pair();
        stream.handle_reconnect(attach, 2).unwrap();
        assert_eq!(read_exact(&client, 3).unwrap(), b"345");
    }

    #[test]
    fn test_local_service_exit_closes_stream() {
        let (stream, service) = started();
        service.close().unwrap();
        assert!(wait_until(WAIT, || stream.is_closed()));
        stream.close().unwrap();
    }

    #[test]
    fn test_info_tracks_traffic() {
        let (stream, service) = started();
        let before = stream.info();
        assert_eq!(before.name, "shell");
        assert_eq!(before.tcp_port, 22);
        assert!(!before.connected);
        assert!(before.last_connection_at.is_none());

        let (client, attach) = memory_pair();
        stream.handle_reconnect(attach, 0).unwrap();
        write_all(&client, b"hello").unwrap();
        assert_eq!(read_exact(&service, 5).unwrap(), b"hello");

        assert!(wait_until(WAIT, || stream.info().bytes_received == 5));
        let info = stream.info();
        assert!(info.connected);
        assert!(info.last_connection_at.is_some());
        assert_eq!(info.id, stream.id());
    }

    #[test]
    fn test_metrics_track_active_streams() {
        let metrics = MetricsRegistry::new().unwrap();
        let (_service, local) = memory_pair();
        let stream = Stream::with_metrics(
            StreamId::generate(),
            "metered",
            8080,
            StreamConfig::default(),
            metrics.clone(),
        );
        stream.start(local).unwrap();
        assert_eq!(metrics.streams().active.get(), 1);

        let (_client, attach) = memory_pair();
        stream.handle_reconnect(attach, 0).unwrap();
        assert_eq!(
            metrics
                .streams()
                .client_reconnects_total
                .with_label_values(&["metered"])
                .get(),
            1
        );

        stream.close().unwrap();
        stream.close().unwrap();
        assert_eq!(metrics.streams().active.get(), 0);
    }
}
