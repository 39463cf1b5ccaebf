//! Immortal stream integration tests
//!
//! A `Stream` fronts a real TCP echo service. Clients attach, drop and
//! reattach over memory pairs and TCP sockets; the service keeps one
//! connection the whole time and neither side loses or repeats a byte.

use anyhow::Result;
use immortal_core::testing::{read_exact, wait_until};
use immortal_core::{
    memory_pair, write_all, Connection, Stream, StreamConfig, StreamError, StreamId,
};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

/// Echo service accepting a single connection; returns its port
fn spawn_echo_service() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    thread::spawn(move || {
        let Ok((conn, _)) = listener.accept() else {
            return;
        };
        let mut buf = [0u8; 4096];
        loop {
            match Connection::read(&conn, &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if write_all(&conn, &buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });
    Ok(port)
}

fn echo_stream() -> Result<Stream> {
    let port = spawn_echo_service()?;
    let stream = Stream::new(StreamId::generate(), "echo", port, StreamConfig::default());
    stream.start(TcpStream::connect(("127.0.0.1", port))?)?;
    Ok(stream)
}

/// Connected TCP pair: (client side, stream side)
fn tcp_pair() -> Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let client = TcpStream::connect(listener.local_addr()?)?;
    let (server, _) = listener.accept()?;
    Ok((client, server))
}

// ============================================================================
// ECHO THROUGH REATTACHING CLIENTS
// ============================================================================

/// Test: Round trip through the stream to a TCP service
#[test]
fn test_echo_round_trip() -> Result<()> {
    let stream = echo_stream()?;
    let (client, attach) = memory_pair();
    assert_eq!(stream.handle_reconnect(attach, 0)?, 0);

    write_all(&client, b"hello")?;
    assert_eq!(read_exact(&client, 5)?, b"hello");
    assert!(stream.is_connected());

    stream.close()?;
    Ok(())
}

/// Test: Echo produced while detached is replayed to the next client
///
/// The first client sends "abc" and leaves before reading the echo. The
/// second client reports that it already saw the 5-byte greeting echo and
/// receives exactly "abc".
#[test]
fn test_unread_echo_replayed_after_reattach() -> Result<()> {
    let stream = echo_stream()?;

    let (first, attach) = memory_pair();
    stream.handle_reconnect(attach, 0)?;
    write_all(&first, b"hello")?;
    assert_eq!(read_exact(&first, 5)?, b"hello");

    write_all(&first, b"abc")?;
    assert!(wait_until(WAIT, || stream.info().bytes_sent == 8));
    stream.force_disconnect()?;
    assert!(!stream.is_connected());

    let (second, attach) = memory_pair();
    // Stream received all 8 bytes the first client sent
    assert_eq!(stream.handle_reconnect(attach, 5)?, 8);
    assert_eq!(read_exact(&second, 3)?, b"abc");

    write_all(&second, b"xyz")?;
    assert_eq!(read_exact(&second, 3)?, b"xyz");
    Ok(())
}

/// Test: Clients over TCP, replaced after the first one drops
#[test]
fn test_tcp_clients_reattach() -> Result<()> {
    let stream = echo_stream()?;

    let (first, attach) = tcp_pair()?;
    stream.handle_reconnect(attach, 0)?;
    write_all(&first, b"ping")?;
    assert_eq!(read_exact(&first, 4)?, b"ping");

    drop(first);
    assert!(wait_until(WAIT, || !stream.is_connected()));

    let (second, attach) = tcp_pair()?;
    assert_eq!(stream.handle_reconnect(attach, 4)?, 4);
    write_all(&second, b"pong")?;
    assert_eq!(read_exact(&second, 4)?, b"pong");

    assert!(wait_until(WAIT, || stream.info().bytes_received == 8));
    let info = stream.info();
    assert!(info.last_disconnection_at.is_some());
    assert!(info.last_connection_at.is_some());
    Ok(())
}

/// Test: Attaching a new client replaces a live one
#[test]
fn test_reattach_replaces_live_client() -> Result<()> {
    let stream = echo_stream()?;

    let (first, attach) = memory_pair();
    stream.handle_reconnect(attach, 0)?;
    let (second, attach) = memory_pair();
    stream.handle_reconnect(attach, 0)?;

    // The first client sees end of stream
    let mut buf = [0u8; 1];
    assert_eq!(first.read(&mut buf)?, 0);

    write_all(&second, b"still here")?;
    assert_eq!(read_exact(&second, 10)?, b"still here");
    Ok(())
}

// ============================================================================
// LIFECYCLE
// ============================================================================

/// Test: Lifecycle errors before start and after close
#[test]
fn test_lifecycle_errors() -> Result<()> {
    let port = spawn_echo_service()?;
    let stream = Stream::new(StreamId::generate(), "echo", port, StreamConfig::default());

    let (_client, attach) = memory_pair();
    assert!(matches!(
        stream.handle_reconnect(attach, 0),
        Err(StreamError::NotStarted)
    ));

    stream.start(TcpStream::connect(("127.0.0.1", port))?)?;
    let (_unused, local) = memory_pair();
    assert!(matches!(stream.start(local), Err(StreamError::AlreadyStarted)));

    stream.close()?;
    stream.close()?;
    assert!(stream.is_closed());

    let (_client, attach) = memory_pair();
    assert!(matches!(
        stream.handle_reconnect(attach, 0),
        Err(StreamError::Closed)
    ));
    Ok(())
}

/// Test: Service going away shuts the stream down and detaches the client
#[test]
fn test_service_exit_closes_stream() -> Result<()> {
    let (service, local) = memory_pair();
    let stream = Stream::new(StreamId::generate(), "short-lived", 0, StreamConfig::default());
    stream.start(local)?;

    let (client, attach) = memory_pair();
    stream.handle_reconnect(attach, 0)?;

    write_all(&service, b"bye")?;
    assert_eq!(read_exact(&client, 3)?, b"bye");
    service.close()?;

    assert!(wait_until(WAIT, || stream.is_closed()));
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf)?, 0);
    Ok(())
}

/// Test: StreamInfo serializes with its identity intact
#[test]
fn test_info_serializes() -> Result<()> {
    let stream = echo_stream()?;
    let info = stream.info();

    let json = serde_json::to_string(&info)?;
    let back: immortal_core::StreamInfo = serde_json::from_str(&json)?;
    assert_eq!(back, info);
    assert_eq!(back.id, stream.id());
    assert_eq!(back.name, "echo");
    Ok(())
}
