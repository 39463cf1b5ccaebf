//! Underlying byte-stream connections
//!
//! A [`Connection`] is shared between the backed reader (which may sit in a
//! blocking `read`) and the backed writer, so every method takes `&self`, the
//! same way `std::io::Read` is implemented for `&TcpStream`. `close` must
//! unblock a concurrent `read` on the same connection.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

/// Byte-stream endpoint that can be read, written and closed concurrently
pub trait Connection: Send + Sync + 'static {
    /// Read into `buf`. `Ok(0)` with a non-empty `buf` means end of stream.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write some prefix of `buf`, returning how much was written
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Close both directions; pending and future reads must return
    fn close(&self) -> io::Result<()>;
}

/// Connection handle shared by reader, writer and pipe
pub type SharedConnection = Arc<dyn Connection>;

/// Write all of `buf`, retrying partial writes and interrupts
pub fn write_all(conn: &dyn Connection, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match conn.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "connection accepted zero bytes",
                ))
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn ignore_not_connected(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

impl Connection for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn close(&self) -> io::Result<()> {
        ignore_not_connected(self.shutdown(Shutdown::Both))
    }
}

#[cfg(unix)]
impl Connection for std::os::unix::net::UnixStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn close(&self) -> io::Result<()> {
        ignore_not_connected(self.shutdown(Shutdown::Both))
    }
}

impl<C: Connection + ?Sized> Connection for Arc<C> {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Connection::read(&**self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Connection::write(&**self, buf)
    }

    fn close(&self) -> io::Result<()> {
        Connection::close(&**self)
    }
}
