//! Test helpers shared by unit, integration and soak tests
//!
//! - Deterministic byte patterns for verifying replay exactness
//! - Polling waits with timeouts
//! - Exact reads over a raw `Connection`

use crate::core::Connection;
use std::io;
use std::time::{Duration, Instant};

/// Byte at absolute stream offset `offset` of the verification pattern
#[inline]
pub fn pattern_byte(offset: u64) -> u8 {
    // 251 is prime, so the pattern never lines up with power-of-two chunk sizes
    (offset % 251) as u8
}

/// `len` bytes of the verification pattern starting at `offset`
pub fn pattern(offset: u64, len: usize) -> Vec<u8> {
    (offset..offset + len as u64).map(pattern_byte).collect()
}

/// Offset of the first byte in `data` that deviates from the pattern
pub fn pattern_mismatch(offset: u64, data: &[u8]) -> Option<u64> {
    data.iter()
        .enumerate()
        .find(|(i, byte)| **byte != pattern_byte(offset + *i as u64))
        .map(|(i, _)| offset + i as u64)
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Read exactly `len` bytes from a raw connection
pub fn read_exact(conn: &dyn Connection, len: usize) -> io::Result<Vec<u8>> {
    let mut out = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match conn.read(&mut out[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("connection closed after {filled} of {len} bytes"),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory_pair;

    #[test]
    fn test_pattern_is_position_dependent() {
        let whole = pattern(0, 600);
        assert_eq!(&pattern(300, 10)[..], &whole[300..310]);
        assert_eq!(pattern_mismatch(0, &whole), None);

        let mut broken = whole.clone();
        broken[42] ^= 0xff;
        assert_eq!(pattern_mismatch(0, &broken), Some(42));
    }

    #[test]
    fn test_wait_until_times_out() {
        assert!(wait_until(Duration::from_millis(5), || true));
        assert!(!wait_until(Duration::from_millis(5), || false));
    }

    #[test]
    fn test_read_exact_reports_short_stream() {
        let (a, b) = memory_pair();
        a.write(b"abc").unwrap();
        a.close().unwrap();

        let err = read_exact(&b, 4).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
