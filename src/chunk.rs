//! Length-prefixed framing for client streams.
//!
//! Each chunk is a 4-byte big-endian length followed by exactly that many
//! payload bytes. Both sides of a client connection use these functions, so
//! the byte order is fixed here and nowhere else.
//!
//! The codec assumes a local or low-latency link where whole chunks arrive
//! and depart together: a short read or write is reported as a broken
//! connection rather than retried.

use std::io::{self, ErrorKind, Read, Write};

use thiserror::Error;

/// Largest payload a single chunk may carry.
///
/// Rejecting the length header before allocating keeps a corrupt or hostile
/// peer from requesting multi-gigabyte buffers.
pub const MAX_CHUNK_LEN: u32 = 16 * 1024 * 1024;

/// Framing failure on a client stream.
///
/// Every variant except [`ChunkError::Io`] means the connection is no
/// longer usable for framed traffic and should be torn down.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// The peer closed the connection cleanly.
    #[error("closed connection")]
    Closed,
    /// A chunk did not arrive in one piece.
    #[error("chunk did not arrive all at once")]
    Truncated,
    /// A chunk could not be written in one piece.
    #[error("short write on chunk")]
    ShortWrite,
    /// The length header exceeds [`MAX_CHUNK_LEN`].
    #[error("chunk length {0} exceeds the {MAX_CHUNK_LEN} byte limit")]
    Oversized(u32),
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Writes one framed chunk: the length header, then the payload.
///
/// # Errors
///
/// Fails with [`ChunkError::ShortWrite`] if either write returns a short
/// count, [`ChunkError::Oversized`] if the payload exceeds
/// [`MAX_CHUNK_LEN`], or [`ChunkError::Io`] on any other I/O failure.
// TODO loop on partial writes if wide-area client links ever become a
// target; the handler's network model has to be revisited at the same time.
pub fn send_chunk<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), ChunkError> {
    let len = u32::try_from(payload.len()).map_err(|_| ChunkError::Oversized(u32::MAX))?;
    if len > MAX_CHUNK_LEN {
        return Err(ChunkError::Oversized(len));
    }

    let header = len.to_be_bytes();
    if writer.write(&header)? != header.len() {
        return Err(ChunkError::ShortWrite);
    }
    if !payload.is_empty() && writer.write(payload)? != payload.len() {
        return Err(ChunkError::ShortWrite);
    }
    writer.flush()?;
    Ok(())
}

/// Reads one framed chunk, or `Ok(None)` when no data is buffered.
///
/// `Ok(None)` is only produced by `WouldBlock` at the first header byte,
/// i.e. a non-blocking source with nothing pending; a readiness loop drains
/// a stream by calling this until it returns `None`.
///
/// # Errors
///
/// Fails with [`ChunkError::Closed`] on a zero-length read (clean peer
/// close), [`ChunkError::Truncated`] when the header or payload arrives
/// short, [`ChunkError::Oversized`] for an absurd length header, or
/// [`ChunkError::Io`] on any other I/O failure.
pub fn recv_chunk<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, ChunkError> {
    let mut header = [0u8; 4];
    match reader.read(&mut header) {
        Ok(0) => return Err(ChunkError::Closed),
        Ok(n) if n == header.len() => {}
        Ok(_) => return Err(ChunkError::Truncated),
        Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
        Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(None),
        Err(e) => return Err(ChunkError::Io(e)),
    }

    let len = u32::from_be_bytes(header);
    if len > MAX_CHUNK_LEN {
        return Err(ChunkError::Oversized(len));
    }

    let mut payload = vec![0u8; len as usize];
    if !payload.is_empty() {
        match reader.read(&mut payload) {
            Ok(0) => return Err(ChunkError::Closed),
            Ok(n) if n == payload.len() => {}
            Ok(_) => return Err(ChunkError::Truncated),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Err(ChunkError::Truncated),
            Err(e) => return Err(ChunkError::Io(e)),
        }
    }
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream};

    use super::*;

    /// Connected blocking stream pair over loopback.
    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    #[test]
    fn roundtrip_in_memory() {
        let mut wire = Vec::new();
        send_chunk(&mut wire, b"increment").unwrap();

        let mut reader = wire.as_slice();
        let got = recv_chunk(&mut reader).unwrap().unwrap();
        assert_eq!(got, b"increment");
        assert!(reader.is_empty());
    }

    #[test]
    fn roundtrip_over_tcp() {
        let (mut tx, mut rx) = tcp_pair();
        send_chunk(&mut tx, b"hello").unwrap();

        let got = recv_chunk(&mut rx).unwrap().unwrap();
        assert_eq!(got, b"hello");
    }

    #[test]
    fn empty_payload_is_a_valid_chunk() {
        let (mut tx, mut rx) = tcp_pair();
        send_chunk(&mut tx, b"").unwrap();

        let got = recv_chunk(&mut rx).unwrap().unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn consecutive_chunks_keep_their_boundaries() {
        let (mut tx, mut rx) = tcp_pair();
        send_chunk(&mut tx, b"one").unwrap();
        send_chunk(&mut tx, b"two").unwrap();

        assert_eq!(recv_chunk(&mut rx).unwrap().unwrap(), b"one");
        assert_eq!(recv_chunk(&mut rx).unwrap().unwrap(), b"two");
    }

    #[test]
    fn peer_close_reports_closed() {
        let (tx, mut rx) = tcp_pair();
        drop(tx);

        assert!(matches!(recv_chunk(&mut rx), Err(ChunkError::Closed)));
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&u32::MAX.to_be_bytes());
        wire.extend_from_slice(b"junk");

        let mut reader = wire.as_slice();
        assert!(matches!(
            recv_chunk(&mut reader),
            Err(ChunkError::Oversized(u32::MAX))
        ));
    }

    #[test]
    fn oversized_payload_is_rejected_before_write() {
        struct NoWrite;
        impl Write for NoWrite {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                panic!("oversized payload must be rejected before any write");
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let payload = vec![0u8; MAX_CHUNK_LEN as usize + 1];
        assert!(matches!(
            send_chunk(&mut NoWrite, &payload),
            Err(ChunkError::Oversized(_))
        ));
    }

    #[test]
    fn truncated_header_is_reported() {
        let mut wire = Vec::new();
        send_chunk(&mut wire, b"whole").unwrap();
        wire.truncate(2); // half a header

        let mut reader = wire.as_slice();
        // A 2-byte slice read yields 2 of the 4 header bytes.
        assert!(matches!(
            recv_chunk(&mut reader),
            Err(ChunkError::Truncated)
        ));
    }

    #[test]
    fn truncated_payload_is_reported() {
        let mut wire = Vec::new();
        send_chunk(&mut wire, b"whole").unwrap();
        wire.truncate(6); // header plus two payload bytes

        let mut reader = wire.as_slice();
        assert!(matches!(
            recv_chunk(&mut reader),
            Err(ChunkError::Truncated)
        ));
    }
}
