//! A single client connection.
//!
//! Each accepted socket becomes a `Connection` owned by the registry. It
//! carries a fixed-capacity receive buffer: new bytes are appended after
//! whatever is still unconsumed, and complete frames are split off the
//! front as they are relayed.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Decoder;

use casper_protocol::{FrameCodec, FrameError, HEADER_LEN};

use crate::registry::Descriptor;

/// Upper bound on a single relay write before the peer is considered stuck (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of one non-blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were appended to the buffer
    Data(usize),
    /// Peer performed an orderly shutdown
    Closed,
    /// Nothing to read right now (interrupted or would block)
    Transient,
    /// Buffer has no spare room this tick
    BufferFull,
}

/// Client connection state.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: BytesMut,
    capacity: usize,
    /// Cleared when an error marks this connection for the next sweep
    alive: bool,
}

impl Connection {
    /// Wraps an accepted stream with a receive buffer of `capacity` bytes.
    pub fn new(stream: TcpStream, peer: SocketAddr, capacity: usize) -> Self {
        Self {
            stream,
            peer,
            buffer: BytesMut::with_capacity(capacity),
            capacity,
            alive: true,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Marks the connection for removal at the end of the tick.
    pub fn mark_dead(&mut self) {
        self.alive = false;
    }

    /// Number of received bytes not yet consumed as frames.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// True when at least a full length header is buffered.
    pub fn has_header(&self) -> bool {
        self.buffer.len() >= HEADER_LEN
    }

    /// Performs one non-blocking receive into the spare buffer room.
    pub fn fill(&mut self) -> Result<ReadOutcome, ConnectionError> {
        let room = self.capacity.saturating_sub(self.buffer.len());
        if room == 0 {
            return Ok(ReadOutcome::BufferFull);
        }

        self.buffer.reserve(room);
        let mut window = (&mut self.buffer).limit(room);
        match self.stream.try_read_buf(&mut window) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if is_transient(&e) => Ok(ReadOutcome::Transient),
            Err(e) => Err(ConnectionError::Io(e.to_string())),
        }
    }

    /// Splits the next complete frame off the front of the buffer.
    ///
    /// Returns `Ok(None)` while the frame is still incomplete.
    pub fn next_frame(
        &mut self,
        codec: &mut FrameCodec,
    ) -> Result<Option<Bytes>, ConnectionError> {
        codec.decode(&mut self.buffer).map_err(ConnectionError::from)
    }

    /// Writes all of `bytes`, waiting out short writes and would-block.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        match timeout(WRITE_TIMEOUT, self.stream.write_all(bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }

    /// Zero-length write used to detect peers that have gone away.
    pub fn probe(&self) -> Result<(), ConnectionError> {
        match self.stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => return Err(ConnectionError::Io(e.to_string())),
        }

        match self.stream.try_write(&[]) {
            Ok(_) => Ok(()),
            Err(e) if is_transient(&e) => Ok(()),
            Err(e) => Err(ConnectionError::Io(e.to_string())),
        }
    }
}

impl Descriptor for Connection {
    fn descriptor(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Interrupted and would-block are retried on a later tick, never fatal.
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

impl From<FrameError> for ConnectionError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Oversized { len, max } => Self::MessageTooLarge { size: len, max },
            FrameError::Io(e) => Self::Io(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair(capacity: usize) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (Connection::new(server, peer, capacity), client)
    }

    async fn fill_until(conn: &mut Connection, want: usize) {
        while conn.buffered() < want {
            conn.stream().readable().await.unwrap();
            match conn.fill().unwrap() {
                ReadOutcome::Closed => panic!("peer closed early"),
                ReadOutcome::BufferFull => break,
                _ => {}
            }
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::BrokenPipe)));
    }

    #[test]
    fn test_message_size_error() {
        let err = ConnectionError::from(FrameError::Oversized {
            len: 2_000_000,
            max: 65_532,
        });
        assert!(err.to_string().contains("2000000"));
    }

    #[tokio::test]
    async fn test_fill_respects_capacity() {
        let (mut conn, mut client) = pair(8).await;
        client.write_all(&[1u8; 20]).await.unwrap();

        fill_until(&mut conn, 8).await;
        assert_eq!(conn.buffered(), 8);
        assert_eq!(conn.fill().unwrap(), ReadOutcome::BufferFull);
    }

    #[tokio::test]
    async fn test_frames_split_from_front() {
        let (mut conn, mut client) = pair(64).await;
        let mut codec = FrameCodec::for_capacity(64);
        client.write_all(b"\x00\x00\x00\x02hi\x00\x00\x00\x03yo").await.unwrap();

        fill_until(&mut conn, 12).await;
        let first = conn.next_frame(&mut codec).unwrap().unwrap();
        assert_eq!(&first[..], b"hi");
        assert!(conn.next_frame(&mut codec).unwrap().is_none());
        assert_eq!(conn.buffered(), 6, "incomplete second frame stays buffered");
    }

    #[tokio::test]
    async fn test_fill_reports_orderly_close() {
        let (mut conn, client) = pair(64).await;
        drop(client);

        conn.stream().readable().await.unwrap();
        assert_eq!(conn.fill().unwrap(), ReadOutcome::Closed);
    }

    #[tokio::test]
    async fn test_probe_healthy_peer() {
        let (conn, _client) = pair(64).await;
        conn.stream().writable().await.unwrap();
        assert!(conn.probe().is_ok());
        assert!(conn.is_alive());
    }
}
