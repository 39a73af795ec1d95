//! Message framing over a raw duplex byte stream.
//!
//! The relay protocol has no length prefix and no delimiter: a message is
//! whatever a single transport read returns, capped at the receive buffer
//! capacity. Consequences:
//! - a message longer than the buffer arrives as several messages
//! - several small writes coalesced by the transport arrive as one message
//!
//! The two halves are split so that the read side stays private to the
//! session that owns it while the write side can be shared with every
//! broadcaster that needs to reach that session.

use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};

/// Default receive buffer capacity (payload bytes per message).
pub const DEFAULT_BUFFER_SIZE: usize = 4095;

/// Read side of a framed connection.
///
/// Owns its receive buffer; a reader is never shared between tasks.
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
    capacity: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader with the default buffer capacity.
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, DEFAULT_BUFFER_SIZE)
    }

    /// Create a reader that returns at most `capacity` bytes per message.
    pub fn with_capacity(inner: R, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner,
            buffer: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum number of bytes returned by a single read.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` once the peer has closed the stream. The returned
    /// bytes are exactly what one read of the underlying stream produced.
    /// Cancel safe: dropping the future before it completes loses no data.
    pub async fn read(&mut self) -> io::Result<Option<Bytes>> {
        self.buffer.clear();
        self.buffer.resize(self.capacity, 0);

        let n = self.inner.read(&mut self.buffer[..]).await?;
        if n == 0 {
            return Ok(None);
        }

        self.buffer.truncate(n);
        Ok(Some(self.buffer.split().freeze()))
    }
}

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of a framed connection.
///
/// Writes are serialized so two messages never interleave on the wire.
/// Closing is idempotent and never waits on an in-flight write: the stream
/// is shut down either by the `close` call or, if a write was holding it, by
/// that write once it finishes. At the latest it is released when the writer
/// is dropped.
pub struct FrameWriter {
    stream: Mutex<Option<BoxedWrite>>,
    closed: watch::Sender<bool>,
}

impl FrameWriter {
    pub fn new<W>(stream: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Self {
            stream: Mutex::new(Some(Box::new(stream))),
            closed,
        }
    }

    /// Write one complete message and flush it.
    ///
    /// Fails with `NotConnected` once the writer has been closed.
    pub async fn write(&self, message: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(not_connected());
        }

        let mut guard = self.stream.lock().await;
        if self.is_closed() {
            release(guard.take()).await;
            return Err(not_connected());
        }

        let stream = guard.as_mut().ok_or_else(not_connected)?;
        let result = write_message(stream, message).await;

        // close() may have run while we held the stream
        if result.is_err() || self.is_closed() {
            release(guard.take()).await;
        }

        result
    }

    /// Close the writer.
    ///
    /// Returns `true` for the call that actually closed it and `false` for
    /// every later call.
    pub async fn close(&self) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }

        // A write in progress releases the stream itself when it finishes.
        let stream = match self.stream.try_lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        release(stream).await;

        true
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolve once the writer has been closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so this only returns once closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

async fn write_message(stream: &mut BoxedWrite, message: &[u8]) -> io::Result<()> {
    stream.write_all(message).await?;
    stream.flush().await
}

/// Shut down the write direction so the peer observes end of stream.
async fn release(stream: Option<BoxedWrite>) {
    if let Some(mut stream) = stream {
        let _ = stream.shutdown().await;
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_read_returns_one_message_per_read() {
        let mock = tokio_test::io::Builder::new()
            .read(b"__CONNECT__Alice")
            .read(b"hello")
            .build();
        let mut reader = FrameReader::new(mock);

        assert_eq!(reader.read().await.unwrap().unwrap(), &b"__CONNECT__Alice"[..]);
        assert_eq!(reader.read().await.unwrap().unwrap(), &b"hello"[..]);
        assert!(reader.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_is_capped_at_capacity() {
        let mock = tokio_test::io::Builder::new().read(b"abcdefgh").build();
        let mut reader = FrameReader::with_capacity(mock, 5);

        // Oversized input is split, not reassembled.
        assert_eq!(reader.read().await.unwrap().unwrap(), &b"abcde"[..]);
        assert_eq!(reader.read().await.unwrap().unwrap(), &b"fgh"[..]);
        assert!(reader.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_default_capacity() {
        let mock = tokio_test::io::Builder::new().build();
        let reader = FrameReader::new(mock);
        assert_eq!(reader.capacity(), DEFAULT_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_read_error_propagates() {
        let mock = tokio_test::io::Builder::new()
            .read(b"hi")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut reader = FrameReader::new(mock);

        assert_eq!(reader.read().await.unwrap().unwrap(), &b"hi"[..]);
        let err = reader.read().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_write_reaches_peer() {
        let (local, remote) = duplex(64);
        let writer = FrameWriter::new(local);
        let mut reader = FrameReader::new(remote);

        writer.write(b"Alice : hello").await.unwrap();
        assert_eq!(reader.read().await.unwrap().unwrap(), &b"Alice : hello"[..]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (local, remote) = duplex(64);
        let writer = FrameWriter::new(local);
        let mut reader = FrameReader::new(remote);

        assert!(writer.close().await);
        assert!(!writer.close().await);
        assert!(writer.is_closed());

        // Releasing the write half ends the peer's stream.
        assert!(reader.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (local, _remote) = duplex(64);
        let writer = FrameWriter::new(local);
        writer.close().await;

        let err = writer.write(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_write_to_dropped_peer_fails() {
        let (local, remote) = duplex(64);
        let writer = FrameWriter::new(local);
        drop(remote);

        assert!(writer.write(b"hello").await.is_err());
        // A failed write releases the stream.
        let err = writer.write(b"again").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let (local, _remote) = duplex(64);
        let writer = std::sync::Arc::new(FrameWriter::new(local));

        let waiter = {
            let writer = writer.clone();
            tokio::spawn(async move { writer.closed().await })
        };

        writer.close().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed() did not resolve")
            .unwrap();

        // Already closed: resolves immediately.
        tokio::time::timeout(Duration::from_secs(1), writer.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_does_not_wait_for_blocked_write() {
        // A tiny pipe nobody reads from stalls the write.
        let (local, _remote) = duplex(4);
        let writer = std::sync::Arc::new(FrameWriter::new(local));

        let blocked = {
            let writer = writer.clone();
            tokio::spawn(async move { writer.write(b"this will not fit").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let closed = tokio::time::timeout(Duration::from_secs(1), writer.close())
            .await
            .expect("close() waited for the blocked write");
        assert!(closed);
        assert!(writer.is_closed());
        blocked.abort();
    }
}
