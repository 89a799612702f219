//! In-memory byte transport pairing a migration source with its target.
//!
//! `pipe_pair` hands out two connected endpoints backed by a bounded
//! duplex buffer. Writes block once the peer's buffer is full, closing the
//! write side delivers EOF to the peer, and writing after the peer dropped
//! fails with a broken-pipe error. Dropping either endpoint unblocks any
//! I/O the other side has pending.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

/// Buffer capacity used when the caller has no preference.
pub const DEFAULT_PIPE_CAPACITY: usize = 4 * 1024 * 1024;

/// One endpoint of an in-memory migration transport.
#[derive(Debug)]
pub struct MigrationConn {
    stream: DuplexStream,
}

/// Two connected endpoints with the given buffer capacity per direction.
pub fn pipe_pair(capacity: usize) -> (MigrationConn, MigrationConn) {
    let (a, b) = tokio::io::duplex(capacity.max(1));
    (MigrationConn { stream: a }, MigrationConn { stream: b })
}

impl AsyncRead for MigrationConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MigrationConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_round_trip_and_eof() {
        let (mut a, mut b) = pipe_pair(64);

        a.write_all(b"payload").await.unwrap();
        a.shutdown().await.unwrap();

        let mut received = Vec::new();
        b.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"payload");
    }

    #[tokio::test]
    async fn test_write_after_peer_drop_fails() {
        let (mut a, b) = pipe_pair(8);
        drop(b);

        let err = a.write_all(b"payload").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_bounded_capacity_backpressure() {
        let (mut a, mut b) = pipe_pair(4);

        let writer = tokio::spawn(async move {
            a.write_all(&[0u8; 32]).await.unwrap();
            a.shutdown().await.unwrap();
        });

        // Writer cannot finish until the reader drains the buffer.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        let mut sink = Vec::new();
        b.read_to_end(&mut sink).await.unwrap();
        assert_eq!(sink.len(), 32);
        writer.await.unwrap();
    }
}
