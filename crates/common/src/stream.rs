// SPDX-License-Identifier: MIT

// boringproxy - Replay stream wrapper
// Re-presents bytes that were consumed while peeking the ClientHello, then
// hands off to the underlying stream. Writes and shutdown pass straight
// through, so half-close still reaches the socket and
// `tokio::io::copy_bidirectional` can run its usual EOF dance.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream with a buffered prefix. Reads drain the prefix first, then the
/// inner stream; everything else is forwarded untouched.
#[derive(Debug)]
pub struct PeekedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PeekedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let n = (self.prefix.len() - self.pos).min(buf.remaining());
            let pos = self.pos;
            buf.put_slice(&self.prefix[pos..pos + n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn replays_prefix_before_inner_stream() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"world").await.unwrap();
        drop(tx);

        let mut stream = PeekedStream::new(b"hello ".to_vec(), rx);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn small_reads_drain_prefix_incrementally() {
        let (tx, rx) = tokio::io::duplex(64);
        drop(tx);

        let mut stream = PeekedStream::new(b"abcdef".to_vec(), rx);
        let mut buf = [0u8; 4];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn writes_and_shutdown_pass_through() {
        let (local, mut remote) = tokio::io::duplex(64);

        let mut stream = PeekedStream::new(Vec::new(), local);
        stream.write_all(b"ping").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut out = Vec::new();
        remote.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"ping");
    }
}
