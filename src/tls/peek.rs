use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Stream wrapper whose peeked bytes are handed out again by the first reads
#[derive(Debug)]
pub struct PeekableStream<S> {
    inner: S,
    buf: Vec<u8>,
    pos: usize,
}

impl<S> PeekableStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Bytes read ahead and not yet consumed
    pub fn peeked(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwrap into the inner stream and the unconsumed peeked bytes
    pub fn into_parts(mut self) -> (S, Vec<u8>) {
        let rest = self.buf.split_off(self.pos);
        (self.inner, rest)
    }
}

impl<S: AsyncRead + Unpin> PeekableStream<S> {
    /// Read ahead until `n` bytes are buffered or the stream ends
    ///
    /// Returns at most `n` buffered bytes without consuming them. Bytes read
    /// before a cancellation stay buffered.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buf.len() - self.pos < n {
            let mut chunk = vec![0u8; n - (self.buf.len() - self.pos)];
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
        let end = (self.pos + n).min(self.buf.len());
        Ok(&self.buf[self.pos..end])
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekableStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.pos < this.buf.len() {
            let n = (this.buf.len() - this.pos).min(out.remaining());
            out.put_slice(&this.buf[this.pos..this.pos + n]);
            this.pos += n;
            if this.pos == this.buf.len() {
                this.buf.clear();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekableStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
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
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn test_peeked_bytes_are_replayed() {
        let (mut client, server) = duplex(64);
        client.write_all(&[0x16, 0x03, 0x01, 0x00, 0x05]).await.unwrap();
        drop(client);

        let mut stream = PeekableStream::new(server);
        assert_eq!(stream.peek(3).await.unwrap(), &[0x16, 0x03, 0x01]);
        // Peeking again does not consume
        assert_eq!(stream.peek(2).await.unwrap(), &[0x16, 0x03]);

        let mut all = Vec::new();
        stream.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, vec![0x16, 0x03, 0x01, 0x00, 0x05]);
    }

    #[tokio::test]
    async fn test_peek_short_stream() {
        let (mut client, server) = duplex(64);
        client.write_all(b"x").await.unwrap();
        drop(client);

        let mut stream = PeekableStream::new(server);
        assert_eq!(stream.peek(3).await.unwrap(), b"x");
        let (_, rest) = stream.into_parts();
        assert_eq!(rest, b"x");
    }

    #[tokio::test]
    async fn test_small_reads_drain_buffer_in_order() {
        let (mut client, server) = duplex(64);
        client.write_all(b"abcdef").await.unwrap();

        let mut stream = PeekableStream::new(server);
        stream.peek(4).await.unwrap();

        let mut two = [0u8; 2];
        stream.read_exact(&mut two).await.unwrap();
        assert_eq!(&two, b"ab");
        assert_eq!(stream.peeked(), b"cd");

        let mut four = [0u8; 4];
        stream.read_exact(&mut four).await.unwrap();
        assert_eq!(&four, b"cdef");
        assert!(stream.peeked().is_empty());
    }
}
