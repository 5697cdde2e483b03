//! [`PeekableStream`] — a 1-byte (or more) lookahead buffer in front of a
//! raw byte stream, used by the TLS sniff to look at the first byte of a
//! connection without consuming it.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Wraps `S` with a small buffered lookahead so callers can [`peek`] ahead
/// without disturbing what a subsequent [`read`] observes.
///
/// [`peek`]: PeekableStream::peek
/// [`read`]: tokio::io::AsyncReadExt::read
pub struct PeekableStream<S> {
    inner: S,
    /// Bytes already pulled off `inner` but not yet handed to a reader.
    lookahead: Vec<u8>,
}

impl<S> PeekableStream<S>
where
    S: AsyncRead + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            lookahead: Vec::new(),
        }
    }

    /// Return up to `n` bytes without advancing the logical read cursor.
    ///
    /// A short read (fewer than `n` bytes) means the peer closed the
    /// connection before `n` bytes arrived; the returned slice holds
    /// whatever arrived before EOF.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.lookahead.len() < n {
            let mut tmp = vec![0u8; n - self.lookahead.len()];
            let read = self.inner.read(&mut tmp).await?;
            if read == 0 {
                break;
            }
            self.lookahead.extend_from_slice(&tmp[..read]);
        }
        let take = n.min(self.lookahead.len());
        Ok(&self.lookahead[..take])
    }

    /// Unwrap back into the inner stream, discarding any buffering
    /// machinery but preserving buffered-but-unread bytes is the caller's
    /// job — use [`PeekableStream`] itself as the stream when bytes must
    /// stay visible.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Borrow the inner stream, e.g. to delegate `local_addr`/`peer_addr`.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S> AsyncRead for PeekableStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.lookahead.is_empty() {
            let n = buf.remaining().min(self.lookahead.len());
            buf.put_slice(&self.lookahead[..n]);
            self.lookahead.drain(..n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for PeekableStream<S>
where
    S: AsyncWrite + Unpin,
{
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
