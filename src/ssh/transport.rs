//! Stdio Transport
//!
//! Presents the process's stdin/stdout as a single duplex byte stream so the
//! SSH server can run over a `ProxyCommand` pipe instead of a TCP socket.
//!
//! - Writes are flushed straight away to keep interactive echo snappy.
//! - A zero-length read is the peer's EOF.
//! - Shutdown is a no-op: closing the process's standard streams is not ours to do.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, Stdin, Stdout};
use tracing::debug;

/// Duplex transport over a reader/writer pair (stdin/stdout in production)
pub struct StdioTransport<R = Stdin, W = Stdout> {
    reader: R,
    writer: W,
    /// A write completed but its flush is still pending
    flush_pending: bool,
}

impl StdioTransport {
    /// Bind to the process's standard streams
    pub fn new() -> Self {
        Self::from_parts(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Build a transport from arbitrary halves (used by tests)
    pub fn from_parts(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            flush_pending: false,
        }
    }

    /// Read timeouts are not supported.
    ///
    /// Exactly one protocol task reads this transport and may block on it for
    /// as long as the peer stays quiet.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        debug!("Ignoring transport timeout {:?}", timeout);
    }

    fn poll_pending_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.flush_pending {
            match Pin::new(&mut self.writer).poll_flush(cx) {
                Poll::Ready(Ok(())) => self.flush_pending = false,
                other => return other,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<R, W> AsyncRead for StdioTransport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl<R, W> AsyncWrite for StdioTransport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(Err(e)) = this.poll_pending_flush(cx) {
            return Poll::Ready(Err(e));
        }

        let written = match Pin::new(&mut this.writer).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => n,
            other => return other,
        };

        // Flush eagerly; if the writer is not ready yet the next write or
        // explicit flush picks it up.
        this.flush_pending = true;
        if let Poll::Ready(Err(e)) = this.poll_pending_flush(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.flush_pending = false;
        Pin::new(&mut this.writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        debug!("Ignoring transport close");
        let this = self.get_mut();
        this.flush_pending = false;
        Pin::new(&mut this.writer).poll_flush(cx)
    }
}
