//! Prefix-then-live stream wrapper.
//!
//! After answering a CONNECT, the proxy sniffs bytes off the tunnel to
//! classify the payload. Those bytes have already been consumed from the
//! socket, so whatever parses the stream next (the TLS handshaker, or the
//! request parser on the clear-HTTP branch) must see them again, in order,
//! followed by live data. [`PeekedStream`] serves a retained prefix until
//! it is exhausted and then falls through to the inner stream; writes
//! always go straight through.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream that replays sniffed bytes before reading live data.
pub struct PeekedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PeekedStream<S> {
    /// Wrap `inner`, re-serving `prefix` ahead of its own data.
    pub fn new(inner: S, prefix: Bytes) -> Self {
        Self { prefix, inner }
    }

    /// Bytes of the prefix not yet consumed by reads.
    pub fn remaining_prefix(&self) -> &[u8] {
        &self.prefix
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
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
