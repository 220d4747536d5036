//! Transport abstractions for client-facing connections.
//!
//! The proxy never downcasts a live stream to discover what it can do.
//! Instead every accepted connection is wrapped in a [`ClientConn`] that
//! carries its capabilities (terminated TLS, traffic shaping) alongside a
//! type-erased byte stream, and the handler queries the wrapper.

pub mod peeked;

pub use peeked::PeekedStream;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::trafficshape;

/// Byte stream usable as a proxy transport.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

impl std::fmt::Debug for dyn Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Stream")
    }
}

/// Owned, type-erased transport stream.
pub type BoxStream = Box<dyn Stream>;

/// Keep-alive period for accepted client sockets.
const CLIENT_KEEPALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// Source of client connections for [`Proxy::serve`](crate::proxy::Proxy::serve).
///
/// Implemented for [`tokio::net::TcpListener`] and for
/// [`trafficshape::Listener`], which yields shaped connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept the next client connection.
    async fn accept(&self) -> io::Result<ClientConn>;
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> io::Result<ClientConn> {
        let (stream, _) = TcpListener::accept(self).await?;
        Ok(ClientConn::tcp(stream))
    }
}

/// A client connection plus the capabilities of its transport.
pub struct ClientConn {
    io: BoxStream,
    peer_addr: Option<SocketAddr>,
    /// SNI server name, present once TLS has been terminated inside the proxy.
    tls_server_name: Option<String>,
    shape: Option<trafficshape::Handle>,
}

impl ClientConn {
    /// Wrap a freshly accepted TCP stream.
    ///
    /// Enables TCP keep-alive with a 3-minute period. Suppressing SIGPIPE
    /// is a no-op here: socket writes report `EPIPE` instead of raising
    /// the signal.
    pub fn tcp(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        configure_keepalive(&stream, CLIENT_KEEPALIVE_PERIOD);
        Self {
            io: Box::new(stream),
            peer_addr,
            tls_server_name: None,
            shape: None,
        }
    }

    pub(crate) fn from_parts(
        io: BoxStream,
        peer_addr: Option<SocketAddr>,
        tls_server_name: Option<String>,
        shape: Option<trafficshape::Handle>,
    ) -> Self {
        Self {
            io,
            peer_addr,
            tls_server_name,
            shape,
        }
    }

    /// Placeholder left behind once the real stream has been taken for a
    /// tunnel or a TLS upgrade. Reads yield EOF, writes fail.
    pub(crate) fn detached() -> Self {
        Self {
            io: Box::new(DetachedStream),
            peer_addr: None,
            tls_server_name: None,
            shape: None,
        }
    }

    /// Remote address of the underlying socket, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// SNI server name when this transport is proxy-terminated TLS.
    pub fn tls_server_name(&self) -> Option<&str> {
        self.tls_server_name.as_deref()
    }

    /// Whether this transport is TLS terminated inside the proxy.
    pub fn is_terminated_tls(&self) -> bool {
        self.tls_server_name.is_some()
    }

    /// Traffic-shape capability of this transport, if present.
    pub fn shape_handle(&self) -> Option<&trafficshape::Handle> {
        self.shape.as_ref()
    }

    pub(crate) fn into_io(self) -> BoxStream {
        self.io
    }
}

impl AsyncRead for ClientConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for ClientConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Enable TCP keep-alive on a socket, logging failures instead of
/// propagating them.
pub(crate) fn configure_keepalive(stream: &TcpStream, period: Duration) {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(period);
    if let Err(e) = sock
        .set_keepalive(true)
        .and_then(|()| sock.set_tcp_keepalive(&keepalive))
    {
        debug!("failed to enable TCP keep-alive: {}", e);
    }
}

/// Stream standing in for a transport that has been handed elsewhere.
struct DetachedStream;

impl AsyncRead for DetachedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for DetachedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "transport detached",
        )))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn detached_stream_reads_eof_and_rejects_writes() {
        let mut conn = ClientConn::detached();

        let mut out = Vec::new();
        let n = conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(n, 0);

        let err = conn.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn tcp_conn_carries_peer_addr_and_no_capabilities() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });

        let (stream, peer) = TcpListener::accept(&listener).await.unwrap();
        let conn = ClientConn::tcp(stream);

        assert_eq!(conn.peer_addr(), Some(peer));
        assert!(!conn.is_terminated_tls());
        assert!(conn.shape_handle().is_none());
        client.await.unwrap();
    }
}
