//! Interface consumed from the traffic-shaping transport.
//!
//! The shaping engine itself (token buckets, byte-range actions, write
//! throttling) lives outside the proxy core. The core consumes a small
//! surface: per-URL-pattern buckets on a shaped connection, throttle and
//! next-action lookups by byte offset, a listener that wraps arbitrary
//! streams as shaped, and a per-connection [`Context`] the pipeline
//! populates right before writing a response so the shaped writer knows
//! what it is carrying.

use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use regex::Regex;
use tokio::net::TcpListener;

use crate::net::{BoxStream, ClientConn, Listener as NetListener};

/// A token bucket owned by the shaping engine. The core only adjusts its
/// capacity when a throttled byte range applies.
#[derive(Debug)]
pub struct Bucket {
    capacity: AtomicI64,
}

impl Bucket {
    /// Create a bucket with the given capacity in bytes per interval.
    pub fn new(capacity: i64) -> Self {
        Self {
            capacity: AtomicI64::new(capacity),
        }
    }

    /// Current capacity.
    pub fn capacity(&self) -> i64 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Replace the capacity, e.g. when a throttle starts applying.
    pub fn set_capacity(&self, capacity: i64) {
        self.capacity.store(capacity, Ordering::Relaxed);
    }
}

/// Read/write bucket pair local to one URL pattern.
#[derive(Debug)]
pub struct Buckets {
    /// Bucket governing writes toward the client.
    pub write_bucket: Arc<Bucket>,
    /// Bucket governing reads from the client.
    pub read_bucket: Arc<Bucket>,
}

/// Throttle applying to a response byte range.
#[derive(Debug, Clone)]
pub struct Throttle {
    /// First byte of the throttled range.
    pub bytes_start: i64,
    /// Byte after the throttled range (`i64::MAX` for open-ended).
    pub bytes_end: i64,
    /// Bandwidth in bytes per second inside the range.
    pub bandwidth: i64,
}

/// Result of a throttle lookup at a byte offset.
#[derive(Debug, Clone, Default)]
pub struct ThrottleContext {
    /// Whether the offset lies inside a throttled range.
    pub throttle_now: bool,
    /// Bandwidth of that range when `throttle_now` is set.
    pub bandwidth: i64,
}

/// Result of a next-action lookup at a byte offset.
#[derive(Debug, Clone, Default)]
pub struct NextActionInfo {
    /// Whether a further action lies ahead of the offset.
    pub action_next: bool,
    /// Offset of that action when `action_next` is set.
    pub byte_offset: i64,
}

/// Shaping configuration for one URL pattern.
#[derive(Debug)]
pub struct Shape {
    /// Pattern matched against the request URL.
    pub pattern: Regex,
    /// Buckets local to this pattern.
    pub buckets: Arc<Buckets>,
    /// Bucket shared across connections for this pattern.
    pub global_bucket: Arc<Bucket>,
    /// Throttled byte ranges, ordered by start offset.
    pub throttles: Vec<Throttle>,
}

impl Shape {
    /// Build a shape with default buckets and no throttles.
    pub fn new(pattern: Regex) -> Self {
        Self {
            pattern,
            buckets: Arc::new(Buckets {
                write_bucket: Arc::new(Bucket::new(i64::MAX)),
                read_bucket: Arc::new(Bucket::new(i64::MAX)),
            }),
            global_bucket: Arc::new(Bucket::new(i64::MAX)),
            throttles: Vec::new(),
        }
    }

    /// Throttle state at `offset`.
    pub fn current_throttle(&self, offset: i64) -> ThrottleContext {
        for t in &self.throttles {
            if offset >= t.bytes_start && offset < t.bytes_end {
                return ThrottleContext {
                    throttle_now: true,
                    bandwidth: t.bandwidth,
                };
            }
        }
        ThrottleContext::default()
    }

    /// Next shaping action strictly after `offset`.
    pub fn next_action(&self, offset: i64) -> NextActionInfo {
        for t in &self.throttles {
            if t.bytes_start > offset {
                return NextActionInfo {
                    action_next: true,
                    byte_offset: t.bytes_start,
                };
            }
        }
        NextActionInfo::default()
    }
}

/// Per-response shaping context, set by the pipeline before the response
/// write so the shaped writer knows offsets and applicable buckets.
#[derive(Debug, Default)]
pub struct Context {
    /// Whether shaping applies to the response being written.
    pub shaping: bool,
    /// Buckets of the matched pattern.
    pub buckets: Option<Arc<Buckets>>,
    /// Global bucket of the matched pattern.
    pub global_bucket: Option<Arc<Bucket>>,
    /// The matched pattern, verbatim.
    pub url_pattern: String,
    /// Range start carried by the response.
    pub range_start: i64,
    /// Current byte offset within the shaped resource.
    pub byte_offset: i64,
    /// Serialized response-header length.
    pub header_len: i64,
    /// Header bytes written so far.
    pub header_bytes_written: i64,
    /// Next shaping action ahead of the range start.
    pub next_action: NextActionInfo,
    /// Throttle state at the range start.
    pub throttle: ThrottleContext,
}

/// Per-connection shaping state shared with the shaped stream.
#[derive(Debug, Default)]
pub struct ConnState {
    context: Mutex<Context>,
}

/// Traffic-shape capability carried by a [`ClientConn`].
#[derive(Clone)]
pub struct Handle {
    shapes: Arc<Vec<Arc<Shape>>>,
    state: Arc<ConnState>,
}

impl Handle {
    /// Shapes configured on the originating listener.
    pub fn shapes(&self) -> &[Arc<Shape>] {
        &self.shapes
    }

    /// Install the shaping context for the response about to be written.
    pub fn set_context(&self, context: Context) {
        *self.state.context.lock().expect("shape context poisoned") = context;
    }

    /// Run `f` against the current shaping context.
    pub fn with_context<T>(&self, f: impl FnOnce(&Context) -> T) -> T {
        f(&self.state.context.lock().expect("shape context poisoned"))
    }

    /// Wrap another stream as traffic-shaped with fresh per-connection
    /// state, sharing this handle's shapes. Used to rewrap the TLS stream
    /// after a MITM upgrade.
    pub fn rewrap(&self, io: BoxStream) -> (BoxStream, Handle) {
        wrap(self.shapes.clone(), io)
    }
}

fn wrap(shapes: Arc<Vec<Arc<Shape>>>, io: BoxStream) -> (BoxStream, Handle) {
    let state = Arc::new(ConnState::default());
    let handle = Handle {
        shapes,
        state: state.clone(),
    };
    (Box::new(ShapedStream { inner: io, state }), handle)
}

/// Listener yielding traffic-shaped client connections.
pub struct Listener {
    inner: TcpListener,
    shapes: Arc<Vec<Arc<Shape>>>,
}

impl Listener {
    /// Wrap a TCP listener with the given shapes.
    pub fn new(inner: TcpListener, shapes: Vec<Shape>) -> Self {
        Self {
            inner,
            shapes: Arc::new(shapes.into_iter().map(Arc::new).collect()),
        }
    }

    /// Local address of the underlying listener.
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.inner.local_addr()
    }
}

#[async_trait]
impl NetListener for Listener {
    async fn accept(&self) -> io::Result<ClientConn> {
        let (stream, peer) = self.inner.accept().await?;
        crate::net::configure_keepalive(&stream, std::time::Duration::from_secs(3 * 60));
        let (io, handle) = wrap(self.shapes.clone(), Box::new(stream));
        Ok(ClientConn::from_parts(io, Some(peer), None, Some(handle)))
    }
}

/// Stream whose writes are governed by the shaping engine.
///
/// The engine internals are not part of the proxy core; this wrapper
/// carries the shared state the engine and the pipeline exchange.
struct ShapedStream {
    inner: BoxStream,
    #[allow(dead_code)]
    state: Arc<ConnState>,
}

impl tokio::io::AsyncRead for ShapedStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for ShapedStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Marker error the shaped writer raises to demand connection teardown.
#[derive(Debug, thiserror::Error)]
#[error("traffic shape forced connection close")]
pub struct ForceClose;

/// Build the force-close write error.
pub fn force_close_error() -> io::Error {
    io::Error::other(ForceClose)
}

/// Whether a write error is the shaping engine's force-close demand.
pub fn is_force_close(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|e| e.is::<ForceClose>())
}
