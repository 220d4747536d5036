//! HTTP/1.x forward proxy core.
//!
//! [`Proxy`] ties the pieces together: an accept loop with backoff, a
//! per-connection handler driving the request pipeline, CONNECT handling
//! with optional TLS interception, and the two modifier hooks. Configure
//! it with the setters, then call [`Proxy::serve`]; the configuration is
//! frozen for the lifetime of the serve call.
//!
//! ```no_run
//! use tapwire::proxy::Proxy;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), tapwire::proxy::ProxyError> {
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! let shutdown = CancellationToken::new();
//!
//! let mut proxy = Proxy::new();
//! proxy.set_timeout(std::time::Duration::from_secs(60));
//! proxy.serve(listener, shutdown).await
//! # }
//! ```

mod connect;
pub mod error;
mod handler;
pub mod modifier;
pub mod roundtrip;
pub mod session;

pub use error::{ProxyError, ProxyResult};
pub use modifier::{
    request_modifier_fn, response_modifier_fn, Noop, RequestModifier, ResponseModifier,
};
pub use roundtrip::{Dialer, Http1Client, RoundTripper, TcpDialer};
pub use session::{Context, Session};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::Uri;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::mitm::Mitm;
use crate::net::{ClientConn, Listener};

use error::is_transient_accept;

/// Callback invoked when a proxy-terminated TLS connection fails to
/// parse a request, with the SNI server name and the error.
pub type TlsClosedErrorCallback = Arc<dyn Fn(&str, &ProxyError) + Send + Sync>;

/// Default idle timeout between requests on one connection.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Frozen configuration shared by every handler of one serve call.
pub(crate) struct Core {
    pub(crate) timeout: Duration,
    pub(crate) mitm: Option<Arc<dyn Mitm>>,
    pub(crate) proxy_url: Option<Uri>,
    pub(crate) reqmod: Arc<dyn RequestModifier>,
    pub(crate) resmod: Arc<dyn ResponseModifier>,
    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) round_tripper: Arc<dyn RoundTripper>,
    pub(crate) on_tls_closed_connection_error: Option<TlsClosedErrorCallback>,
}

/// An HTTP proxy with support for TLS MITM and customizable behavior.
pub struct Proxy {
    timeout: Duration,
    mitm: Option<Arc<dyn Mitm>>,
    proxy_url: Option<Uri>,
    reqmod: Arc<dyn RequestModifier>,
    resmod: Arc<dyn ResponseModifier>,
    dialer: Arc<dyn Dialer>,
    round_tripper: Option<Arc<dyn RoundTripper>>,
    on_tls_closed_connection_error: Option<TlsClosedErrorCallback>,
}

impl Proxy {
    /// Create a proxy with defaults: a 5-minute idle timeout, no-op
    /// modifiers, the TCP dialer, and the built-in HTTP/1.1 client.
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            mitm: None,
            proxy_url: None,
            reqmod: Arc::new(Noop),
            resmod: Arc::new(Noop),
            dialer: Arc::new(TcpDialer::default()),
            round_tripper: None,
            on_tls_closed_connection_error: None,
        }
    }

    /// Set the idle timeout between requests on one connection.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Set the TLS interception backend for CONNECT requests.
    pub fn set_mitm(&mut self, mitm: Arc<dyn Mitm>) {
        self.mitm = Some(mitm);
    }

    /// Set the downstream proxy that receives requests from this proxy.
    pub fn set_downstream_proxy(&mut self, proxy_url: Option<Uri>) {
        self.proxy_url = proxy_url;
    }

    /// Set the request modifier. `None` restores the no-op.
    pub fn set_request_modifier(&mut self, reqmod: Option<Arc<dyn RequestModifier>>) {
        self.reqmod = reqmod.unwrap_or_else(|| Arc::new(Noop));
    }

    /// Set the response modifier. `None` restores the no-op.
    pub fn set_response_modifier(&mut self, resmod: Option<Arc<dyn ResponseModifier>>) {
        self.resmod = resmod.unwrap_or_else(|| Arc::new(Noop));
    }

    /// Set the dialer used to establish outbound connections.
    ///
    /// The built-in round tripper is materialized at serve time from the
    /// dialer and downstream proxy configured then, so this propagates
    /// unless a custom round tripper was installed.
    pub fn set_dialer(&mut self, dialer: Arc<dyn Dialer>) {
        self.dialer = dialer;
    }

    /// Install a custom round tripper for the non-CONNECT path.
    pub fn set_round_tripper(&mut self, round_tripper: Arc<dyn RoundTripper>) {
        self.round_tripper = Some(round_tripper);
    }

    /// Set the callback invoked when a proxy-terminated TLS connection
    /// fails to parse a request.
    pub fn set_tls_closed_connection_error_callback(&mut self, cb: TlsClosedErrorCallback) {
        self.on_tls_closed_connection_error = Some(cb);
    }

    fn core(&self) -> Arc<Core> {
        Arc::new(Core {
            timeout: self.timeout,
            mitm: self.mitm.clone(),
            proxy_url: self.proxy_url.clone(),
            reqmod: self.reqmod.clone(),
            resmod: self.resmod.clone(),
            dialer: self.dialer.clone(),
            round_tripper: self.round_tripper.clone().unwrap_or_else(|| {
                Arc::new(Http1Client::new(self.dialer.clone(), self.proxy_url.clone()))
            }),
            on_tls_closed_connection_error: self.on_tls_closed_connection_error.clone(),
        })
    }

    /// Accept connections from `listener` and handle the requests until
    /// `shutdown` is cancelled (returns `Ok`) or accepting fails with a
    /// non-transient error (returns it). The listener is dropped on
    /// exit.
    pub async fn serve<L: Listener + 'static>(
        &self,
        listener: L,
        shutdown: CancellationToken,
    ) -> ProxyResult<()> {
        let core = self.core();
        self.serve_with(listener, shutdown, Arc::new(PipelineHandler { core }))
            .await
    }

    /// Like [`Proxy::serve`], but dispatching each accepted connection
    /// to a custom handler instead of the request pipeline.
    pub async fn serve_with<L: Listener + 'static>(
        &self,
        listener: L,
        shutdown: CancellationToken,
        handler: Arc<dyn ConnHandler>,
    ) -> ProxyResult<()> {
        run_accept_loop(listener, shutdown, handler).await
    }
}

impl Default for Proxy {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles one accepted connection for its whole lifetime.
#[async_trait]
pub trait ConnHandler: Send + Sync {
    /// Drive the connection until done. The server context is available
    /// through `shutdown`.
    async fn handle(&self, conn: ClientConn, shutdown: CancellationToken);
}

/// The default handler: the request pipeline.
struct PipelineHandler {
    core: Arc<Core>,
}

#[async_trait]
impl ConnHandler for PipelineHandler {
    async fn handle(&self, conn: ClientConn, shutdown: CancellationToken) {
        handler::handle_conn(self.core.clone(), conn, shutdown).await;
    }
}

/// Accept with backoff on a producer task; dispatch each connection on a
/// fresh task without ever blocking on handler completion.
async fn run_accept_loop<L: Listener + 'static>(
    listener: L,
    shutdown: CancellationToken,
    handler: Arc<dyn ConnHandler>,
) -> ProxyResult<()> {
    let (conn_tx, mut conn_rx) = mpsc::channel::<ClientConn>(1);
    let (err_tx, mut err_rx) = mpsc::channel::<std::io::Error>(1);

    let producer = tokio::spawn(async move {
        let mut delay = Duration::ZERO;
        loop {
            match listener.accept().await {
                Ok(conn) => {
                    delay = Duration::ZERO;
                    debug!("accepted connection from {:?}", conn.peer_addr());
                    if conn_tx.send(conn).await.is_err() {
                        return;
                    }
                }
                Err(e) if is_transient_accept(&e) => {
                    delay = next_accept_delay(delay);
                    debug!("temporary error on accept: {}", e);
                    sleep(delay).await;
                }
                Err(e) => {
                    let _ = err_tx.send(e).await;
                    return;
                }
            }
        }
    });

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("stopping accept loop");
                break Ok(());
            }
            Some(err) = err_rx.recv() => {
                error!("failed to accept: {}", err);
                break Err(ProxyError::Io(err));
            }
            Some(conn) = conn_rx.recv() => {
                let handler = handler.clone();
                let token = shutdown.clone();
                tokio::spawn(async move {
                    handler.handle(conn, token).await;
                });
            }
        }
    };

    // Aborting the producer drops the listener, discarding any accepted
    // connection not yet dispatched.
    producer.abort();
    result
}

/// Backoff for transient accept errors: 5 ms on the first failure,
/// doubling up to 1 s. A successful accept resets the caller's delay to
/// zero.
pub(crate) fn next_accept_delay(prev: Duration) -> Duration {
    const INITIAL: Duration = Duration::from_millis(5);
    const MAX: Duration = Duration::from_secs(1);

    if prev.is_zero() {
        INITIAL
    } else {
        (prev * 2).min(MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_backoff_doubles_from_5ms_and_caps_at_1s() {
        let mut delay = Duration::ZERO;
        let mut observed = Vec::new();
        for _ in 0..10 {
            delay = next_accept_delay(delay);
            observed.push(delay.as_millis());
        }
        assert_eq!(
            observed,
            vec![5, 10, 20, 40, 80, 160, 320, 640, 1000, 1000]
        );
    }

    #[test]
    fn accept_backoff_restarts_after_reset() {
        let mut delay = next_accept_delay(Duration::ZERO);
        delay = next_accept_delay(delay);
        assert_eq!(delay, Duration::from_millis(10));

        // A successful accept resets the delay.
        delay = Duration::ZERO;
        assert_eq!(next_accept_delay(delay), Duration::from_millis(5));
    }

    #[test]
    fn setters_replace_and_restore_defaults() {
        let mut proxy = Proxy::new();
        proxy.set_timeout(Duration::from_secs(1));
        assert_eq!(proxy.timeout, Duration::from_secs(1));

        proxy.set_request_modifier(Some(Arc::new(Noop)));
        proxy.set_request_modifier(None);
        proxy.set_response_modifier(None);

        proxy.set_downstream_proxy(Some("http://proxy.test:3128".parse().unwrap()));
        assert!(proxy.proxy_url.is_some());
        proxy.set_downstream_proxy(None);
        assert!(proxy.proxy_url.is_none());
    }
}
