//! Outbound connection establishment and request execution.
//!
//! Two swappable seams: [`Dialer`] opens raw upstream connections (used
//! directly by CONNECT handling) and [`RoundTripper`] executes one HTTP
//! exchange against an origin (used by the plain request branch). The
//! defaults — [`TcpDialer`] and [`Http1Client`] — speak HTTP/1.1 only,
//! pin the client to the proxy's dialer, and honor a configured
//! downstream proxy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use http::header::{HeaderName, HeaderValue, CONNECTION, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE};
use http::{Method, Uri};
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::http1::{Request, Response, WireForm, MAX_HEADER_SECTION};
use crate::net::{BoxStream, PeekedStream};

use super::error::{ProxyError, ProxyResult};

/// Cap on the upstream TLS handshake.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens outbound connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial `addr` (`host:port`) and return the connected stream.
    async fn dial(&self, addr: &str) -> ProxyResult<BoxStream>;
}

/// Executes one HTTP request against an origin.
#[async_trait]
pub trait RoundTripper: Send + Sync {
    /// Send `req` upstream and return the origin's response.
    async fn round_trip(&self, req: &Request) -> ProxyResult<Response>;
}

/// Default dialer: TCP with a 30 s connect timeout and 30 s keep-alive.
///
/// SIGPIPE suppression is a no-op on this platform; writes to a closed
/// peer report `EPIPE` instead of raising the signal.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Keep-alive period applied to dialed sockets.
    pub keepalive_period: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            keepalive_period: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> ProxyResult<BoxStream> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProxyError::UpstreamConnect {
                addr: addr.to_string(),
                message: "connect timed out".into(),
            })?
            .map_err(|e| ProxyError::UpstreamConnect {
                addr: addr.to_string(),
                message: e.to_string(),
            })?;
        crate::net::configure_keepalive(&stream, self.keepalive_period);
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}

/// Default round tripper: a pooled-nothing HTTP/1.1 client.
///
/// One upstream connection per round trip; `Connection: close` is
/// requested from the origin so close-delimited bodies terminate. HTTP/2
/// is never negotiated: ALPN is pinned to `http/1.1`.
pub struct Http1Client {
    dialer: Arc<dyn Dialer>,
    proxy_url: Option<Uri>,
    tls: TlsConnector,
}

impl Http1Client {
    /// Build a client pinned to `dialer`, optionally routing through a
    /// downstream proxy.
    ///
    /// Upstream certificates are verified against the platform's native
    /// roots. An empty root store is tolerated here; affected handshakes
    /// fail later instead.
    pub fn new(dialer: Arc<dyn Dialer>, proxy_url: Option<Uri>) -> Self {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in native.errors {
            debug!("error loading native root certificate: {}", err);
        }
        for cert in native.certs {
            if let Err(e) = roots.add(cert) {
                debug!("error adding native root certificate: {}", e);
            }
        }
        if roots.is_empty() {
            debug!("no native root certificates available; upstream TLS will fail");
        }

        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Self {
            dialer,
            proxy_url,
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    async fn tls_handshake(&self, host: &str, stream: BoxStream) -> ProxyResult<BoxStream> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|_| ProxyError::Tls(format!("invalid server name '{}'", host)))?;
        let tls = timeout(TLS_HANDSHAKE_TIMEOUT, self.tls.connect(name, stream))
            .await
            .map_err(|_| ProxyError::Tls(format!("TLS handshake with '{}' timed out", host)))?
            .map_err(|e| ProxyError::Tls(format!("TLS handshake with '{}' failed: {}", host, e)))?;
        Ok(Box::new(tls))
    }

    /// CONNECT through the downstream proxy, returning the tunneled
    /// stream with any over-read bytes preserved.
    async fn connect_through_proxy(
        &self,
        mut stream: BoxStream,
        target: &str,
    ) -> ProxyResult<BoxStream> {
        let connect = format!("CONNECT {0} HTTP/1.1\r\nhost: {0}\r\n\r\n", target);
        stream.write_all(connect.as_bytes()).await?;

        let mut buf = BytesMut::with_capacity(1024);
        let res = Response::read_from(&mut stream, &mut buf, MAX_HEADER_SECTION, false, true).await?;
        if !res.status.is_success() {
            return Err(ProxyError::UpstreamConnect {
                addr: target.to_string(),
                message: format!("downstream proxy answered {}", res.status),
            });
        }
        Ok(Box::new(PeekedStream::new(stream, buf.freeze())))
    }
}

#[async_trait]
impl RoundTripper for Http1Client {
    async fn round_trip(&self, req: &Request) -> ProxyResult<Response> {
        let https = req.uri.scheme_str() == Some("https");
        let head = req.method == Method::HEAD;
        let host = req.host().ok_or_else(|| ProxyError::UpstreamConnect {
            addr: String::new(),
            message: "request has no host".into(),
        })?;
        let origin_addr = req.origin_addr()?;

        let mut outbound = req.clone();
        strip_hop_by_hop(&mut outbound, self.proxy_url.is_some());
        outbound
            .headers
            .insert(CONNECTION, HeaderValue::from_static("close"));

        let (mut stream, form) = match (&self.proxy_url, https) {
            (None, false) => (self.dialer.dial(&origin_addr).await?, WireForm::Origin),
            (None, true) => {
                let raw = self.dialer.dial(&origin_addr).await?;
                (self.tls_handshake(&host, raw).await?, WireForm::Origin)
            }
            (Some(proxy), false) => (
                self.dialer.dial(&proxy_addr(proxy)?).await?,
                WireForm::Absolute,
            ),
            (Some(proxy), true) => {
                let raw = self.dialer.dial(&proxy_addr(proxy)?).await?;
                let tunneled = self.connect_through_proxy(raw, &origin_addr).await?;
                (self.tls_handshake(&host, tunneled).await?, WireForm::Origin)
            }
        };

        stream.write_all(&outbound.encode(form)).await?;
        stream.flush().await?;

        let mut buf = BytesMut::with_capacity(8 * 1024);
        let res = Response::read_from(&mut stream, &mut buf, MAX_HEADER_SECTION, head, false).await?;
        Ok(res)
    }
}

/// `host:port` of a downstream proxy URL.
pub(crate) fn proxy_addr(proxy: &Uri) -> ProxyResult<String> {
    let authority = proxy
        .authority()
        .ok_or_else(|| ProxyError::UpstreamConnect {
            addr: proxy.to_string(),
            message: "downstream proxy URL has no host".into(),
        })?;
    if authority.port_u16().is_some() {
        return Ok(authority.as_str().to_string());
    }
    let port = if proxy.scheme_str() == Some("https") {
        443
    } else {
        80
    };
    Ok(format!("{}:{}", authority.as_str(), port))
}

/// Drop hop-by-hop headers the round tripper manages itself.
fn strip_hop_by_hop(req: &mut Request, forwarding_to_proxy: bool) {
    for name in [CONNECTION, TE, TRAILER, UPGRADE, TRANSFER_ENCODING] {
        req.headers.remove(name);
    }
    req.headers.remove(HeaderName::from_static("keep-alive"));
    req.headers.remove(HeaderName::from_static("proxy-connection"));
    if !forwarding_to_proxy {
        req.headers.remove(PROXY_AUTHORIZATION);
    }
}
