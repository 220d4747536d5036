//! Request parsing, stamping, and serialization.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::uri::Authority;
use http::{Method, Uri, Version};
use tokio::io::AsyncRead;

use super::{body, HttpError, MAX_HEADERS};

/// Request-target form used when serializing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireForm {
    /// Path only (`GET /x HTTP/1.1`) — sent to origins.
    Origin,
    /// Full URL (`GET http://h/x HTTP/1.1`) — sent to a downstream proxy.
    Absolute,
    /// Authority only (`CONNECT h:443 HTTP/1.1`).
    Authority,
}

/// A buffered HTTP/1.x request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Request target. Stamped with a scheme and authority by the
    /// pipeline before the modifiers run.
    pub uri: Uri,
    /// Protocol version as received.
    pub version: Version,
    /// Header section.
    pub headers: HeaderMap,
    /// Fully buffered body (chunked bodies are decoded).
    pub body: Bytes,
    /// Address of the client socket the request arrived on.
    pub remote_addr: Option<SocketAddr>,
    /// Whether the client asked for the connection to close after this
    /// exchange.
    pub close: bool,
}

impl Request {
    /// Parse a header section from `buf`. Returns `None` when more bytes
    /// are needed, otherwise the section length and the request with an
    /// empty body.
    pub(crate) fn parse(buf: &[u8]) -> Result<Option<(usize, Request)>, HttpError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        let header_len = match parsed.parse(buf) {
            Err(e) => return Err(HttpError::Malformed(e.to_string())),
            Ok(httparse::Status::Partial) => return Ok(None),
            Ok(httparse::Status::Complete(len)) => len,
        };

        let method: Method = parsed
            .method
            .ok_or_else(|| HttpError::Malformed("missing method".into()))?
            .parse()
            .map_err(|_| HttpError::Malformed("invalid method".into()))?;
        let uri: Uri = parsed
            .path
            .ok_or_else(|| HttpError::Malformed("missing request target".into()))?
            .parse()
            .map_err(|_| HttpError::Malformed("invalid request target".into()))?;
        let version = match parsed.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let mut header_map = HeaderMap::new();
        for h in parsed.headers.iter() {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(h.name.as_bytes()),
                HeaderValue::from_bytes(h.value),
            ) else {
                continue;
            };
            header_map.append(name, value);
        }

        let close = wants_close(version, &header_map);
        Ok(Some((
            header_len,
            Request {
                method,
                uri,
                version,
                headers: header_map,
                body: Bytes::new(),
                remote_addr: None,
                close,
            },
        )))
    }

    /// Read one complete request (header section plus body) from `io`,
    /// using `buf` as the receive buffer.
    pub(crate) async fn read_from<R: AsyncRead + Unpin>(
        io: &mut R,
        buf: &mut BytesMut,
        max_header: usize,
    ) -> Result<Request, HttpError> {
        let (header_len, mut req) = loop {
            if let Some(found) = Self::parse(buf)? {
                break found;
            }
            if buf.len() >= max_header {
                return Err(HttpError::HeadersTooLarge(max_header));
            }
            if body::fill(io, buf).await? == 0 {
                return Err(HttpError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before request",
                )));
            }
        };
        let _ = buf.split_to(header_len);

        if req.method != Method::CONNECT {
            if body::is_chunked(&req.headers) {
                req.body = body::read_chunked(io, buf).await?;
            } else if let Some(n) = body::content_length(&req.headers)? {
                req.body = body::read_exact(io, buf, n as usize).await?;
            }
        }
        Ok(req)
    }

    /// Whether this is a CONNECT request.
    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// Hostname of the target, from the URI or the `Host` header.
    pub fn host(&self) -> Option<String> {
        if let Some(host) = self.uri.host() {
            return Some(host.to_string());
        }
        self.header_authority().map(|a| a.host().to_string())
    }

    /// Stamp the request after parsing: record the remote address, force
    /// the scheme, and backfill the authority from the `Host` header when
    /// the target is origin-form. CONNECT targets are left untouched.
    pub(crate) fn stamp(&mut self, scheme: &str, remote_addr: Option<SocketAddr>) {
        self.remote_addr = remote_addr;
        if self.is_connect() {
            return;
        }

        let Some(authority) = self
            .uri
            .authority()
            .cloned()
            .or_else(|| self.header_authority())
        else {
            return;
        };
        let path_and_query = self
            .uri
            .path_and_query()
            .map(|p| p.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());
        if let Ok(uri) = Uri::builder()
            .scheme(scheme)
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
        {
            self.uri = uri;
        }
    }

    /// `host:port` to dial for a CONNECT target (default port 443).
    pub(crate) fn connect_addr(&self) -> Result<String, HttpError> {
        let authority = self
            .uri
            .authority()
            .cloned()
            .or_else(|| self.header_authority())
            .ok_or_else(|| HttpError::Malformed("CONNECT without authority".into()))?;
        Ok(match authority.port_u16() {
            Some(_) => authority.as_str().to_string(),
            None => format!("{}:443", authority.as_str()),
        })
    }

    /// `host:port` to dial for a plain request (port defaulted by scheme).
    pub(crate) fn origin_addr(&self) -> Result<String, HttpError> {
        let authority = self
            .uri
            .authority()
            .cloned()
            .or_else(|| self.header_authority())
            .ok_or_else(|| HttpError::Malformed("request without host".into()))?;
        if authority.port_u16().is_some() {
            return Ok(authority.as_str().to_string());
        }
        let port = if self.uri.scheme_str() == Some("https") {
            443
        } else {
            80
        };
        Ok(format!("{}:{}", authority.as_str(), port))
    }

    /// Serialize the request for the wire in the given target form.
    ///
    /// `Content-Length` and `Transfer-Encoding` are re-derived from the
    /// buffered body; everything else is written as-is.
    pub fn encode(&self, form: WireForm) -> Vec<u8> {
        let target = match form {
            WireForm::Origin => self
                .uri
                .path_and_query()
                .map(|p| p.as_str().to_owned())
                .unwrap_or_else(|| "/".to_owned()),
            WireForm::Absolute => self.uri.to_string(),
            WireForm::Authority => self
                .uri
                .authority()
                .map(|a| a.as_str().to_owned())
                .unwrap_or_else(|| self.uri.to_string()),
        };

        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.method, target).as_bytes());

        if !self.headers.contains_key(HOST) {
            if let Some(authority) = self.uri.authority() {
                out.extend_from_slice(format!("host: {}\r\n", authority).as_bytes());
            }
        }
        for (name, value) in &self.headers {
            if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
                continue;
            }
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !self.body.is_empty() {
            out.extend_from_slice(format!("content-length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    fn header_authority(&self) -> Option<Authority> {
        self.headers.get(HOST)?.to_str().ok()?.parse().ok()
    }
}

/// Whether a message at this version with these headers closes the
/// connection after the exchange.
pub(crate) fn wants_close(version: Version, headers: &HeaderMap) -> bool {
    let mut close = version == Version::HTTP_10;
    for value in headers.get_all(CONNECTION) {
        let Ok(value) = value.to_str() else { continue };
        for token in value.split(',') {
            match token.trim().to_ascii_lowercase().as_str() {
                "close" => return true,
                "keep-alive" => close = false,
                _ => {}
            }
        }
    }
    close
}
