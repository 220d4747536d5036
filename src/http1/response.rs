//! Response parsing, synthesis, and serialization.

use bytes::{Bytes, BytesMut};
use http::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_RANGE, TRANSFER_ENCODING,
};
use http::{StatusCode, Version};
use tokio::io::AsyncRead;

use super::request::wants_close;
use super::{body, HttpError, MAX_HEADERS};

/// A buffered HTTP/1.x response.
#[derive(Debug, Clone)]
pub struct Response {
    /// Status code.
    pub status: StatusCode,
    /// Reason phrase as received; the canonical reason is used when absent.
    pub reason: Option<String>,
    /// Protocol version.
    pub version: Version,
    /// Header section.
    pub headers: HeaderMap,
    /// Fully buffered body (chunked bodies are decoded).
    pub body: Bytes,
    /// Length to advertise. `None` suppresses length framing entirely
    /// (close-delimited bodies and CONNECT establishment responses).
    pub content_length: Option<u64>,
    /// Whether the connection closes after this response.
    pub close: bool,
}

impl Response {
    /// Synthesize an empty response with the given status.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            content_length: Some(0),
            close: false,
        }
    }

    /// Replace the body, keeping the advertised length in sync.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
        self.content_length = Some(self.body.len() as u64);
    }

    /// Reason phrase, falling back to the canonical one.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Parse a status line and header section from `buf`. Returns `None`
    /// when more bytes are needed.
    pub(crate) fn parse(buf: &[u8]) -> Result<Option<(usize, Response)>, HttpError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);
        let header_len = match parsed.parse(buf) {
            Err(e) => return Err(HttpError::Malformed(e.to_string())),
            Ok(httparse::Status::Partial) => return Ok(None),
            Ok(httparse::Status::Complete(len)) => len,
        };

        let code = parsed
            .code
            .ok_or_else(|| HttpError::Malformed("missing status code".into()))?;
        let status = StatusCode::from_u16(code)
            .map_err(|_| HttpError::Malformed(format!("invalid status code {}", code)))?;
        let reason = parsed
            .reason
            .filter(|r| !r.is_empty())
            .map(ToOwned::to_owned);
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
            Response {
                status,
                reason,
                version,
                headers: header_map,
                body: Bytes::new(),
                content_length: Some(0),
                close,
            },
        )))
    }

    /// Read one complete response from `io` using `buf` as the receive
    /// buffer.
    ///
    /// `head` marks a response to a HEAD request; `connect` marks the
    /// response to a CONNECT sent to a downstream proxy, which carries no
    /// body on success and is never close-delimited.
    pub(crate) async fn read_from<R: AsyncRead + Unpin>(
        io: &mut R,
        buf: &mut BytesMut,
        max_header: usize,
        head: bool,
        connect: bool,
    ) -> Result<Response, HttpError> {
        let (header_len, mut res) = loop {
            if let Some(found) = Self::parse(buf)? {
                break found;
            }
            if buf.len() >= max_header {
                return Err(HttpError::HeadersTooLarge(max_header));
            }
            if body::fill(io, buf).await? == 0 {
                return Err(HttpError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before response",
                )));
            }
        };
        let _ = buf.split_to(header_len);

        let bodyless = head
            || res.status.is_informational()
            || res.status == StatusCode::NO_CONTENT
            || res.status == StatusCode::NOT_MODIFIED
            || (connect && res.status.is_success());

        if bodyless {
            // HEAD responses advertise the length of the body they elide.
            res.content_length = body::content_length(&res.headers)?.or(Some(0));
        } else if body::is_chunked(&res.headers) {
            res.body = body::read_chunked(io, buf).await?;
            res.content_length = Some(res.body.len() as u64);
        } else if let Some(n) = body::content_length(&res.headers)? {
            res.body = body::read_exact(io, buf, n as usize).await?;
            res.content_length = Some(n);
        } else if connect {
            res.content_length = Some(0);
        } else {
            // Close-delimited body.
            res.body = body::read_to_eof(io, buf).await?;
            res.content_length = None;
            res.close = true;
        }
        Ok(res)
    }

    /// Serialize the status line and header section as they would go on
    /// the wire, without the body.
    pub fn header_section(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), self.reason()).as_bytes(),
        );
        for (name, value) in &self.headers {
            if name == CONTENT_LENGTH || name == TRANSFER_ENCODING || name == CONNECTION {
                continue;
            }
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if let Some(n) = self.content_length {
            out.extend_from_slice(format!("content-length: {}\r\n", n).as_bytes());
        }
        if self.close {
            out.extend_from_slice(b"connection: close\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Serialize the full response.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.header_section();
        out.extend_from_slice(&self.body);
        out
    }

    /// Starting byte offset of the range this response carries: the
    /// `Content-Range` start for partial content, `0` for a plain `200`,
    /// absent otherwise.
    pub fn range_start(&self) -> Option<i64> {
        if self.status == StatusCode::OK {
            Some(0)
        } else if self.status == StatusCode::PARTIAL_CONTENT {
            let value = self.headers.get(CONTENT_RANGE)?.to_str().ok()?;
            let rest = value.trim().strip_prefix("bytes")?.trim_start();
            let start = rest.split('-').next()?;
            start.parse().ok()
        } else {
            None
        }
    }
}
