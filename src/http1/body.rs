//! Message body framing.
//!
//! Three framings exist on the wire: `Content-Length`, chunked
//! transfer-encoding, and (for responses only) connection close. Chunked
//! bodies are decoded into plain bytes on read; the serializer re-frames
//! with an accurate `Content-Length`.

use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, CONTENT_LENGTH, TRANSFER_ENCODING};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{HttpError, MAX_LINE};

/// Read more bytes from `io` into `buf`, returning how many arrived.
pub(crate) async fn fill<R: AsyncRead + Unpin>(
    io: &mut R,
    buf: &mut BytesMut,
) -> std::io::Result<usize> {
    io.read_buf(buf).await
}

/// Take exactly `n` bytes, reading past what is already buffered.
pub(crate) async fn read_exact<R: AsyncRead + Unpin>(
    io: &mut R,
    buf: &mut BytesMut,
    n: usize,
) -> Result<Bytes, HttpError> {
    while buf.len() < n {
        if fill(io, buf).await? == 0 {
            return Err(HttpError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-body",
            )));
        }
    }
    Ok(buf.split_to(n).freeze())
}

/// Read a CRLF-terminated line, returned without its terminator.
pub(crate) async fn read_line<R: AsyncRead + Unpin>(
    io: &mut R,
    buf: &mut BytesMut,
) -> Result<String, HttpError> {
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = buf.split_to(pos + 1);
            let end = if pos > 0 && line[pos - 1] == b'\r' {
                pos - 1
            } else {
                pos
            };
            return Ok(String::from_utf8_lossy(&line[..end]).into_owned());
        }
        if buf.len() > MAX_LINE {
            return Err(HttpError::Chunked("line too long".into()));
        }
        if fill(io, buf).await? == 0 {
            return Err(HttpError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-line",
            )));
        }
    }
}

/// Decode a chunked body, consuming any trailer section.
pub(crate) async fn read_chunked<R: AsyncRead + Unpin>(
    io: &mut R,
    buf: &mut BytesMut,
) -> Result<Bytes, HttpError> {
    let mut body = BytesMut::new();
    loop {
        let line = read_line(io, buf).await?;
        // Chunk extensions after ';' are ignored.
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| HttpError::Chunked(format!("bad chunk size {:?}", size_str)))?;

        if size == 0 {
            loop {
                let trailer = read_line(io, buf).await?;
                if trailer.is_empty() {
                    return Ok(body.freeze());
                }
            }
        }

        let chunk = read_exact(io, buf, size).await?;
        body.extend_from_slice(&chunk);

        let sep = read_exact(io, buf, 2).await?;
        if &sep[..] != b"\r\n" {
            return Err(HttpError::Chunked("missing chunk terminator".into()));
        }
    }
}

/// Read until the peer closes the stream (close-delimited responses).
pub(crate) async fn read_to_eof<R: AsyncRead + Unpin>(
    io: &mut R,
    buf: &mut BytesMut,
) -> Result<Bytes, HttpError> {
    while fill(io, buf).await? != 0 {}
    Ok(buf.split().freeze())
}

/// Parsed `Content-Length`, if present.
pub(crate) fn content_length(headers: &HeaderMap) -> Result<Option<u64>, HttpError> {
    match headers.get(CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| HttpError::Malformed("invalid Content-Length".into())),
    }
}

/// Whether the message uses chunked transfer-encoding.
pub(crate) fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("chunked"))
}
