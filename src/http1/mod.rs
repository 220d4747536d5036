//! HTTP/1.x wire codec.
//!
//! The proxy owns its protocol handling end to end: requests and
//! responses are parsed with [`httparse`] into the `http` crate's
//! vocabulary types and serialized back by hand. Bodies are buffered
//! (`bytes::Bytes`) and framed by `Content-Length`, chunked
//! transfer-encoding (decoded on read), or connection close.

pub mod body;
pub mod request;
pub mod response;

pub use request::{Request, WireForm};
pub use response::Response;

use http::header::{HeaderMap, HeaderValue, WARNING};
use std::fmt::Display;
use thiserror::Error;

/// Upper bound on a request or response header section.
pub const MAX_HEADER_SECTION: usize = 64 * 1024;

/// Upper bound on a single chunk-size or trailer line.
pub(crate) const MAX_LINE: usize = 8 * 1024;

/// Maximum number of headers accepted in one message.
pub(crate) const MAX_HEADERS: usize = 100;

/// Errors produced by the wire codec.
#[derive(Debug, Error)]
pub enum HttpError {
    /// I/O failure while reading or writing a message.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent bytes that do not parse as HTTP/1.x.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The header section exceeded [`MAX_HEADER_SECTION`].
    #[error("header section exceeds {0} bytes")]
    HeadersTooLarge(usize),

    /// A chunked body was framed incorrectly.
    #[error("invalid chunked encoding: {0}")]
    Chunked(String),
}

/// Attach a non-fatal error to a message as a `Warning` header.
///
/// Modifier, round-trip, and dial errors are downgraded to warnings so
/// the exchange can proceed; this records them for the peer.
pub fn warning(headers: &mut HeaderMap, err: &dyn Display) {
    let msg = err.to_string().replace(['\r', '\n'], " ");
    let value = format!("199 tapwire \"{}\"", msg);
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.append(WARNING, value);
    }
}
