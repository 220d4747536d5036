//! Error types for proxy operations.
//!
//! Errors fall into three kinds during serving:
//! - closeable: the current connection is torn down, the server is fine
//! - transient (accept only): retried with backoff
//! - fatal: terminates the accept loop

use std::io;

use thiserror::Error;

use crate::http1::HttpError;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Wire-protocol error from the HTTP/1 codec.
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    /// TLS handshake or configuration failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Failed to connect to an upstream host.
    #[error("failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// The idle deadline expired while waiting for a request.
    #[error("request timed out")]
    Timeout,

    /// Internal sentinel: tear down the current connection.
    #[error("closing connection")]
    Close,
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Whether an error ends the current connection without implicating the
/// server: EOF, closed pipe, timeouts, and the close sentinel.
pub(crate) fn is_closeable(err: &ProxyError) -> bool {
    match err {
        ProxyError::Close | ProxyError::Timeout => true,
        ProxyError::Io(e) => is_closeable_io(e),
        ProxyError::Http(HttpError::Io(e)) => is_closeable_io(e),
        _ => false,
    }
}

fn is_closeable_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
    )
}

/// Whether an accept error is worth retrying after a backoff.
pub(crate) fn is_transient_accept(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_sentinel_and_timeout_are_closeable() {
        assert!(is_closeable(&ProxyError::Close));
        assert!(is_closeable(&ProxyError::Timeout));
    }

    #[test]
    fn eof_and_broken_pipe_are_closeable() {
        for kind in [
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::TimedOut,
        ] {
            let err = ProxyError::Io(io::Error::new(kind, "x"));
            assert!(is_closeable(&err), "{:?} should be closeable", kind);
        }
    }

    #[test]
    fn protocol_and_tls_errors_are_not_closeable() {
        assert!(!is_closeable(&ProxyError::Tls("handshake failed".into())));
        assert!(!is_closeable(&ProxyError::Http(HttpError::Malformed(
            "bad".into()
        ))));
        assert!(!is_closeable(&ProxyError::UpstreamConnect {
            addr: "example.test:443".into(),
            message: "refused".into(),
        }));
    }

    #[test]
    fn codec_io_errors_are_closeable() {
        let err = ProxyError::Http(HttpError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "eof",
        )));
        assert!(is_closeable(&err));
    }

    #[test]
    fn transient_accept_classification() {
        assert!(is_transient_accept(&io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "x"
        )));
        assert!(!is_transient_accept(&io::Error::new(
            io::ErrorKind::PermissionDenied,
            "x"
        )));
    }
}
