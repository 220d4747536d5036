//! Interface consumed for TLS interception.
//!
//! Certificate minting lives outside the proxy core. The core only needs
//! two capabilities from an interception backend: a per-host TLS server
//! configuration (backed by a dynamically minted certificate for the SNI
//! in question) and a place to report failed handshakes. Implementations
//! typically cache minted certificates per host and force HTTP/1.1 via
//! ALPN so the decrypted stream stays parseable by this proxy.

use std::io;
use std::sync::Arc;

use rustls::ServerConfig;

/// TLS interception backend for CONNECT requests.
///
/// Setting an implementation on the proxy (via
/// [`Proxy::set_mitm`](crate::proxy::Proxy::set_mitm)) switches CONNECT
/// handling from blind tunneling to interception.
pub trait Mitm: Send + Sync {
    /// TLS server configuration to terminate a client handshake for
    /// `host` (the CONNECT target, without port).
    fn server_config(&self, host: &str) -> Arc<ServerConfig>;

    /// Called when the client-side handshake for `host` fails.
    fn on_handshake_error(&self, host: &str, error: &io::Error) {
        let _ = (host, error);
    }
}
