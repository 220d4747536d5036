//! tapwire: HTTP/1.x forward proxy core with transparent TLS interception
//!
//! This crate implements the connection lifecycle and request/response
//! pipeline of a man-in-the-middle capable forward proxy:
//!
//! - **Proxy**: accept loop with backoff, per-connection sessions, the
//!   HTTP/1 request-response state machine, CONNECT handling with
//!   protocol sniffing, downstream proxy chaining, and tunnel relaying
//! - **Modifiers**: pluggable request/response hooks that may mutate
//!   traffic in flight or hijack a connection outright
//! - **http1**: the hand-rolled HTTP/1.x wire codec the pipeline runs on
//! - **mitm / trafficshape**: the interfaces consumed from the
//!   certificate-minting and traffic-shaping collaborators
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tapwire::proxy::{request_modifier_fn, Proxy};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut proxy = Proxy::new();
//! proxy.set_request_modifier(Some(Arc::new(request_modifier_fn(|_ctx, req| {
//!     req.headers.insert("via", "tapwire".parse()?);
//!     Ok(())
//! }))));
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! proxy.serve(listener, CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod http1;
pub mod mitm;
pub mod net;
pub mod proxy;
pub mod trafficshape;
