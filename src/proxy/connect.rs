//! CONNECT handling: TLS interception and blind tunneling.
//!
//! After a CONNECT is answered with `200`, the next bytes on the wire
//! define the payload protocol. When interception is configured the
//! proxy sniffs the first byte: a TLS handshake record (`0x16`) triggers
//! TLS termination with a certificate minted for the target host, and
//! the request loop re-enters over the decrypted stream; anything else
//! is treated as clear HTTP and re-parsed in place. Without interception
//! the proxy opens an upstream connection (directly or through the
//! downstream proxy) and relays bytes both ways until either side
//! closes.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use tokio::io::{AsyncWriteExt, copy};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::http1::{body, warning, Request, Response, WireForm, MAX_HEADER_SECTION};
use crate::net::{BoxStream, ClientConn, PeekedStream};

use super::error::{ProxyError, ProxyResult};
use super::session::{Context, Session};
use super::Core;

/// First byte of a TLS handshake record (RFC 8446 §5.1).
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Handle one CONNECT exchange. On MITM upgrade the transport behind
/// `conn` is replaced and the caller's loop re-enters the pipeline over
/// it; on a blind tunnel this returns the close sentinel once the relay
/// ends.
pub(crate) async fn handle_connect(
    core: &Core,
    session: &Arc<Session>,
    ctx: &mut Context,
    conn: &mut ClientConn,
    buf: &mut BytesMut,
    mut req: Request,
    shutdown: &CancellationToken,
) -> ProxyResult<()> {
    if let Err(e) = core.reqmod.modify_request(ctx, &mut req).await {
        error!("error modifying CONNECT request: {}", e);
        warning(&mut req.headers, &e);
    }
    if session.hijacked() {
        info!("connection hijacked by request modifier");
        return Ok(());
    }

    if let Some(mitm) = core.mitm.clone() {
        mitm_branch(core, mitm, session, ctx, conn, buf, &req).await
    } else {
        tunnel_branch(core, session, ctx, conn, buf, &req, shutdown).await
    }
}

/// Terminate TLS toward the client (or fall back to clear HTTP) after
/// acknowledging the CONNECT.
async fn mitm_branch(
    core: &Core,
    mitm: Arc<dyn crate::mitm::Mitm>,
    session: &Arc<Session>,
    ctx: &mut Context,
    conn: &mut ClientConn,
    buf: &mut BytesMut,
    req: &Request,
) -> ProxyResult<()> {
    let host = req.host().unwrap_or_default();
    debug!("attempting MITM for connection: {}", host);

    let mut res = Response::new(StatusCode::OK);
    res.content_length = None;
    if let Err(e) = core.resmod.modify_response(ctx, &mut res).await {
        error!("error modifying CONNECT response: {}", e);
        warning(&mut res.headers, &e);
    }
    if session.hijacked() {
        info!("connection hijacked by response modifier");
        return Ok(());
    }

    if let Err(e) = conn.write_all(&res.encode()).await {
        error!("got error while writing response back to client: {}", e);
    }
    if let Err(e) = conn.flush().await {
        error!("got error while flushing response back to client: {}", e);
    }
    debug!("completed MITM negotiation for connection: {}", host);

    // Classify the tunnel payload from its first byte. Anything already
    // buffered past that byte is retained as the preserved prefix.
    if buf.is_empty() && body::fill(conn, buf).await? == 0 {
        return Err(ProxyError::Close);
    }

    if buf[0] != TLS_HANDSHAKE_RECORD {
        // Clear HTTP inside the tunnel. The sniffed bytes stay in the
        // receive buffer and the next pipeline iteration parses them.
        debug!("non-TLS bytes after CONNECT, continuing in the clear: {}", host);
        return Ok(());
    }

    let prefix = buf.split().freeze();
    let taken = std::mem::replace(conn, ClientConn::detached());
    let peer_addr = taken.peer_addr();
    let shape = taken.shape_handle().cloned();
    let peeked = PeekedStream::new(taken.into_io(), prefix);

    let acceptor = TlsAcceptor::from(mitm.server_config(&host));
    let tls = match acceptor.accept(peeked).await {
        Ok(tls) => tls,
        Err(e) => {
            mitm.on_handshake_error(&host, &e);
            return Err(ProxyError::Tls(format!(
                "client TLS handshake for '{}' failed: {}",
                host, e
            )));
        }
    };

    let server_name = tls
        .get_ref()
        .1
        .server_name()
        .map(str::to_string)
        .unwrap_or(host);

    let mut io: BoxStream = Box::new(tls);
    let mut new_shape = None;
    if let Some(handle) = shape {
        let (shaped, handle) = handle.rewrap(io);
        io = shaped;
        new_shape = Some(handle);
    }
    *conn = ClientConn::from_parts(io, peer_addr, Some(server_name), new_shape);
    Ok(())
}

/// Open the upstream leg and relay bytes both ways.
async fn tunnel_branch(
    core: &Core,
    session: &Arc<Session>,
    ctx: &mut Context,
    conn: &mut ClientConn,
    buf: &mut BytesMut,
    req: &Request,
    shutdown: &CancellationToken,
) -> ProxyResult<()> {
    debug!("attempting to establish CONNECT tunnel: {:?}", req.uri);

    let dialed = tokio::select! {
        r = connect_upstream(core, req) => r,
        _ = shutdown.cancelled() => return Err(ProxyError::Close),
    };

    let (mut res, upstream) = match dialed {
        Ok(pair) => pair,
        Err(cerr) => {
            error!("failed to CONNECT: {}", cerr);
            let mut res = Response::new(StatusCode::BAD_GATEWAY);
            warning(&mut res.headers, &cerr);

            if let Err(e) = core.resmod.modify_response(ctx, &mut res).await {
                error!("error modifying CONNECT response: {}", e);
                warning(&mut res.headers, &e);
            }
            if session.hijacked() {
                info!("connection hijacked by response modifier");
                return Ok(());
            }

            if let Err(e) = conn.write_all(&res.encode()).await {
                error!("got error while writing response back to client: {}", e);
            }
            if let Err(e) = conn.flush().await {
                error!("got error while flushing response back to client: {}", e);
            }
            return Ok(());
        }
    };

    if let Err(e) = core.resmod.modify_response(ctx, &mut res).await {
        error!("error modifying CONNECT response: {}", e);
        warning(&mut res.headers, &e);
    }
    if session.hijacked() {
        info!("connection hijacked by response modifier");
        return Ok(());
    }

    // No length framing on the upgrade.
    res.content_length = None;
    if let Err(e) = conn.write_all(&res.encode()).await {
        error!("got error while writing response back to client: {}", e);
    }
    if let Err(e) = conn.flush().await {
        error!("got error while flushing response back to client: {}", e);
    }

    debug!("established CONNECT tunnel, proxying traffic");
    let residue = buf.split().freeze();
    let client = std::mem::replace(conn, ClientConn::detached());
    relay(client.into_io(), upstream, residue).await;
    debug!("closed CONNECT tunnel");

    Err(ProxyError::Close)
}

/// Establish the upstream side of a blind tunnel: directly, or by
/// forwarding the CONNECT to the configured downstream proxy and using
/// its answer.
async fn connect_upstream(core: &Core, req: &Request) -> ProxyResult<(Response, BoxStream)> {
    if let Some(proxy) = &core.proxy_url {
        debug!("CONNECT with downstream proxy: {}", proxy);
        let mut conn = core.dialer.dial(&super::roundtrip::proxy_addr(proxy)?).await?;
        conn.write_all(&req.encode(WireForm::Authority)).await?;
        conn.flush().await?;

        let mut rbuf = BytesMut::with_capacity(1024);
        let res = Response::read_from(&mut conn, &mut rbuf, MAX_HEADER_SECTION, false, true).await?;
        // Bytes the downstream proxy sent past its response belong to
        // the tunnel.
        let conn: BoxStream = Box::new(PeekedStream::new(conn, rbuf.freeze()));
        return Ok((res, conn));
    }

    let addr = req.connect_addr()?;
    debug!("CONNECT to host directly: {}", addr);
    let conn = core.dialer.dial(&addr).await?;
    Ok((Response::new(StatusCode::OK), conn))
}

/// Bidirectional byte copy with a join barrier. The tunnel ends when
/// both directions have finished; whichever side closes first causes the
/// mirror copy to observe EOF.
async fn relay(client: BoxStream, mut upstream: BoxStream, residue: Bytes) {
    if !residue.is_empty() {
        if let Err(e) = upstream.write_all(&residue).await {
            error!("failed to forward buffered tunnel bytes: {}", e);
            return;
        }
    }

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let (done_tx, mut done_rx) = mpsc::channel::<()>(2);

    let tx = done_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = copy(&mut client_read, &mut upstream_write).await {
            debug!("client to upstream copy ended: {}", e);
        }
        let _ = upstream_write.shutdown().await;
        debug!("CONNECT tunnel finished copying");
        let _ = tx.send(()).await;
    });
    tokio::spawn(async move {
        if let Err(e) = copy(&mut upstream_read, &mut client_write).await {
            debug!("upstream to client copy ended: {}", e);
        }
        let _ = client_write.shutdown().await;
        debug!("CONNECT tunnel finished copying");
        let _ = done_tx.send(()).await;
    });

    let _ = done_rx.recv().await;
    let _ = done_rx.recv().await;
}
