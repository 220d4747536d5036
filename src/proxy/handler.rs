//! Per-connection request loop and the plain request pipeline.
//!
//! One handler owns each accepted connection for its whole lifetime. The
//! loop re-arms an idle deadline before every request parse, races the
//! parse against server cancellation, and runs one request-response
//! exchange per iteration. A MITM upgrade swaps the transport under the
//! loop; closeable errors end it.

use std::sync::Arc;

use bytes::BytesMut;
use http::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::http1::{warning, Request, Response, MAX_HEADER_SECTION};
use crate::net::ClientConn;
use crate::trafficshape;

use super::connect;
use super::error::{is_closeable, ProxyError, ProxyResult};
use super::session::{Context, Session};
use super::Core;

/// Drive the request loop on one accepted connection until a closeable
/// error or a hijack.
pub(crate) async fn handle_conn(
    core: Arc<Core>,
    mut conn: ClientConn,
    shutdown: CancellationToken,
) {
    if shutdown.is_cancelled() {
        return;
    }

    let session = Arc::new(Session::new());
    let mut buf = BytesMut::with_capacity(8 * 1024);

    loop {
        match handle_exchange(&core, &session, &mut conn, &mut buf, &shutdown).await {
            Ok(()) => {
                if session.hijacked() {
                    debug!("relinquishing hijacked connection: {}", session.id());
                    return;
                }
            }
            Err(e) if is_closeable(&e) => {
                debug!("closing connection: {:?}", conn.peer_addr());
                return;
            }
            Err(e) => error!("error handling request: {}", e),
        }
    }
}

/// Process exactly one request-response exchange.
///
/// Returns the close sentinel on terminal conditions, `Ok(())` when the
/// caller should loop, or the underlying error for fatal non-closeable
/// failures.
pub(crate) async fn handle_exchange(
    core: &Core,
    session: &Arc<Session>,
    conn: &mut ClientConn,
    buf: &mut BytesMut,
    shutdown: &CancellationToken,
) -> ProxyResult<()> {
    debug!("waiting for request: {:?}", conn.peer_addr());

    // Race the idle-deadline-wrapped parse against server cancellation.
    let parsed = {
        let read = Request::read_from(conn, buf, MAX_HEADER_SECTION);
        tokio::select! {
            _ = shutdown.cancelled() => None,
            parsed = timeout(core.timeout, read) => Some(parsed),
        }
    };
    let mut req = match parsed {
        None => return Err(ProxyError::Close),
        Some(Err(_)) => return Err(ProxyError::Timeout),
        Some(Ok(Err(e))) => {
            let err = ProxyError::from(e);
            if is_closeable(&err) {
                debug!("connection closed prematurely: {}", err);
            } else {
                if let (Some(name), Some(cb)) = (
                    conn.tls_server_name(),
                    core.on_tls_closed_connection_error.as_ref(),
                ) {
                    cb(name, &err);
                }
                error!("failed to read request: {}", err);
            }
            return Err(ProxyError::Close);
        }
        Some(Ok(Ok(req))) => req,
    };

    let mut ctx = Context::new(session.clone());

    if conn.is_terminated_tls() {
        session.mark_secure();
    }
    let scheme = if session.is_secure() { "https" } else { "http" };
    req.stamp(scheme, conn.peer_addr());

    if req.is_connect() {
        return connect::handle_connect(core, session, &mut ctx, conn, buf, req, shutdown).await;
    }

    if let Err(e) = core.reqmod.modify_request(&mut ctx, &mut req).await {
        error!("error modifying request: {}", e);
        warning(&mut req.headers, &e);
    }
    if session.hijacked() {
        info!("connection hijacked by request modifier");
        return Ok(());
    }

    let mut res = round_trip(core, &ctx, &req, shutdown).await;

    if let Err(e) = core.resmod.modify_response(&mut ctx, &mut res).await {
        error!("error modifying response: {}", e);
        warning(&mut res.headers, &e);
    }
    if session.hijacked() {
        info!("connection hijacked by response modifier");
        return Ok(());
    }

    let mut closing = false;
    if req.close || res.close || shutdown.is_cancelled() {
        debug!("received close request: {:?}", req.remote_addr);
        res.close = true;
        closing = true;
    }

    if let Some(handle) = conn.shape_handle() {
        apply_traffic_shaping(handle, &req, &res);
    }

    if let Err(e) = conn.write_all(&res.encode()).await {
        error!("got error while writing response back to client: {}", e);
        if trafficshape::is_force_close(&e) {
            closing = true;
        }
    }
    if let Err(e) = conn.flush().await {
        error!("got error while flushing response back to client: {}", e);
        if trafficshape::is_force_close(&e) {
            closing = true;
        }
    }

    if closing {
        Err(ProxyError::Close)
    } else {
        Ok(())
    }
}

/// Execute the round trip, unless the context opted out. Failures are
/// downgraded to a synthetic `502` carrying the error as a warning.
async fn round_trip(
    core: &Core,
    ctx: &Context,
    req: &Request,
    shutdown: &CancellationToken,
) -> Response {
    if ctx.skipping_round_trip() {
        debug!("skipping round trip");
        return Response::new(StatusCode::OK);
    }

    let result = tokio::select! {
        r = core.round_tripper.round_trip(req) => r,
        _ = shutdown.cancelled() => Err(ProxyError::Close),
    };
    match result {
        Ok(res) => res,
        Err(e) => {
            error!("failed to round trip: {}", e);
            let mut res = Response::new(StatusCode::BAD_GATEWAY);
            warning(&mut res.headers, &e);
            res
        }
    }
}

/// Populate the shaped connection's context before the response write:
/// on the first URL pattern matching the request, when the response
/// carries a recognized range start, record buckets, offsets, and the
/// serialized header length, and apply the bucket capacity when a
/// throttle applies right away.
fn apply_traffic_shaping(handle: &trafficshape::Handle, req: &Request, res: &Response) {
    handle.set_context(trafficshape::Context::default());

    let url = req.uri.to_string();
    for shape in handle.shapes() {
        if !shape.pattern.is_match(&url) {
            continue;
        }
        if let Some(range_start) = res.range_start() {
            let header_len = res.header_section().len() as i64;
            let throttle = shape.current_throttle(range_start);
            let next_action = shape.next_action(range_start);
            if throttle.throttle_now {
                shape.buckets.write_bucket.set_capacity(throttle.bandwidth);
            }
            info!(
                "request {} with range start {} matches shaping pattern {}, enforcing traffic shaping",
                url, range_start, shape.pattern
            );
            handle.set_context(trafficshape::Context {
                shaping: true,
                buckets: Some(shape.buckets.clone()),
                global_bucket: Some(shape.global_bucket.clone()),
                url_pattern: shape.pattern.as_str().to_string(),
                range_start,
                byte_offset: range_start,
                header_len,
                header_bytes_written: 0,
                next_action,
                throttle,
            });
        }
        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use tokio::net::{TcpListener, TcpStream};

    async fn shaped_conn(shapes: Vec<trafficshape::Shape>) -> (ClientConn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shaped = trafficshape::Listener::new(listener, shapes);
        let client = TcpStream::connect(addr).await.unwrap();
        let conn = crate::net::Listener::accept(&shaped).await.unwrap();
        (conn, client)
    }

    fn shape(pattern: &str, throttles: Vec<trafficshape::Throttle>) -> trafficshape::Shape {
        let mut s = trafficshape::Shape::new(Regex::new(pattern).unwrap());
        s.throttles = throttles;
        s
    }

    #[tokio::test]
    async fn shaping_context_populated_on_pattern_match() {
        let throttles = vec![trafficshape::Throttle {
            bytes_start: 0,
            bytes_end: i64::MAX,
            bandwidth: 1000,
        }];
        let (conn, _client) = shaped_conn(vec![shape(r"example\.test/video", throttles)]).await;
        let handle = conn.shape_handle().unwrap();

        let (_, req) =
            Request::parse(b"GET http://example.test/video HTTP/1.1\r\nhost: example.test\r\n\r\n")
                .unwrap()
                .unwrap();
        let res = Response::new(StatusCode::OK);

        apply_traffic_shaping(handle, &req, &res);

        handle.with_context(|ctx| {
            assert!(ctx.shaping);
            assert_eq!(ctx.range_start, 0);
            assert!(ctx.header_len > 0);
            assert!(ctx.throttle.throttle_now);
            assert_eq!(ctx.throttle.bandwidth, 1000);
        });
        let shape = &handle.shapes()[0];
        assert_eq!(shape.buckets.write_bucket.capacity(), 1000);
    }

    #[tokio::test]
    async fn shaping_context_skips_non_matching_urls() {
        let (conn, _client) = shaped_conn(vec![shape(r"example\.test/video", vec![])]).await;
        let handle = conn.shape_handle().unwrap();

        let (_, req) =
            Request::parse(b"GET http://other.test/ HTTP/1.1\r\nhost: other.test\r\n\r\n")
                .unwrap()
                .unwrap();
        let res = Response::new(StatusCode::OK);

        apply_traffic_shaping(handle, &req, &res);
        handle.with_context(|ctx| assert!(!ctx.shaping));
    }

    #[tokio::test]
    async fn shaping_context_requires_recognized_range() {
        let (conn, _client) = shaped_conn(vec![shape(r"example\.test", vec![])]).await;
        let handle = conn.shape_handle().unwrap();

        let (_, req) =
            Request::parse(b"GET http://example.test/ HTTP/1.1\r\nhost: example.test\r\n\r\n")
                .unwrap()
                .unwrap();
        let res = Response::new(StatusCode::NOT_FOUND);

        apply_traffic_shaping(handle, &req, &res);
        handle.with_context(|ctx| assert!(!ctx.shaping));
    }
}
