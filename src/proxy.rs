//! Public listener: preview gateway plus management API
//!
//! `/p/{id}/...` is stripped of its prefix and forwarded to the preview's
//! backend on `127.0.0.1:{port}`. WebSocket upgrades on the same paths are
//! spliced through as raw bytes so dev-server hot reload keeps working.

use crate::admin;
use crate::error::{json_error_response, PreviewError, PreviewErrorCode};
use crate::manager::{PreviewManager, Target};
use crate::pool::{ConnectionPool, PoolConfig};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Header name for the stripped path prefix
const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";

/// Path prefix for preview traffic
const PREVIEW_PREFIX: &str = "/p/";

/// Largest upgrade response head accepted from a backend
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

/// Bounds on how often an open WebSocket refreshes its preview's idle clock
const MIN_UPGRADE_TOUCH_MS: u64 = 500;
const MAX_UPGRADE_TOUCH_SECS: u64 = 30;

type BoxResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// State shared by every connection
struct Gateway {
    manager: Arc<PreviewManager>,
    pool: Arc<ConnectionPool>,
    auth_token: String,
    request_timeout: Duration,
}

/// The public HTTP server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
    gateway: Arc<Gateway>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        manager: Arc<PreviewManager>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
        pool_config: PoolConfig,
        request_timeout: Duration,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(pool_config));
        Self {
            bind_addr,
            shutdown_rx,
            gateway: Arc::new(Gateway {
                manager,
                pool,
                auth_token,
                request_timeout,
            }),
        }
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.gateway.pool
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Preview gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gateway).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Preview gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, gateway: Arc<Gateway>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { handle_request(req, gateway, addr).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Split `/p/{id}/rest` into `id` and `/rest`. The rest is `None` for a bare `/p/{id}`.
pub fn split_preview_path(path: &str) -> Option<(&str, Option<&str>)> {
    let after = path.strip_prefix(PREVIEW_PREFIX)?;
    let (id, rest) = match after.find('/') {
        Some(i) => (&after[..i], Some(&after[i..])),
        None => (after, None),
    };
    if id.is_empty() {
        return None;
    }
    Some((id, rest))
}

/// Backend-relative path and query for a request below a preview prefix
pub fn rewrite_path(rest: Option<&str>, query: Option<&str>) -> String {
    let path = match rest {
        Some(rest) if !rest.is_empty() => rest,
        _ => "/",
    };
    match query {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    }
}

fn upstream_unavailable(message: &str) -> BoxResponse {
    PreviewError::ProxyUnavailable(message.to_string()).into_response()
}

fn redirect(status: StatusCode, location: &str) -> BoxResponse {
    match HeaderValue::from_str(location) {
        Ok(location) => Response::builder()
            .status(status)
            .header(hyper::header::LOCATION, location)
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"),
        Err(_) => json_error_response(PreviewErrorCode::InternalError, "invalid redirect location"),
    }
}

async fn handle_request(
    mut req: Request<Incoming>,
    gateway: Arc<Gateway>,
    client_addr: SocketAddr,
) -> Result<BoxResponse, hyper::Error> {
    let path = req.uri().path().to_string();

    if admin::is_management_path(&path) {
        let manager = Arc::clone(&gateway.manager);
        return Ok(admin::handle_management(req, manager, &gateway.auth_token).await);
    }

    let Some((id, rest)) = split_preview_path(&path) else {
        return Ok(json_error_response(
            PreviewErrorCode::RouteNotFound,
            "Unknown route, previews are served under /p/{id}/",
        ));
    };
    let id = id.to_string();
    let query = req.uri().query().map(String::from);

    // Relative asset URLs only resolve inside the prefix with a trailing slash
    if rest.is_none() && matches!(*req.method(), Method::GET | Method::HEAD) {
        let location = rewrite_path(Some(&format!("/p/{}/", id)), query.as_deref());
        return Ok(redirect(StatusCode::PERMANENT_REDIRECT, &location));
    }
    let rewritten = rewrite_path(rest, query.as_deref());

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Overwrite rather than append: this gateway is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    if let Ok(value) = HeaderValue::from_str(&format!("/p/{}", id)) {
        headers.insert(X_FORWARDED_PREFIX, value);
    }

    debug!(id, method = %req.method(), path = %rewritten, request_id, "Incoming preview request");

    let target = match gateway.manager.resolve(&id).await {
        Ok(target) => target,
        Err(PreviewError::NotFound(_)) => {
            return Ok(json_error_response(
                PreviewErrorCode::PreviewNotFound,
                format!("preview '{}' not found", id),
            ));
        }
        Err(e) => {
            // Log detailed error internally; the client is told to retry
            warn!(id, error = %e, "Preview not ready for traffic");
            return Ok(json_error_response(
                PreviewErrorCode::PreviewStarting,
                "Preview is starting, retry shortly",
            ));
        }
    };

    let port = match target {
        Target::Backend(port) => port,
        Target::Redirect(url) => {
            let location = format!("{}{}", url.trim_end_matches('/'), rewritten);
            debug!(id, location, "Redirecting to external deployment");
            return Ok(redirect(StatusCode::TEMPORARY_REDIRECT, &location));
        }
    };

    *req.uri_mut() = match rewritten.parse::<Uri>() {
        Ok(uri) => uri,
        Err(e) => {
            return Ok(json_error_response(
                PreviewErrorCode::InvalidRequest,
                format!("Invalid request path: {}", e),
            ));
        }
    };

    if is_upgrade_request(&req) {
        let manager = Arc::clone(&gateway.manager);
        return handle_upgrade(req, manager, id, port, request_id).await;
    }

    let request_timeout = gateway.request_timeout;
    let result = tokio::time::timeout(request_timeout, gateway.pool.send_request(req, port)).await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(id, port, error = %e, "Failed to forward request via pool");
            Ok(upstream_unavailable("failed to connect to preview backend"))
        }
        Err(_) => {
            warn!(id, port, timeout_secs = request_timeout.as_secs(), "Request timed out");
            Ok(json_error_response(
                PreviewErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", request_timeout.as_secs()),
            ))
        }
    }
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Build the raw HTTP upgrade request to send to the backend
fn build_upgrade_request<B>(req: &Request<B>, port: u16) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: 127.0.0.1:{}\r\n", port));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the response head from the backend
fn parse_upgrade_response(head: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(head).ok()?;
    let mut lines = response_str.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Read until the end of the response head. Returns the head and any bytes
/// the backend already sent past it.
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// How often an open upgraded connection counts as traffic for the idle reaper
fn upgrade_touch_interval(idle_timeout: Duration) -> Duration {
    (idle_timeout / 2).clamp(
        Duration::from_millis(MIN_UPGRADE_TOUCH_MS),
        Duration::from_secs(MAX_UPGRADE_TOUCH_SECS),
    )
}

/// Forward bytes bidirectionally between client and backend connections.
///
/// The preview is touched while the splice is open and once more when it closes.
async fn forward_bidirectional(
    client: Upgraded,
    mut backend: TcpStream,
    early: Vec<u8>,
    manager: Arc<PreviewManager>,
    id: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);

    if !early.is_empty() {
        if let Err(e) = client_io.write_all(&early).await {
            debug!(id, request_id, error = %e, "Client went away before forwarding started");
            return;
        }
    }

    let mut ticker = tokio::time::interval(upgrade_touch_interval(manager.defaults().idle_timeout()));
    ticker.tick().await;

    let copy = tokio::io::copy_bidirectional(&mut client_io, &mut backend);
    tokio::pin!(copy);
    let result = loop {
        tokio::select! {
            result = &mut copy => break result,
            _ = ticker.tick() => { manager.registry().touch(id); }
        }
    };
    manager.registry().touch(id);

    match result {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(id, request_id, client_to_backend, backend_to_client, "WebSocket connection closed normally");
        }
        Err(e) => {
            debug!(id, request_id, error = %e, "WebSocket connection closed with error");
        }
    }
}

/// Handle a WebSocket upgrade request
async fn handle_upgrade(
    req: Request<Incoming>,
    manager: Arc<PreviewManager>,
    id: String,
    port: u16,
    request_id: String,
) -> Result<BoxResponse, hyper::Error> {
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    debug!(id, request_id, upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, port);

    let mut backend_stream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(id, port, error = %e, "Failed to connect to backend for upgrade");
            return Ok(upstream_unavailable("failed to connect to preview backend"));
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(id, error = %e, "Failed to send upgrade request to backend");
        return Ok(upstream_unavailable("failed to send upgrade request"));
    }

    let (head, early) = match read_response_head(&mut backend_stream).await {
        Ok(parts) => parts,
        Err(e) => {
            error!(id, error = %e, "Failed to read upgrade response from backend");
            return Ok(upstream_unavailable("invalid upgrade response from backend"));
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&head) else {
        error!(id, "Failed to parse backend upgrade response");
        return Ok(upstream_unavailable("invalid upgrade response from backend"));
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(id, status = %status, "Backend rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    info!(id, request_id, upgrade_type, "WebSocket upgrade successful");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        // Hop-by-hop framing headers are hyper's concern
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(id, request_id, "Client upgrade complete, starting forwarding");
                forward_bidirectional(upgraded, backend_stream, early, manager, &id, &request_id).await;
            }
            Err(e) => {
                error!(id, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}
