//! Integration tests for Previewgate
//!
//! Each test runs the full gateway on an ephemeral port. A small in-process
//! HTTP server stands in for the dev server: it owns the single port the
//! allocator can hand out, while the spawned "dev server" is a `sleep` that
//! only has to stay alive.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use previewgate::config::Config;
use previewgate::manager::PreviewManager;
use previewgate::pool::PoolConfig;
use previewgate::proxy::ProxyServer;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const TOKEN: &str = "test-token";
const INSTALL: &str = "sh -c 'mkdir -p node_modules/.bin && touch node_modules/.bin/dev'";
const DEV: &str = "sleep 30";

struct Harness {
    gateway_port: u16,
    manager: Arc<PreviewManager>,
    shutdown_tx: watch::Sender<bool>,
    _root: tempfile::TempDir,
    _template: tempfile::TempDir,
}

impl Harness {
    async fn shutdown(self) {
        self.manager.stop_all().await;
        let _ = self.shutdown_tx.send(true);
    }

    fn preview_dir(&self, id: &str) -> std::path::PathBuf {
        self.manager.defaults().preview_dir(id)
    }
}

/// Read one request, then either echo its head and body back as the body or,
/// for a WebSocket upgrade, switch protocols and echo raw bytes.
fn spawn_echo_backend(listener: TcpListener) {
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Some((head, request_body)) = read_request(&mut stream).await else {
                    return;
                };

                if head.to_lowercase().contains("upgrade: websocket") {
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
                        )
                        .await;
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    return;
                }

                let echoed = format!("{}{}", head, request_body);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    echoed.len(),
                    echoed
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
}

async fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            return String::from_utf8(buf[..end + 4].to_vec()).ok();
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Read a request head plus the body its Content-Length announces
async fn read_request(stream: &mut TcpStream) -> Option<(String, String)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let end = loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break end + 4;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8(buf[..end].to_vec()).ok()?;
    let length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buf[end..].to_vec();
    while body.len() < length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(length);
    Some((head, String::from_utf8_lossy(&body).into_owned()))
}

async fn start_harness(idle_timeout_secs: u64) -> Harness {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();
    spawn_echo_backend(backend);

    let root = tempfile::tempdir().unwrap();
    let template = tempfile::tempdir().unwrap();
    std::fs::write(template.path().join("package.json"), r#"{"name":"app"}"#).unwrap();
    std::fs::create_dir_all(template.path().join("src")).unwrap();
    std::fs::write(template.path().join("src/App.tsx"), "export default 1").unwrap();

    let mut config: Config = toml::from_str("").unwrap();
    config.server.auth_token = Some(TOKEN.to_string());
    config.previews.root_dir = root.path().to_path_buf();
    config.previews.template_dir = template.path().to_path_buf();
    config.previews.base_port = backend_port;
    config.previews.port_window = 1;
    config.previews.install_command = INSTALL.to_string();
    config.previews.installed_marker = "node_modules/.bin/dev".to_string();
    config.previews.dev_command = DEV.to_string();
    config.previews.startup_timeout_secs = 5;
    config.previews.probe_interval_ms = 50;
    config.previews.probe_attempt_timeout_ms = 200;
    config.previews.idle_timeout_secs = idle_timeout_secs;
    config.previews.shutdown_grace_period_secs = 1;

    let manager = PreviewManager::new(&config).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = ProxyServer::new(
        addr,
        Arc::clone(&manager),
        shutdown_rx,
        TOKEN.to_string(),
        PoolConfig::default(),
        Duration::from_secs(5),
    );
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    Harness {
        gateway_port: addr.port(),
        manager,
        shutdown_tx,
        _root: root,
        _template: template,
    }
}

/// Send a raw HTTP/1.1 request and return the full response text
async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<&str>,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n",
        method, path, port
    );
    if let Some(token) = token {
        request.push_str(&format!("Authorization: Bearer {}\r\n", token));
    }
    let body = body.unwrap_or("");
    if !body.is_empty() || method == "POST" {
        request.push_str("Content-Type: application/json\r\n");
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("\r\n");
    request.push_str(body);
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

async fn http_get(port: u16, path: &str) -> String {
    http_request(port, "GET", path, None, None).await.unwrap()
}

async fn api(port: u16, method: &str, path: &str, body: Option<&str>) -> String {
    http_request(port, method, path, Some(TOKEN), body).await.unwrap()
}

fn status_code(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

fn body(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

/// Parse a JSON body; chunked framing is stripped by taking the outermost object
fn json_body(response: &str) -> Value {
    let body = body(response);
    let start = body.find('{').unwrap_or(0);
    let end = body.rfind('}').map(|i| i + 1).unwrap_or(body.len());
    serde_json::from_str(&body[start..end]).unwrap()
}

fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let head = response.split_once("\r\n\r\n").map(|(head, _)| head)?;
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

async fn create(port: u16, id: &str) -> String {
    api(port, "POST", "/api/previews", Some(&format!(r#"{{"id":"{}"}}"#, id))).await
}

async fn preview_status(port: u16, id: &str) -> Value {
    json_body(&api(port, "GET", &format!("/api/previews/{}", id), None).await)
}

async fn wait_for_status(port: u16, id: &str, expected: &str, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        let response = api(port, "GET", &format!("/api/previews/{}", id), None).await;
        if status_code(&response) == 200 && json_body(&response)["status"] == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn kill(pid: u64) {
    let _ = std::process::Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .status();
}

fn read_file(dir: &Path, path: &str) -> String {
    std::fs::read_to_string(dir.join(path)).unwrap()
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_create_proxy_delete_flow() {
    let h = start_harness(300).await;
    let port = h.gateway_port;

    let response = create(port, "demo").await;
    assert_eq!(status_code(&response), 201, "{}", response);
    let outcome = json_body(&response);
    assert_eq!(outcome["id"], "demo");
    assert_eq!(outcome["status"], "running");
    assert!(outcome["url"].as_str().unwrap().ends_with("/p/demo/"));

    assert!(h.preview_dir("demo").join("package.json").exists());
    assert!(h.preview_dir("demo").join("node_modules/.bin/dev").exists());

    let response = http_get(port, "/p/demo/").await;
    assert_eq!(status_code(&response), 200, "{}", response);
    assert!(body(&response).starts_with("GET / HTTP/1.1"));

    let status = preview_status(port, "demo").await;
    assert_eq!(status["status"], "running");
    assert!(status["pid"].as_u64().is_some());

    let response = api(port, "DELETE", "/api/previews/demo", None).await;
    assert_eq!(status_code(&response), 200);
    assert_eq!(json_body(&response)["deleted"], true);
    assert!(!h.preview_dir("demo").exists());

    let response = http_get(port, "/p/demo/").await;
    assert_eq!(status_code(&response), 404);
    assert!(response.contains("PREVIEW_NOT_FOUND"));

    // Deleting again is not an error
    let response = api(port, "DELETE", "/api/previews/demo", None).await;
    assert_eq!(status_code(&response), 200);
    assert_eq!(json_body(&response)["deleted"], false);

    h.shutdown().await;
}

#[tokio::test]
async fn test_patch_writes_files_without_restart() {
    let h = start_harness(300).await;
    let port = h.gateway_port;

    assert_eq!(status_code(&create(port, "demo").await), 201);
    let before = preview_status(port, "demo").await;

    let patch = r#"{"id":"demo","files":[{"path":"src/App.tsx","content":"export default 2"}]}"#;
    let response = api(port, "POST", "/api/previews", Some(patch)).await;
    assert_eq!(status_code(&response), 200, "{}", response);
    assert_eq!(json_body(&response)["port"], before["port"]);

    let after = preview_status(port, "demo").await;
    assert_eq!(after["pid"], before["pid"]);
    assert_eq!(read_file(&h.preview_dir("demo"), "src/App.tsx"), "export default 2");

    h.shutdown().await;
}

#[tokio::test]
async fn test_rejects_unsafe_file_paths() {
    let h = start_harness(300).await;
    let port = h.gateway_port;

    let request = r#"{"id":"demo","files":[{"path":"../escape.txt","content":"x"}]}"#;
    let response = api(port, "POST", "/api/previews", Some(request)).await;
    assert_eq!(status_code(&response), 400);
    assert!(response.contains("INVALID_REQUEST"));
    assert!(!h.preview_dir("demo").exists());

    let response = api(port, "POST", "/api/previews", Some(r#"{"id":"../demo"}"#)).await;
    assert_eq!(status_code(&response), 400);

    h.shutdown().await;
}

#[tokio::test]
async fn test_port_window_exhaustion() {
    let h = start_harness(300).await;
    let port = h.gateway_port;

    assert_eq!(status_code(&create(port, "first").await), 201);

    let response = create(port, "second").await;
    assert_eq!(status_code(&response), 503, "{}", response);
    assert!(response.contains("PORT_EXHAUSTED"));

    assert_eq!(status_code(&api(port, "DELETE", "/api/previews/first", None).await), 200);

    // The directory from the failed attempt is reused, so this is not a fresh create
    let response = create(port, "second").await;
    assert_eq!(status_code(&response), 200, "{}", response);
    assert_eq!(json_body(&response)["status"], "running");

    h.shutdown().await;
}

#[tokio::test]
async fn test_list_previews() {
    let h = start_harness(300).await;
    let port = h.gateway_port;

    assert_eq!(status_code(&create(port, "demo").await), 201);

    let response = api(port, "GET", "/api/previews", None).await;
    assert_eq!(status_code(&response), 200);
    let list = json_body(&response);
    let previews = list["previews"].as_array().unwrap();
    assert_eq!(previews.len(), 1);
    assert_eq!(previews[0]["id"], "demo");
    assert!(list["resumable"].as_array().unwrap().is_empty());

    h.shutdown().await;
}

// ============================================================================
// Self-Healing and Reaping Tests
// ============================================================================

#[tokio::test]
async fn test_crashed_preview_restarts_on_next_request() {
    let h = start_harness(300).await;
    let port = h.gateway_port;

    assert_eq!(status_code(&create(port, "demo").await), 201);
    let pid = preview_status(port, "demo").await["pid"].as_u64().unwrap();

    kill(pid);
    assert!(
        wait_for_status(port, "demo", "crashed", Duration::from_secs(3)).await,
        "crash was not recorded"
    );
    let crashed = preview_status(port, "demo").await;
    assert!(crashed["lastError"].as_str().unwrap().contains("signal"));

    let response = http_get(port, "/p/demo/").await;
    assert_eq!(status_code(&response), 200, "{}", response);

    let restarted = preview_status(port, "demo").await;
    assert_eq!(restarted["status"], "running");
    assert_ne!(restarted["pid"].as_u64().unwrap(), pid);

    h.shutdown().await;
}

#[tokio::test]
async fn test_idle_preview_is_reaped_and_resumed() {
    let h = start_harness(1).await;
    let port = h.gateway_port;

    assert_eq!(status_code(&create(port, "demo").await), 201);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.manager.reap_idle(), 1);
    assert!(h.preview_dir("demo").exists());

    let list = json_body(&api(port, "GET", "/api/previews", None).await);
    assert!(list["previews"].as_array().unwrap().is_empty());
    assert_eq!(list["resumable"][0], "demo");

    let response = http_get(port, "/p/demo/").await;
    assert_eq!(status_code(&response), 200, "{}", response);
    assert_eq!(preview_status(port, "demo").await["status"], "running");

    h.shutdown().await;
}

#[tokio::test]
async fn test_recent_traffic_prevents_reaping() {
    let h = start_harness(1).await;
    let port = h.gateway_port;

    assert_eq!(status_code(&create(port, "demo").await), 201);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(status_code(&http_get(port, "/p/demo/").await), 200);
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert_eq!(h.manager.reap_idle(), 0);
    assert_eq!(preview_status(port, "demo").await["status"], "running");

    h.shutdown().await;
}

// ============================================================================
// Gateway Routing Tests
// ============================================================================

#[tokio::test]
async fn test_prefix_is_stripped_before_forwarding() {
    let h = start_harness(300).await;
    let port = h.gateway_port;

    assert_eq!(status_code(&create(port, "demo").await), 201);

    let response = http_get(port, "/p/demo/src/main.ts?t=123").await;
    assert_eq!(status_code(&response), 200);
    let echoed = body(&response).to_lowercase();
    assert!(echoed.starts_with("get /src/main.ts?t=123 http/1.1"), "{}", echoed);
    assert!(echoed.contains("x-forwarded-prefix: /p/demo"));
    assert!(echoed.contains("x-request-id:"));

    let response = http_get(port, "/p/demo").await;
    assert_eq!(status_code(&response), 308);
    assert_eq!(header(&response, "location"), Some("/p/demo/"));

    h.shutdown().await;
}

#[tokio::test]
async fn test_post_body_and_headers_are_forwarded() {
    let h = start_harness(300).await;
    let port = h.gateway_port;

    assert_eq!(status_code(&create(port, "demo").await), 201);

    let payload = r#"{"title":"hello"}"#;
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    let request = format!(
        "POST /p/demo/api/items?draft=1 HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\nX-Custom: abc\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        port,
        payload.len(),
        payload
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert_eq!(status_code(&response), 200, "{}", response);
    let echoed = body(&response);
    let lowered = echoed.to_lowercase();
    assert!(lowered.starts_with("post /api/items?draft=1 http/1.1"), "{}", echoed);
    assert!(lowered.contains("x-custom: abc"));
    assert!(lowered.contains("content-type: application/json"));
    assert!(echoed.ends_with(payload), "{}", echoed);

    h.shutdown().await;
}

#[tokio::test]
async fn test_unknown_routes_return_404() {
    let h = start_harness(300).await;
    let port = h.gateway_port;

    let response = http_get(port, "/nope").await;
    assert_eq!(status_code(&response), 404);
    assert!(response.contains("ROUTE_NOT_FOUND"));
    assert_eq!(header(&response, "x-preview-error"), Some("ROUTE_NOT_FOUND"));

    let response = http_get(port, "/p/ghost/").await;
    assert_eq!(status_code(&response), 404);
    assert!(response.contains("PREVIEW_NOT_FOUND"));

    h.shutdown().await;
}

#[tokio::test]
async fn test_management_requires_bearer_token() {
    let h = start_harness(300).await;
    let port = h.gateway_port;

    let response = http_get(port, "/api/previews").await;
    assert_eq!(status_code(&response), 401);
    assert!(response.contains("UNAUTHORIZED"));

    let response = http_request(port, "GET", "/api/previews", Some("wrong"), None)
        .await
        .unwrap();
    assert_eq!(status_code(&response), 401);

    let response = http_get(port, "/health").await;
    assert_eq!(status_code(&response), 200);
    assert_eq!(body(&response).trim(), "ok");

    let response = http_get(port, "/version").await;
    assert_eq!(status_code(&response), 200);
    assert_eq!(json_body(&response)["name"], "previewgate");

    h.shutdown().await;
}

#[tokio::test]
async fn test_logs_endpoint() {
    let h = start_harness(300).await;
    let port = h.gateway_port;

    assert_eq!(status_code(&create(port, "demo").await), 201);

    let response = api(port, "GET", "/api/previews/demo/logs", None).await;
    assert_eq!(status_code(&response), 200);
    assert!(header(&response, "content-type").unwrap().starts_with("text/plain"));

    let response = api(port, "GET", "/api/previews/ghost/logs", None).await;
    assert_eq!(status_code(&response), 404);

    h.shutdown().await;
}

#[tokio::test]
async fn test_websocket_upgrade_is_spliced() {
    let h = start_harness(300).await;
    let port = h.gateway_port;

    assert_eq!(status_code(&create(port, "demo").await), 201);

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    let request = format!(
        "GET /p/demo/hmr HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        port
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = tokio::time::timeout(Duration::from_secs(5), read_head(&mut stream))
        .await
        .unwrap()
        .unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "{}", head);

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");

    h.shutdown().await;
}

#[tokio::test]
async fn test_open_websocket_prevents_reaping() {
    let h = start_harness(1).await;
    let port = h.gateway_port;

    assert_eq!(status_code(&create(port, "demo").await), 201);

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    let request = format!(
        "GET /p/demo/hmr HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        port
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = tokio::time::timeout(Duration::from_secs(5), read_head(&mut stream))
        .await
        .unwrap()
        .unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "{}", head);

    // No HTTP requests for longer than the idle timeout, only an open socket
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.manager.reap_idle(), 0);
    assert_eq!(preview_status(port, "demo").await["status"], "running");

    stream.write_all(b"pong").await.unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"pong");

    h.shutdown().await;
}
