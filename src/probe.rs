//! Readiness probing for freshly spawned backends
//!
//! Dev servers offer no readiness signal of their own, so readiness is
//! detected by polling `http://127.0.0.1:{port}/` until any HTTP response
//! arrives or the overall deadline passes.

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

/// Polling parameters. The per-attempt budget is independent of the overall deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Overall deadline for the wait
    pub timeout: Duration,
    /// Delay between attempts
    pub interval: Duration,
    /// Budget for a single connect + request + status line read
    pub attempt_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            interval: Duration::from_millis(300),
            attempt_timeout: Duration::from_secs(1),
        }
    }
}

/// Poll the backend on `port` until it answers or `config.timeout` elapses
pub async fn wait_ready(port: u16, config: &ProbeConfig) -> bool {
    let deadline = Instant::now() + config.timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let budget = config.attempt_timeout.min(remaining);

        if !budget.is_zero() && probe_once(port, budget).await {
            debug!(port, attempts, "Backend answered readiness probe");
            return true;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!(port, attempts, "Readiness deadline elapsed");
            return false;
        }

        tokio::time::sleep(config.interval.min(remaining)).await;
    }
}

/// One probe attempt. Any parseable HTTP status line counts as ready.
pub async fn probe_once(port: u16, budget: Duration) -> bool {
    let attempt = async {
        let host_port = format!("127.0.0.1:{}", port);
        let mut stream = TcpStream::connect(&host_port).await.ok()?;

        let request = format!(
            "GET / HTTP/1.1\r\nHost: {}\r\nUser-Agent: previewgate-probe\r\nConnection: close\r\n\r\n",
            host_port
        );
        stream.write_all(request.as_bytes()).await.ok()?;

        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await.ok()?;

        // Format: "HTTP/1.1 200 OK\r\n"
        let mut parts = status_line.split_whitespace();
        let version = parts.next()?;
        let code = parts.next()?.parse::<u16>().ok()?;
        Some(version.starts_with("HTTP/") && (100..600).contains(&code))
    };

    matches!(tokio::time::timeout(budget, attempt).await, Ok(Some(true)))
}
