use previewgate::admin::{PKG_NAME, VERSION};
use previewgate::config::Config;
use previewgate::manager::PreviewManager;
use previewgate::pool::PoolConfig;
use previewgate::proxy::ProxyServer;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("previewgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    std::fs::create_dir_all(&config.previews.root_dir).map_err(|e| {
        anyhow::anyhow!(
            "Failed to create preview root '{}': {}",
            config.previews.root_dir.display(),
            e
        )
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let manager = PreviewManager::new(&config)?;

    // Records are rebuilt lazily; existing directories restart on their next request
    match manager.workspace().discover().await {
        Ok(ids) if !ids.is_empty() => {
            info!(count = ids.len(), previews = ?ids, "Found resumable previews on disk");
        }
        Ok(_) => info!("No existing previews on disk"),
        Err(e) => warn!(error = %e, "Failed to scan preview root"),
    }

    let auth_token = config.server.auth_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated management API token (configure auth_token to set a fixed value)");
        token
    });

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    // The only fatal runtime error: failing to bind the public listener
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!(addr = %addr, error = %e, "Failed to bind public listener");
        anyhow::anyhow!("Failed to bind {}: {}", addr, e)
    })?;

    let server = ProxyServer::new(
        addr,
        Arc::clone(&manager),
        shutdown_rx.clone(),
        auth_token,
        pool_config,
        config.server.request_timeout(),
    );
    let pool_stats = server.pool().stats();

    info!(url = %config.server.public_url(), "Previews served under {}/p/{{id}}/", config.server.public_url());

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            error!(error = %e, "Preview gateway error");
        }
    });

    // Spawn idle reaper
    let reaper_manager = Arc::clone(&manager);
    let reaper_shutdown_rx = shutdown_rx.clone();
    let reap_interval = config.previews.reap_interval();
    tokio::spawn(async move {
        idle_reaper_loop(reaper_manager, reap_interval, reaper_shutdown_rx).await;
    });

    wait_for_shutdown_signal().await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping all preview backends...");
    manager.stop_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!(
        total_requests = pool_stats.get_total_requests(),
        failed_requests = pool_stats.get_failed_requests(),
        "Proxy statistics"
    );

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

async fn idle_reaper_loop(
    manager: Arc<PreviewManager>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let reaped = manager.reap_idle();
                if reaped > 0 {
                    info!(reaped, live = manager.registry().len(), "Idle reaper pass complete");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting preview gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        public_url = %config.server.public_url(),
        auth_token_configured = config.server.auth_token.is_some(),
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        "Connection pool settings"
    );
    info!(
        root_dir = %config.previews.root_dir.display(),
        template_dir = %config.previews.template_dir.display(),
        base_port = config.previews.base_port,
        port_window = config.previews.port_window,
        "Preview workspace"
    );
    info!(
        idle_timeout_secs = config.previews.idle_timeout_secs,
        reap_interval_secs = config.previews.reap_interval_secs,
        startup_timeout_secs = config.previews.startup_timeout_secs,
        shutdown_grace_period_secs = config.previews.shutdown_grace_period_secs,
        "Lifecycle settings"
    );
    info!(
        deploy_targets = ?config.deploy.keys().collect::<Vec<_>>(),
        "Configured deploy targets"
    );
}
