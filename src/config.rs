use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::probe::ProbeConfig;

/// Global configuration for the preview gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener and management API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Settings shared by every preview
    #[serde(default)]
    pub previews: PreviewDefaults,

    /// External deployment targets keyed by platform name
    #[serde(default)]
    pub deploy: HashMap<String, DeployTarget>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public port serving both the management API and `/p/{id}` traffic
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Bearer token for the management API.
    /// If not set, a random token is generated at startup and logged
    pub auth_token: Option<String>,

    /// Base URL used when reporting preview URLs to clients
    pub public_url: Option<String>,

    /// Maximum idle connections per backend port (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for a backend response in seconds (default: 60)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl ServerConfig {
    /// Base URL for preview links, derived from the listener when not configured
    pub fn public_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let host = if self.bind == "0.0.0.0" { "localhost" } else { self.bind.as_str() };
                format!("http://{}:{}", host, self.port)
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            auth_token: None,
            public_url: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            pid_file: None,
        }
    }
}

/// Settings that govern how previews are provisioned, supervised and reaped
///
/// # Security Warning
///
/// `install_command` and `dev_command` are executed directly inside each
/// preview directory, which contains client-submitted files. Run the gateway
/// as an unprivileged user and protect the configuration file.
#[derive(Debug, Deserialize, Clone)]
pub struct PreviewDefaults {
    /// Directory holding one subdirectory per preview id
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Boilerplate tree copied into a fresh preview directory
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,

    /// Entry names skipped while copying the template
    #[serde(default = "default_template_skip")]
    pub template_skip: Vec<String>,

    /// First port of the private port window
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Number of ports in the window
    #[serde(default = "default_port_window")]
    pub port_window: u16,

    /// Seconds without traffic before a preview is reaped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Seconds between reaper ticks
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Overall readiness deadline in seconds
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Delay between readiness probes in milliseconds
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Budget for a single readiness probe in milliseconds
    #[serde(default = "default_probe_attempt_timeout")]
    pub probe_attempt_timeout_ms: u64,

    /// Number of output chunks retained per preview
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Dependency installation command, run inside the preview directory
    #[serde(default = "default_install_command")]
    pub install_command: String,

    /// Seconds the install command may run before it is killed
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,

    /// Path (relative to the preview directory) that exists once dependencies are installed
    #[serde(default = "default_installed_marker")]
    pub installed_marker: String,

    /// Development server command. `{port}`, `{id}` and `{base_path}` are substituted
    #[serde(default = "default_dev_command")]
    pub dev_command: String,

    /// Extra environment for the development server
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Seconds to wait for backends to exit at gateway shutdown
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl PreviewDefaults {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    /// Readiness probe settings with the given overall deadline
    pub fn probe_config(&self, timeout: Duration) -> ProbeConfig {
        ProbeConfig {
            timeout,
            interval: Duration::from_millis(self.probe_interval_ms),
            attempt_timeout: Duration::from_millis(self.probe_attempt_timeout_ms),
        }
    }

    /// Directory owned by the preview with the given id
    pub fn preview_dir(&self, id: &str) -> PathBuf {
        self.root_dir.join(id)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.port_window == 0 {
            errors.push("previews: 'port_window' must be greater than 0".to_string());
        }
        if self.base_port == 0 {
            errors.push("previews: 'base_port' must be greater than 0".to_string());
        }
        if u32::from(self.base_port) + u32::from(self.port_window) > u32::from(u16::MAX) + 1 {
            errors.push(format!(
                "previews: port window {}+{} exceeds 65535",
                self.base_port, self.port_window
            ));
        }
        if self.log_capacity == 0 {
            errors.push("previews: 'log_capacity' must be greater than 0".to_string());
        }
        if self.install_timeout_secs == 0 {
            errors.push("previews: 'install_timeout_secs' must be greater than 0".to_string());
        }
        for (field, command) in [
            ("install_command", &self.install_command),
            ("dev_command", &self.dev_command),
        ] {
            match shell_words::split(command) {
                Ok(parts) if !parts.is_empty() => {}
                Ok(_) => errors.push(format!("previews: '{}' is empty", field)),
                Err(e) => errors.push(format!("previews: '{}' cannot be parsed: {}", field, e)),
            }
        }
    }
}

impl Default for PreviewDefaults {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            template_dir: default_template_dir(),
            template_skip: default_template_skip(),
            base_port: default_base_port(),
            port_window: default_port_window(),
            idle_timeout_secs: default_idle_timeout(),
            reap_interval_secs: default_reap_interval(),
            startup_timeout_secs: default_startup_timeout(),
            probe_interval_ms: default_probe_interval(),
            probe_attempt_timeout_ms: default_probe_attempt_timeout(),
            log_capacity: default_log_capacity(),
            install_command: default_install_command(),
            install_timeout_secs: default_install_timeout(),
            installed_marker: default_installed_marker(),
            dev_command: default_dev_command(),
            env: HashMap::new(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

/// An external static/serverless host a preview can be published to
#[derive(Debug, Deserialize, Clone)]
pub struct DeployTarget {
    /// Command run inside the preview directory; the last https URL it prints is the deployment URL
    pub command: String,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Deployment timeout in seconds (default: 600)
    #[serde(default = "default_deploy_timeout")]
    pub timeout_secs: u64,
}

impl DeployTarget {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    60
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("./previews")
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("./template")
}

fn default_template_skip() -> Vec<String> {
    vec!["node_modules".to_string(), ".git".to_string()]
}

fn default_base_port() -> u16 {
    20000
}

fn default_port_window() -> u16 {
    1000
}

fn default_idle_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_reap_interval() -> u64 {
    60
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_probe_interval() -> u64 {
    300
}

fn default_probe_attempt_timeout() -> u64 {
    1000
}

fn default_log_capacity() -> usize {
    4000
}

fn default_install_command() -> String {
    "npm install --no-audit --no-fund".to_string()
}

fn default_install_timeout() -> u64 {
    600
}

fn default_installed_marker() -> String {
    "node_modules/.bin/vite".to_string()
}

fn default_dev_command() -> String {
    "node_modules/.bin/vite --host 127.0.0.1 --port {port} --strictPort --base {base_path}".to_string()
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_deploy_timeout() -> u64 {
    600
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        self.previews.validate(&mut errors);

        for (platform, target) in &self.deploy {
            if shell_words::split(&target.command).map(|p| p.is_empty()).unwrap_or(true) {
                errors.push(format!("deploy '{}': 'command' is empty or unparsable", platform));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
