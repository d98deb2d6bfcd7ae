//! Development-server process supervision
//!
//! Each backend runs in its own process group with piped output. A watcher
//! task owns the child and reports its exit as an [`ExitEvent`] on a channel;
//! the registry consumes those events at a single mutation point instead of
//! being mutated from the watcher itself.

use crate::error::{PreviewError, PreviewResult};
use crate::logs::{LogBuffer, OutputLines};
use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a fresh process is watched for an immediate crash before spawn is confirmed
const SPAWN_CONFIRM_MS: u64 = 150;

/// Longest single output chunk kept in the log ring
const MAX_CHUNK_LEN: usize = 8 * 1024;

/// Number of chunks included when an error quotes recent output
pub const ERROR_LOG_TAIL: usize = 40;

/// Notification that a supervised backend exited
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitEvent {
    pub id: String,
    /// Spawn generation, used to ignore exits of processes that were already replaced
    pub generation: u64,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitEvent {
    fn from_status(id: &str, generation: u64, status: &ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            id: id.to_string(),
            generation,
            code: status.code(),
            signal,
        }
    }

    /// Human-readable exit reason
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("backend exited with code {}", code),
            (None, Some(signal)) => format!("backend killed by signal {}", signal),
            (None, None) => "backend exited".to_string(),
        }
    }
}

/// Handle to a supervised backend process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: u32,
    pub generation: u64,
    exited: watch::Receiver<bool>,
}

impl ProcessHandle {
    /// Whether the watcher has observed the process exit
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Resolves once the process has exited
    pub async fn wait_exit(&self) {
        let mut rx = self.exited.clone();
        // A closed channel means the watcher is gone, which only happens after exit
        let _ = rx.wait_for(|exited| *exited).await;
    }
}

/// Spawns development servers and reports their exit
pub struct Supervisor {
    /// Command template split into program and arguments
    command: Vec<String>,
    env: HashMap<String, String>,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
}

impl Supervisor {
    pub fn new(
        dev_command: &str,
        env: HashMap<String, String>,
        exit_tx: mpsc::UnboundedSender<ExitEvent>,
    ) -> PreviewResult<Self> {
        let command = shell_words::split(dev_command)
            .map_err(|e| PreviewError::Provisioning(format!("invalid dev command: {}", e)))?;
        if command.is_empty() {
            return Err(PreviewError::Provisioning("dev command is empty".to_string()));
        }

        Ok(Self {
            command,
            env,
            exit_tx,
        })
    }

    /// Program and arguments for a preview, with placeholders substituted
    pub fn command_for(&self, id: &str, port: u16) -> (String, Vec<String>) {
        let base_path = base_path(id);
        let port = port.to_string();
        let mut parts = self.command.iter().map(|part| {
            part.replace("{port}", &port)
                .replace("{id}", id)
                .replace("{base_path}", &base_path)
        });
        let program = parts.next().unwrap_or_default();
        (program, parts.collect())
    }

    /// Start the development server for `id` in `directory`, bound to `port`.
    ///
    /// Spawn failures and exits within the confirmation window are returned as
    /// errors. Once this returns `Ok`, the process exit is delivered as an
    /// [`ExitEvent`] instead.
    pub async fn spawn(
        &self,
        id: &str,
        directory: &Path,
        port: u16,
        generation: u64,
        logs: Arc<LogBuffer>,
    ) -> PreviewResult<ProcessHandle> {
        let (program, args) = self.command_for(id, port);
        let resolved = resolve_program(&program, directory);

        info!(id, port, generation, command = %program, "Starting preview backend");

        let mut cmd = Command::new(&resolved);
        cmd.args(&args);
        cmd.current_dir(directory);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(false);

        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.env("PORT", port.to_string());
        cmd.env("HOST", "127.0.0.1");
        cmd.env("PREVIEW_ID", id);
        cmd.env("PREVIEW_BASE_PATH", base_path(id));

        // Own process group so termination reaches the dev server's children
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            let message = format!("failed to spawn '{}': {}", program, e);
            logs.push(format!("[previewgate] {}", message));
            PreviewError::Provisioning(message)
        })?;

        let pid = child.id().unwrap_or(0);
        info!(id, pid, port, generation, "Preview backend spawned");
        logs.push(format!("[previewgate] started pid {} on port {}", pid, port));

        let readers = attach_output(&mut child, id, &logs);

        // Immediate crash is reported to the caller, not as an event
        if let Ok(status) = tokio::time::timeout(
            Duration::from_millis(SPAWN_CONFIRM_MS),
            child.wait(),
        )
        .await
        {
            let status = status?;
            drain_readers(readers).await;
            let event = ExitEvent::from_status(id, generation, &status);
            logs.push(format!("[previewgate] {}", event.describe()));
            warn!(id, pid, ?status, "Preview backend exited immediately");
            return Err(PreviewError::ProcessCrash(format!(
                "{}\n{}",
                event.describe(),
                logs.tail(ERROR_LOG_TAIL)
            )));
        }

        let (exited_tx, exited_rx) = watch::channel(false);
        let exit_tx = self.exit_tx.clone();
        let id_owned = id.to_string();
        tokio::spawn(async move {
            let event = match child.wait().await {
                Ok(status) => ExitEvent::from_status(&id_owned, generation, &status),
                Err(e) => {
                    warn!(id = %id_owned, pid, error = %e, "Error waiting for preview backend");
                    ExitEvent {
                        id: id_owned.clone(),
                        generation,
                        code: None,
                        signal: None,
                    }
                }
            };
            info!(id = %id_owned, pid, generation, reason = %event.describe(), "Preview backend exited");
            logs.push(format!("[previewgate] {}", event.describe()));
            let _ = exited_tx.send(true);
            let _ = exit_tx.send(event);
        });

        Ok(ProcessHandle {
            pid,
            generation,
            exited: exited_rx,
        })
    }
}

/// Asset path prefix a backend serves under
pub fn base_path(id: &str) -> String {
    format!("/p/{}/", id)
}

/// Relative programs such as `node_modules/.bin/vite` are resolved against the preview directory
fn resolve_program(program: &str, directory: &Path) -> std::path::PathBuf {
    let path = Path::new(program);
    if path.components().count() > 1 && path.is_relative() {
        directory.join(path)
    } else {
        path.to_path_buf()
    }
}

fn attach_output(child: &mut Child, id: &str, logs: &Arc<LogBuffer>) -> Vec<JoinHandle<()>> {
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(pipe_output(stdout, id.to_string(), Arc::clone(logs), false));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(pipe_output(stderr, id.to_string(), Arc::clone(logs), true));
    }
    readers
}

fn pipe_output<R>(stream: R, id: String, logs: Arc<LogBuffer>, is_stderr: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = OutputLines::new(stream);
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = truncate_chunk(line.trim_end());
                    if line.is_empty() {
                        continue;
                    }
                    if is_stderr {
                        warn!(target: "preview", id = %id, stream = "stderr", "{}", line);
                        logs.push(format!("[stderr] {}", line));
                    } else {
                        info!(target: "preview", id = %id, stream = "stdout", "{}", line);
                        logs.push(line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(id = %id, error = %e, "Stopped reading backend output");
                    break;
                }
            }
        }
    })
}

fn truncate_chunk(line: &str) -> String {
    if line.len() <= MAX_CHUNK_LEN {
        return line.to_string();
    }
    let mut end = MAX_CHUNK_LEN;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &line[..end])
}

/// Let output readers flush what the exited process wrote, bounded in case a grandchild holds the pipe
async fn drain_readers(readers: Vec<JoinHandle<()>>) {
    let _ = tokio::time::timeout(Duration::from_millis(500), async {
        for reader in readers {
            let _ = reader.await;
        }
    })
    .await;
}

/// Send SIGTERM to a backend's process group. Already-dead processes are ignored.
///
/// Returns true if a signal was delivered.
pub fn terminate(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        let pid = pid as libc::pid_t;
        // Negative pid addresses the whole group created by process_group(0)
        let group = unsafe { libc::kill(-pid, libc::SIGTERM) };
        if group == 0 {
            debug!(pid, "Sent SIGTERM to backend process group");
            return true;
        }
        let single = unsafe { libc::kill(pid, libc::SIGTERM) };
        if single == 0 {
            debug!(pid, "Sent SIGTERM to backend process");
            return true;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, error = %err, "Failed to signal backend");
        }
        false
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}
