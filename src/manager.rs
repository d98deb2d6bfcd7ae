//! Preview provisioning workflow
//!
//! [`PreviewManager`] drives a preview through its lifecycle: materialize the
//! directory, install dependencies, reserve a port, spawn the dev server,
//! probe it, and later patch, redeploy, reap or delete it. All multi-step
//! sequences for one id run under that id's lock from the registry.

use crate::config::{Config, PreviewDefaults};
use crate::deploy::Deployer;
use crate::error::{PreviewError, PreviewResult};
use crate::ports::PortAllocator;
use crate::probe;
use crate::registry::{ExitOutcome, PreviewRegistry, PreviewSnapshot, PreviewStatus, Route};
use crate::supervisor::{self, ExitEvent, ProcessHandle, Supervisor, ERROR_LOG_TAIL};
use crate::workspace::{validate_id, validate_relative_path, FileEntry, Workspace};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Poll interval while waiting for backends to exit at shutdown
const SHUTDOWN_POLL_INTERVAL_MS: u64 = 50;

fn default_wait() -> bool {
    true
}

/// Body of a create/patch request
#[derive(Debug, Clone, Deserialize)]
pub struct UpsertRequest {
    pub id: String,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    /// Block until the backend answers its readiness probe
    #[serde(default = "default_wait")]
    pub wait: bool,
}

/// Result of a create, patch or deploy
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertOutcome {
    pub id: String,
    pub url: String,
    pub status: PreviewStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_url: Option<String>,
    /// Whether a new preview directory was created
    #[serde(skip)]
    pub created: bool,
}

/// Live previews plus ids that only exist on disk
#[derive(Debug, Clone, Serialize)]
pub struct PreviewList {
    pub previews: Vec<PreviewSnapshot>,
    pub resumable: Vec<String>,
}

/// Where the gateway should send traffic for a preview
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Proxy to the local backend on this port
    Backend(u16),
    /// Redirect to an external deployment
    Redirect(String),
}

/// Owns the registry and the collaborators that act on previews.
///
/// Constructed with [`PreviewManager::new`], which returns `Arc<Self>` and
/// spawns the task consuming backend exit events, so it must be called from
/// within a Tokio runtime.
pub struct PreviewManager {
    registry: PreviewRegistry,
    supervisor: Supervisor,
    workspace: Workspace,
    deployer: Deployer,
    defaults: PreviewDefaults,
    public_url: String,
}

impl PreviewManager {
    pub fn new(config: &Config) -> PreviewResult<Arc<Self>> {
        let defaults = config.previews.clone();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            registry: PreviewRegistry::new(
                PortAllocator::new(defaults.base_port, defaults.port_window),
                defaults.log_capacity,
            ),
            supervisor: Supervisor::new(&defaults.dev_command, defaults.env.clone(), exit_tx)?,
            workspace: Workspace::new(&defaults),
            deployer: Deployer::new(config.deploy.clone()),
            public_url: config.server.public_url(),
            defaults,
        });

        Self::spawn_exit_loop(Arc::downgrade(&manager), exit_rx);
        Ok(manager)
    }

    fn spawn_exit_loop(manager: Weak<Self>, mut exit_rx: mpsc::UnboundedReceiver<ExitEvent>) {
        tokio::spawn(async move {
            while let Some(event) = exit_rx.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.on_exit(&event);
            }
            debug!("Exit event loop finished");
        });
    }

    fn on_exit(&self, event: &ExitEvent) {
        match self.registry.handle_exit(event) {
            ExitOutcome::Crashed => warn!(
                id = %event.id,
                generation = event.generation,
                reason = %event.describe(),
                "Preview backend crashed, next request will restart it"
            ),
            ExitOutcome::LingeringExited => info!(
                id = %event.id,
                generation = event.generation,
                "Detached backend exited, port released"
            ),
            ExitOutcome::Stale => debug!(
                id = %event.id,
                generation = event.generation,
                "Ignoring exit of replaced backend"
            ),
        }
    }

    pub fn registry(&self) -> &PreviewRegistry {
        &self.registry
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn defaults(&self) -> &PreviewDefaults {
        &self.defaults
    }

    /// Public URL of a preview
    pub fn preview_url(&self, id: &str) -> String {
        format!("{}{}", self.public_url, supervisor::base_path(id))
    }

    fn outcome(&self, id: &str, status: PreviewStatus, port: Option<u16>, created: bool) -> UpsertOutcome {
        UpsertOutcome {
            id: id.to_string(),
            url: self.preview_url(id),
            status,
            port,
            deployment_url: None,
            created,
        }
    }

    /// Record a failure as the preview's last error and pass it on
    fn fail<T>(&self, id: &str, err: PreviewError) -> PreviewResult<T> {
        self.registry.record_error(id, err.to_string());
        Err(err)
    }

    /// Create a preview, or patch the files of an existing one.
    ///
    /// Patching a live preview writes files and refreshes its idle clock; the
    /// dev server picks the change up itself, so nothing is respawned. Patching
    /// a deployed preview re-runs its deployment.
    pub async fn upsert(self: &Arc<Self>, request: UpsertRequest) -> PreviewResult<UpsertOutcome> {
        let id = request.id.as_str();
        validate_id(id)?;
        for file in &request.files {
            validate_relative_path(&file.path)?;
        }

        let _guard = self.registry.lock(id).await;
        let directory = self.defaults.preview_dir(id);

        if let Some(route) = self.registry.route(id) {
            let written = match self.workspace.write_files(&directory, &request.files).await {
                Ok(written) => written,
                Err(e) => return self.fail(id, e),
            };
            self.registry.touch(id);

            if route.status == PreviewStatus::Deployed {
                let platform = self
                    .registry
                    .get(id)
                    .and_then(|r| r.external_platform)
                    .ok_or_else(|| PreviewError::DeployFailed("deployed preview has no platform".into()))?;
                return self.deploy_locked(id, &directory, &platform).await;
            }

            info!(id, files = written, status = ?route.status, "Patched preview files");
            return Ok(self.outcome(id, route.status, route.port, false));
        }

        let created = !directory.is_dir();
        if created {
            if let Err(e) = self.workspace.materialize(id, &directory).await {
                return self.fail(id, e);
            }
        }
        let written = match self.workspace.write_files(&directory, &request.files).await {
            Ok(written) => written,
            Err(e) => return self.fail(id, e),
        };
        info!(id, files = written, created, "Provisioning preview");

        let (status, port) = self.start_locked(id, &directory, request.wait).await?;
        Ok(self.outcome(id, status, Some(port), created))
    }

    /// Start a backend for `id`. The caller holds the id lock and has checked
    /// that no record exists.
    async fn start_locked(
        self: &Arc<Self>,
        id: &str,
        directory: &Path,
        wait: bool,
    ) -> PreviewResult<(PreviewStatus, u16)> {
        let logs = self.registry.logs_for(id);

        let adopted = self
            .registry
            .adopt_lingering(id, directory)
            .and_then(|(port, _)| self.registry.get(id)?.process.map(|p| (port, p)));

        let (port, handle) = match adopted {
            Some(adopted) => adopted,
            None => {
                if let Err(e) = self.workspace.ensure_installed(id, directory, &logs).await {
                    return self.fail(id, e);
                }

                let (port, generation) = match self.registry.register_starting(id, directory) {
                    Ok(reserved) => reserved,
                    Err(e) => return self.fail(id, e),
                };

                match self
                    .supervisor
                    .spawn(id, directory, port, generation, Arc::clone(&logs))
                    .await
                {
                    Ok(handle) => {
                        self.registry.attach_process(id, handle.clone());
                        (port, handle)
                    }
                    Err(e) => {
                        error!(id, port, error = %e, "Failed to start preview backend");
                        self.registry.remove(id);
                        return self.fail(id, e);
                    }
                }
            }
        };

        if !wait {
            let manager = Arc::clone(self);
            let id = id.to_string();
            tokio::spawn(async move {
                if let Err(e) = manager.await_ready(&id, port, &handle).await {
                    warn!(id = %id, error = %e, "Background readiness check failed");
                }
            });
            return Ok((PreviewStatus::Starting, port));
        }

        self.await_ready(id, port, &handle).await?;
        Ok((PreviewStatus::Running, port))
    }

    /// Probe a starting backend and settle its record.
    ///
    /// Ready: the record becomes `Running`. Exit during startup: the record is
    /// marked crashed. Deadline: the record is removed but the process keeps
    /// running detached, holding its port, so a later start can adopt it.
    async fn await_ready(&self, id: &str, port: u16, handle: &ProcessHandle) -> PreviewResult<()> {
        let timeout = self.defaults.startup_timeout();
        let config = self.defaults.probe_config(timeout);
        let logs = self.registry.logs_for(id);

        let ready = tokio::select! {
            ready = probe::wait_ready(port, &config) => ready,
            _ = handle.wait_exit() => {
                let message = format!("backend exited during startup\n{}", logs.tail(ERROR_LOG_TAIL));
                self.registry.mark_crashed(id, handle.generation, "backend exited during startup");
                warn!(id, port, pid = handle.pid, "Preview backend exited before becoming ready");
                return Err(PreviewError::ProcessCrash(message));
            }
        };

        if ready {
            if !self.registry.mark_running(id, handle.generation) {
                debug!(id, generation = handle.generation, "Record changed while probing");
            }
            return Ok(());
        }

        self.registry.detach(id, handle.generation);
        let err = PreviewError::ReadinessTimeout {
            timeout_secs: timeout.as_secs(),
            logs: logs.tail(ERROR_LOG_TAIL),
        };
        warn!(id, port, pid = handle.pid, timeout_secs = timeout.as_secs(), "Preview backend missed readiness deadline");
        self.fail(id, err)
    }

    fn fast_route(&self, id: &str) -> Option<Target> {
        let route = self.registry.route(id)?;
        let target = match route {
            Route { status: PreviewStatus::Running, port: Some(port), .. } => Target::Backend(port),
            Route { status: PreviewStatus::Deployed, deployment_url: Some(url), .. } => Target::Redirect(url),
            _ => return None,
        };
        self.registry.touch(id);
        Some(target)
    }

    /// Resolve where gateway traffic for `id` goes, restarting the preview
    /// from its directory when no backend is live.
    pub async fn resolve(self: &Arc<Self>, id: &str) -> PreviewResult<Target> {
        validate_id(id).map_err(|_| PreviewError::NotFound(id.to_string()))?;

        if let Some(target) = self.fast_route(id) {
            return Ok(target);
        }

        let guard = self.registry.lock(id).await;
        if let Some(target) = self.fast_route(id) {
            return Ok(target);
        }

        if let Some(record) = self.registry.get(id) {
            drop(guard);
            let (Some(port), Some(handle)) = (record.port, record.process) else {
                return Err(PreviewError::Provisioning(format!("preview '{}' is not ready", id)));
            };
            self.await_ready(id, port, &handle).await?;
            self.registry.touch(id);
            return Ok(Target::Backend(port));
        }

        let directory = self.defaults.preview_dir(id);
        if !directory.is_dir() {
            return Err(PreviewError::NotFound(id.to_string()));
        }

        info!(id, "Restarting preview on demand");
        let (_, port) = self.start_locked(id, &directory, true).await?;
        Ok(Target::Backend(port))
    }

    /// Stop and forget a preview, deleting its directory. Unknown ids succeed.
    pub async fn delete(&self, id: &str) -> PreviewResult<bool> {
        validate_id(id)?;
        let _guard = self.registry.lock(id).await;

        let mut stopped = false;
        if let Some(record) = self.registry.remove(id) {
            if let Some(process) = record.process {
                supervisor::terminate(process.pid);
                stopped = true;
            }
        }
        if let Some(lingering) = self.registry.take_lingering(id) {
            supervisor::terminate(lingering.handle.pid);
            stopped = true;
        }

        let removed = self.workspace.remove(&self.defaults.preview_dir(id)).await?;
        self.registry.forget(id);

        info!(id, stopped, removed, "Deleted preview");
        Ok(stopped || removed)
    }

    /// Publish a preview to an external platform and route traffic there
    pub async fn deploy(&self, id: &str, platform: &str) -> PreviewResult<UpsertOutcome> {
        validate_id(id)?;
        if !self.deployer.has_platform(platform) {
            return Err(PreviewError::InvalidRequest(format!(
                "unknown deploy platform '{}', configured: {:?}",
                platform,
                self.deployer.platforms()
            )));
        }

        let _guard = self.registry.lock(id).await;
        let directory = self.defaults.preview_dir(id);
        if !directory.is_dir() {
            return Err(PreviewError::NotFound(id.to_string()));
        }

        self.deploy_locked(id, &directory, platform).await
    }

    async fn deploy_locked(&self, id: &str, directory: &Path, platform: &str) -> PreviewResult<UpsertOutcome> {
        let logs = self.registry.logs_for(id);
        let url = match self.deployer.deploy(platform, id, directory, &logs).await {
            Ok(url) => url,
            Err(e) => return self.fail(id, e),
        };

        // The local backend is no longer needed once traffic is redirected
        if let Some(previous) = self.registry.set_deployed(id, directory, platform, &url) {
            if let Some(process) = previous.process {
                supervisor::terminate(process.pid);
            }
        }
        if let Some(lingering) = self.registry.take_lingering(id) {
            supervisor::terminate(lingering.handle.pid);
        }

        let mut outcome = self.outcome(id, PreviewStatus::Deployed, None, false);
        outcome.deployment_url = Some(url);
        Ok(outcome)
    }

    pub fn status(&self, id: &str) -> Option<PreviewSnapshot> {
        self.registry.snapshot(id)
    }

    pub fn logs(&self, id: &str) -> Option<String> {
        self.registry.logs(id)
    }

    /// Live previews, plus directories on disk that would restart on their next request
    pub async fn list(&self) -> PreviewResult<PreviewList> {
        let previews = self.registry.snapshots();
        let resumable = self
            .workspace
            .discover()
            .await?
            .into_iter()
            .filter(|id| !self.registry.contains(id))
            .collect();
        Ok(PreviewList { previews, resumable })
    }

    /// Stop backends idle longer than the configured threshold. Directories are kept.
    ///
    /// Returns the number of backends terminated.
    pub fn reap_idle(&self) -> usize {
        let threshold = self.defaults.idle_timeout();
        let mut reaped = 0;

        for id in self.registry.idle_ids(threshold) {
            // A busy id is being provisioned or patched, so it is not idle
            let Some(_guard) = self.registry.try_lock(&id) else {
                continue;
            };
            if let Some(record) = self.registry.remove_if_idle(&id, threshold) {
                let idle_secs = record.last_hit.elapsed().as_secs();
                if let Some(process) = record.process {
                    supervisor::terminate(process.pid);
                }
                info!(id = %id, idle_secs, port = ?record.port, "Reaped idle preview");
                reaped += 1;
            }
        }

        for (id, lingering) in self.registry.take_expired_lingering(threshold) {
            supervisor::terminate(lingering.handle.pid);
            info!(id = %id, port = lingering.port, "Reaped detached backend");
            reaped += 1;
        }

        reaped
    }

    /// Terminate every backend and wait up to the grace period for them to exit
    pub async fn stop_all(&self) {
        let processes = self.registry.drain_processes();
        if processes.is_empty() {
            return;
        }

        info!(count = processes.len(), "Stopping all preview backends");
        for (id, process) in &processes {
            debug!(id = %id, pid = process.pid, "Terminating backend");
            supervisor::terminate(process.pid);
        }

        let grace = self.defaults.shutdown_grace_period();
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if processes.iter().all(|(_, p)| p.has_exited()) {
                info!("All preview backends stopped");
                return;
            }
            tokio::time::sleep(Duration::from_millis(SHUTDOWN_POLL_INTERVAL_MS)).await;
        }

        let remaining: Vec<&str> = processes
            .iter()
            .filter(|(_, p)| !p.has_exited())
            .map(|(id, _)| id.as_str())
            .collect();
        warn!(?remaining, grace_secs = grace.as_secs(), "Backends still running after grace period");
    }
}
