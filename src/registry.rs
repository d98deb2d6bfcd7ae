//! In-memory preview registry
//!
//! The registry is the single owner of preview records. Every mutation is a
//! short, lock-scoped operation that never awaits, so readers (the gateway hot
//! path, the management API) never wait behind provisioning. Work that spans
//! awaits, such as install, spawn and readiness probing, is serialized per id
//! with [`PreviewRegistry::lock`] instead.
//!
//! Port reservations are the ports of all records plus the ports held by
//! lingering processes: backends that missed their readiness deadline but may
//! still come up and are adopted by the next start of the same id.

use crate::error::{PreviewError, PreviewResult};
use crate::logs::LogBuffer;
use crate::ports::PortAllocator;
use crate::supervisor::{ExitEvent, ProcessHandle};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

/// Lifecycle state of a preview
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewStatus {
    /// Backend spawned, waiting for readiness
    Starting,
    /// Backend answered the readiness probe
    Running,
    /// Backend exited unexpectedly
    Crashed,
    /// Served from an external deployment; no local backend
    Deployed,
}

/// Registry entry for a preview
#[derive(Debug, Clone)]
pub struct PreviewRecord {
    pub id: String,
    pub status: PreviewStatus,
    /// Private port, present while a local backend is assigned
    pub port: Option<u16>,
    pub directory: PathBuf,
    pub process: Option<ProcessHandle>,
    pub created_at: DateTime<Utc>,
    /// Last time traffic or an update touched this preview
    pub last_hit: Instant,
    pub external_platform: Option<String>,
    pub deployment_url: Option<String>,
}

/// Backend that missed its readiness deadline and was detached from its record
#[derive(Debug, Clone)]
pub struct LingeringProcess {
    pub handle: ProcessHandle,
    pub port: u16,
    pub since: Instant,
}

/// What the gateway needs to route a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub status: PreviewStatus,
    pub port: Option<u16>,
    pub generation: Option<u64>,
    pub deployment_url: Option<String>,
}

/// Result of applying an exit event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The live backend of a record crashed; the record was removed
    Crashed,
    /// A lingering backend exited; its port was released
    LingeringExited,
    /// The event belongs to a backend that was already replaced or stopped
    Stale,
}

/// Serializable view of a preview
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewSnapshot {
    pub id: String,
    pub status: PreviewStatus,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub directory: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(rename = "lastHit", skip_serializing_if = "Option::is_none")]
    pub last_hit_at: Option<DateTime<Utc>>,
    pub idle_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_url: Option<String>,
}

/// State that outlives a record: output and the last failure
#[derive(Debug)]
struct History {
    logs: Arc<LogBuffer>,
    directory: Option<PathBuf>,
    last_error: Option<String>,
    crashed: bool,
}

pub struct PreviewRegistry {
    records: DashMap<String, PreviewRecord>,
    history: DashMap<String, History>,
    /// Guards port selection together with record and lingering inserts
    allocator: Mutex<PortAllocator>,
    lingering: Mutex<HashMap<String, LingeringProcess>>,
    /// Per-id provisioning locks. Entries are never removed so two holders
    /// can never exist for the same id.
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    next_generation: AtomicU64,
    log_capacity: usize,
}

impl PreviewRegistry {
    pub fn new(allocator: PortAllocator, log_capacity: usize) -> Self {
        Self {
            records: DashMap::new(),
            history: DashMap::new(),
            allocator: Mutex::new(allocator),
            lingering: Mutex::new(HashMap::new()),
            locks: DashMap::new(),
            next_generation: AtomicU64::new(1),
            log_capacity,
        }
    }

    fn id_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Serialize provisioning work for one id
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        self.id_lock(id).lock_owned().await
    }

    /// Like [`lock`](Self::lock), but gives up if the id is busy
    pub fn try_lock(&self, id: &str) -> Option<OwnedMutexGuard<()>> {
        self.id_lock(id).try_lock_owned().ok()
    }

    /// Output buffer for `id`, created on first use and kept across restarts
    pub fn logs_for(&self, id: &str) -> Arc<LogBuffer> {
        self.history
            .entry(id.to_string())
            .or_insert_with(|| History {
                logs: Arc::new(LogBuffer::new(self.log_capacity)),
                directory: None,
                last_error: None,
                crashed: false,
            })
            .logs
            .clone()
    }

    /// Output retained for `id`, whether or not a record exists
    pub fn logs(&self, id: &str) -> Option<String> {
        self.history.get(id).map(|h| h.logs.contents())
    }

    pub fn record_error(&self, id: &str, message: impl Into<String>) {
        let message = message.into();
        self.logs_for(id);
        if let Some(mut history) = self.history.get_mut(id) {
            history.last_error = Some(message);
        }
    }

    pub fn last_error(&self, id: &str) -> Option<String> {
        self.history.get(id).and_then(|h| h.last_error.clone())
    }

    /// Drop everything known about `id` except its provisioning lock
    pub fn forget(&self, id: &str) {
        self.history.remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<PreviewRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    pub fn route(&self, id: &str) -> Option<Route> {
        self.records.get(id).map(|r| Route {
            status: r.status,
            port: r.port,
            generation: r.process.as_ref().map(|p| p.generation),
            deployment_url: r.deployment_url.clone(),
        })
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    fn reserved_ports(&self, lingering: &HashMap<String, LingeringProcess>) -> HashSet<u16> {
        self.records
            .iter()
            .filter_map(|r| r.port)
            .chain(lingering.values().map(|l| l.port))
            .collect()
    }

    /// Ports held by records or lingering backends
    pub fn ports_in_use(&self) -> HashSet<u16> {
        let lingering = self.lingering.lock();
        self.reserved_ports(&lingering)
    }

    /// Reserve a port and insert a `Starting` record in one step.
    ///
    /// Returns the port and the generation the spawned process must carry.
    pub fn register_starting(&self, id: &str, directory: &Path) -> PreviewResult<(u16, u64)> {
        let mut allocator = self.allocator.lock();
        let lingering = self.lingering.lock();

        if self.records.contains_key(id) {
            return Err(PreviewError::Provisioning(format!(
                "preview '{}' is already registered",
                id
            )));
        }

        let in_use = self.reserved_ports(&lingering);
        let port = allocator.allocate(&in_use)?;
        let generation = self.next_generation();

        self.records.insert(
            id.to_string(),
            PreviewRecord {
                id: id.to_string(),
                status: PreviewStatus::Starting,
                port: Some(port),
                directory: directory.to_path_buf(),
                process: None,
                created_at: Utc::now(),
                last_hit: Instant::now(),
                external_platform: None,
                deployment_url: None,
            },
        );
        drop(lingering);
        drop(allocator);

        self.reset_history(id, directory);
        debug!(id, port, generation, "Registered starting preview");
        Ok((port, generation))
    }

    /// Re-create a `Starting` record around a lingering backend, if one exists
    pub fn adopt_lingering(&self, id: &str, directory: &Path) -> Option<(u16, u64)> {
        let _allocator = self.allocator.lock();
        let mut lingering = self.lingering.lock();

        if self.records.contains_key(id) {
            return None;
        }
        let adopted = lingering.remove(id)?;
        if adopted.handle.has_exited() {
            debug!(id, port = adopted.port, "Lingering backend already exited");
            return None;
        }

        let port = adopted.port;
        let generation = adopted.handle.generation;
        self.records.insert(
            id.to_string(),
            PreviewRecord {
                id: id.to_string(),
                status: PreviewStatus::Starting,
                port: Some(port),
                directory: directory.to_path_buf(),
                process: Some(adopted.handle),
                created_at: Utc::now(),
                last_hit: Instant::now(),
                external_platform: None,
                deployment_url: None,
            },
        );
        drop(lingering);

        self.reset_history(id, directory);
        info!(id, port, generation, "Adopted lingering backend");
        Some((port, generation))
    }

    fn reset_history(&self, id: &str, directory: &Path) {
        self.logs_for(id);
        if let Some(mut history) = self.history.get_mut(id) {
            history.directory = Some(directory.to_path_buf());
            history.crashed = false;
        }
    }

    pub fn attach_process(&self, id: &str, handle: ProcessHandle) -> bool {
        match self.records.get_mut(id) {
            Some(mut record) => {
                record.process = Some(handle);
                true
            }
            None => false,
        }
    }

    /// `Starting -> Running`, only for the process generation that was probed
    pub fn mark_running(&self, id: &str, generation: u64) -> bool {
        let Some(mut record) = self.records.get_mut(id) else {
            return false;
        };
        let current = record.process.as_ref().map(|p| p.generation);
        if record.status != PreviewStatus::Starting || current != Some(generation) {
            return false;
        }
        record.status = PreviewStatus::Running;
        record.last_hit = Instant::now();
        info!(id, port = ?record.port, generation, "Preview is running");
        drop(record);

        if let Some(mut history) = self.history.get_mut(id) {
            history.last_error = None;
        }
        true
    }

    /// Refresh the idle clock
    pub fn touch(&self, id: &str) -> bool {
        match self.records.get_mut(id) {
            Some(mut record) => {
                record.last_hit = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove a record, releasing its port
    pub fn remove(&self, id: &str) -> Option<PreviewRecord> {
        self.records.remove(id).map(|(_, record)| record)
    }

    /// Remove a running record that has been idle longer than `threshold`
    pub fn remove_if_idle(&self, id: &str, threshold: Duration) -> Option<PreviewRecord> {
        self.records
            .remove_if(id, |_, r| is_reapable(r, threshold))
            .map(|(_, record)| record)
    }

    /// Ids of local previews idle longer than `threshold`
    pub fn idle_ids(&self, threshold: Duration) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| is_reapable(r.value(), threshold))
            .map(|r| r.key().clone())
            .collect()
    }

    /// Move the record's backend to the lingering set and remove the record.
    ///
    /// Used when a backend misses its readiness deadline: the port stays
    /// reserved until the backend exits, is adopted, or is reaped.
    pub fn detach(&self, id: &str, generation: u64) -> Option<PreviewRecord> {
        let _allocator = self.allocator.lock();
        let mut lingering = self.lingering.lock();

        let (_, record) = self.records.remove_if(id, |_, r| {
            r.process.as_ref().map(|p| p.generation) == Some(generation)
        })?;

        if let (Some(handle), Some(port)) = (record.process.clone(), record.port) {
            if !handle.has_exited() {
                info!(id, port, pid = handle.pid, "Detached backend that missed readiness deadline");
                lingering.insert(
                    id.to_string(),
                    LingeringProcess {
                        handle,
                        port,
                        since: Instant::now(),
                    },
                );
            }
        }
        Some(record)
    }

    pub fn take_lingering(&self, id: &str) -> Option<LingeringProcess> {
        self.lingering.lock().remove(id)
    }

    pub fn lingering_ids(&self) -> Vec<String> {
        self.lingering.lock().keys().cloned().collect()
    }

    /// Remove lingering backends detached longer ago than `threshold`
    pub fn take_expired_lingering(&self, threshold: Duration) -> Vec<(String, LingeringProcess)> {
        let mut lingering = self.lingering.lock();
        let expired: Vec<String> = lingering
            .iter()
            .filter(|(_, l)| l.since.elapsed() > threshold)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| lingering.remove(&id).map(|l| (id, l)))
            .collect()
    }

    /// Remove the record if its process has `generation`, remembering it as crashed
    pub fn mark_crashed(&self, id: &str, generation: u64, reason: impl Into<String>) -> bool {
        let removed = self.records.remove_if(id, |_, r| {
            r.process.as_ref().map(|p| p.generation) == Some(generation)
        });
        let Some((_, record)) = removed else {
            return false;
        };

        if let Some(mut history) = self.history.get_mut(id) {
            history.last_error = Some(reason.into());
            history.crashed = true;
            history.directory = Some(record.directory);
        }
        true
    }

    /// Apply an exit event. Events whose generation no longer matches are ignored.
    pub fn handle_exit(&self, event: &ExitEvent) -> ExitOutcome {
        if self.mark_crashed(&event.id, event.generation, event.describe()) {
            return ExitOutcome::Crashed;
        }

        let mut lingering = self.lingering.lock();
        let matches = lingering
            .get(&event.id)
            .is_some_and(|l| l.handle.generation == event.generation);
        if matches {
            lingering.remove(&event.id);
            return ExitOutcome::LingeringExited;
        }

        ExitOutcome::Stale
    }

    /// Replace any record for `id` with a `Deployed` record. Returns the displaced record.
    pub fn set_deployed(
        &self,
        id: &str,
        directory: &Path,
        platform: &str,
        url: &str,
    ) -> Option<PreviewRecord> {
        let created_at = self.records.get(id).map(|r| r.created_at).unwrap_or_else(Utc::now);
        let previous = self.records.insert(
            id.to_string(),
            PreviewRecord {
                id: id.to_string(),
                status: PreviewStatus::Deployed,
                port: None,
                directory: directory.to_path_buf(),
                process: None,
                created_at,
                last_hit: Instant::now(),
                external_platform: Some(platform.to_string()),
                deployment_url: Some(url.to_string()),
            },
        );
        self.reset_history(id, directory);
        if let Some(mut history) = self.history.get_mut(id) {
            history.last_error = None;
        }
        previous
    }

    fn snapshot_of(&self, record: &PreviewRecord) -> PreviewSnapshot {
        let idle = record.last_hit.elapsed();
        let last_hit_at = chrono::Duration::from_std(idle)
            .ok()
            .map(|elapsed| Utc::now() - elapsed);

        PreviewSnapshot {
            id: record.id.clone(),
            status: record.status,
            port: record.port,
            pid: record.process.as_ref().map(|p| p.pid),
            directory: record.directory.clone(),
            created_at: Some(record.created_at),
            last_hit_at,
            idle_secs: Some(idle.as_secs()),
            last_error: self.last_error(&record.id),
            external_platform: record.external_platform.clone(),
            deployment_url: record.deployment_url.clone(),
        }
    }

    /// Current view of `id`. A backend that crashed after its record was
    /// removed is still reported as `crashed` with the exit reason.
    pub fn snapshot(&self, id: &str) -> Option<PreviewSnapshot> {
        if let Some(record) = self.records.get(id) {
            return Some(self.snapshot_of(&record));
        }

        let history = self.history.get(id)?;
        if !history.crashed {
            return None;
        }
        Some(PreviewSnapshot {
            id: id.to_string(),
            status: PreviewStatus::Crashed,
            port: None,
            pid: None,
            directory: history.directory.clone().unwrap_or_default(),
            created_at: None,
            last_hit_at: None,
            idle_secs: None,
            last_error: history.last_error.clone(),
            external_platform: None,
            deployment_url: None,
        })
    }

    /// Snapshots of all records, sorted by id
    pub fn snapshots(&self) -> Vec<PreviewSnapshot> {
        let mut snapshots: Vec<PreviewSnapshot> =
            self.records.iter().map(|r| self.snapshot_of(r.value())).collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Remove every record and lingering backend, returning their processes
    pub fn drain_processes(&self) -> Vec<(String, ProcessHandle)> {
        let ids: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        let mut processes: Vec<(String, ProcessHandle)> = ids
            .into_iter()
            .filter_map(|id| self.records.remove(&id))
            .filter_map(|(id, record)| record.process.map(|p| (id, p)))
            .collect();
        processes.extend(
            self.lingering
                .lock()
                .drain()
                .map(|(id, lingering)| (id, lingering.handle)),
        );
        processes
    }
}

fn is_reapable(record: &PreviewRecord, threshold: Duration) -> bool {
    matches!(record.status, PreviewStatus::Running | PreviewStatus::Starting)
        && record.last_hit.elapsed() > threshold
}
