//! Download orchestration
//!
//! Drives one model from "requested" to a verified directory: take the lock,
//! list the repository, write the manifest, transfer while a monitor task
//! samples the directory, fetch components, then verify.

use super::lock::DownloadLock;
use super::progress::{DownloadSession, ProgressSnapshot};
use crate::config::DownloadConfig;
use crate::error::{ManagerError, ManagerResult};
use crate::metrics;
use crate::models::{
    HubClient, InstallManifest, LocalInventory, ModelDescriptor, RemoteFile, RepoIndex,
    Verification, model_dir_name, scan_directory, verify,
};
use dashmap::DashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Lifecycle of one download as seen by observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum DownloadState {
    Idle,
    Requested,
    InProgress,
    Completed,
    Failed(String),
    /// Partial data on disk and nobody transferring
    Interrupted,
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Requested => write!(f, "requested"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Outcome of a download run that reached verification
#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub state: DownloadState,
    pub verification: Verification,
    pub snapshot: ProgressSnapshot,
}

pub struct DownloadOrchestrator {
    hub: Arc<dyn HubClient>,
    models_dir: PathBuf,
    settings: DownloadConfig,
    /// Latest snapshot per model for in-process observers
    progress: Arc<DashMap<String, ProgressSnapshot>>,
    /// Requested/finished states of runs started by this process
    states: DashMap<String, DownloadState>,
}

impl DownloadOrchestrator {
    pub fn new(hub: Arc<dyn HubClient>, models_dir: PathBuf, settings: DownloadConfig) -> Self {
        Self {
            hub,
            models_dir,
            settings,
            progress: Arc::new(DashMap::new()),
            states: DashMap::new(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.models_dir.join(".locks")
    }

    pub fn model_dir(&self, name: &str) -> PathBuf {
        self.models_dir.join(model_dir_name(name))
    }

    fn stale_after(&self) -> Duration {
        Duration::from_secs(self.settings.stale_lock_secs)
    }

    /// Take the download lock for `name` outside of a run
    pub fn lock(&self, name: &str) -> ManagerResult<DownloadLock> {
        DownloadLock::acquire(&self.locks_dir(), name, self.stale_after())
    }

    /// Download, or resume, everything `descriptor` needs
    ///
    /// Fails fast with [`ManagerError::DownloadInProgress`] when another live
    /// process holds the lock. Hub and transfer failures are returned as
    /// classified errors; a run that reaches verification returns a report
    /// whose state is `Completed` or `Failed`.
    pub async fn run(&self, descriptor: &ModelDescriptor, force: bool) -> ManagerResult<DownloadReport> {
        let name = descriptor.name.clone();
        self.states.insert(name.clone(), DownloadState::Requested);

        let result = self.run_locked(descriptor, force).await;
        if matches!(result, Err(ManagerError::DownloadInProgress { .. })) {
            self.states.remove(&name);
            return result;
        }

        let state = match &result {
            Ok(report) => report.state.clone(),
            Err(e) => DownloadState::Failed(e.to_string()),
        };

        match &state {
            DownloadState::Completed => metrics::record_download_completed(&name),
            DownloadState::Failed(reason) => {
                tracing::error!(model = %name, reason = %reason, "Download failed");
                metrics::record_download_failed(&name);
            }
            _ => {}
        }
        self.states.insert(name, state);
        result
    }

    async fn run_locked(&self, descriptor: &ModelDescriptor, force: bool) -> ManagerResult<DownloadReport> {
        let name = descriptor.name.as_str();
        let lock = DownloadLock::acquire(&self.locks_dir(), name, self.stale_after())?;
        let dir = self.model_dir(name);

        if force && dir.exists() {
            tracing::info!(model = %name, path = %dir.display(), "Force requested, removing existing files");
            tokio::fs::remove_dir_all(&dir).await?;
        }

        let index = self.hub.list_files(&descriptor.repo_id).await?;
        let mut manifest = InstallManifest::new(descriptor, &index);
        manifest.save(&dir)?;

        tracing::info!(
            model = %name,
            repo_id = %descriptor.repo_id,
            files = index.files.len(),
            expected_bytes = index.total_size(),
            path = %dir.display(),
            "Starting download"
        );
        metrics::record_download_started(name);

        let expected = if index.has_size_info() {
            Some(index.total_size())
        } else {
            descriptor.declared_disk_bytes()
        };
        let session = Arc::new(Mutex::new(DownloadSession::new(
            expected,
            self.settings.history_len,
        )));
        let lock = Arc::new(Mutex::new(lock));
        let monitor = self.spawn_monitor(name, &dir, session.clone(), lock.clone());

        let transfer = self.transfer(descriptor, &dir, &index, &mut manifest).await;
        monitor.abort();
        // Wait for the task to drop its lock and session handles
        let _ = monitor.await;
        transfer?;

        let inventory = scan(&dir).await?;
        let snapshot = session
            .lock()
            .await
            .record_inventory(Instant::now(), &inventory);
        self.progress.insert(name.to_string(), snapshot.clone());

        let verification = verify(
            Some(&manifest.expected_index()),
            &inventory,
            descriptor.model_type.required_structure(),
        );

        let state = match &verification {
            Verification::Complete => DownloadState::Completed,
            Verification::Indeterminate => {
                tracing::warn!(model = %name, "No size info or structure to verify against; accepting download");
                DownloadState::Completed
            }
            other => DownloadState::Failed(format!("integrity check: {}", other.summary())),
        };

        if state == DownloadState::Completed {
            manifest.mark_completed();
            manifest.save(&dir)?;
            tracing::info!(
                model = %name,
                bytes = snapshot.downloaded_bytes,
                elapsed_secs = snapshot.elapsed.as_secs(),
                "Download completed"
            );
        }

        drop(lock);
        Ok(DownloadReport {
            state,
            verification,
            snapshot,
        })
    }

    async fn transfer(
        &self,
        descriptor: &ModelDescriptor,
        dir: &Path,
        index: &RepoIndex,
        manifest: &mut InstallManifest,
    ) -> ManagerResult<()> {
        if index.files.is_empty() {
            // No listing to work from; verification falls back to structure
            tracing::warn!(
                model = %descriptor.name,
                repo_id = %descriptor.repo_id,
                "Repository index is empty, fetching a snapshot without size metadata"
            );
            let fetched = self
                .hub
                .download_snapshot(&descriptor.repo_id, dir)
                .await
                .map_err(|e| classify_transfer(&descriptor.name, e.into()))?;
            if fetched.is_empty() {
                return Err(ManagerError::TransferFailed {
                    name: descriptor.name.clone(),
                    reason: format!("repository '{}' has no files", descriptor.repo_id),
                });
            }
            for path in fetched {
                manifest.expect_file(path, 0);
            }
        } else {
            self.hub
                .download(&descriptor.repo_id, dir, &index.remote_files())
                .await
                .map_err(|e| classify_transfer(&descriptor.name, e.into()))?;
        }

        for (key, component) in &descriptor.components {
            // Size is best effort; presence is still verified without it
            let size = match self.hub.list_files(&component.repo_id).await {
                Ok(index) => index.files.get(&component.weight_name).copied().unwrap_or(0),
                Err(e) => {
                    tracing::warn!(model = %descriptor.name, component = %key, error = %e, "Component size unavailable");
                    0
                }
            };

            let target = dir.join("components").join(key);
            let file = RemoteFile {
                path: component.weight_name.clone(),
                size,
            };
            tracing::info!(
                model = %descriptor.name,
                component = %key,
                repo_id = %component.repo_id,
                "Fetching component"
            );
            self.hub
                .download(&component.repo_id, &target, std::slice::from_ref(&file))
                .await
                .map_err(|e| classify_transfer(&descriptor.name, e.into()))?;

            manifest.expect_file(format!("components/{key}/{}", component.weight_name), size);
        }

        manifest.save(dir)?;
        Ok(())
    }

    fn spawn_monitor(
        &self,
        name: &str,
        dir: &Path,
        session: Arc<Mutex<DownloadSession>>,
        lock: Arc<Mutex<DownloadLock>>,
    ) -> JoinHandle<()> {
        let name = name.to_string();
        let dir = dir.to_path_buf();
        let progress = self.progress.clone();
        let period = Duration::from_secs(self.settings.progress_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;

                let inventory = match scan(&dir).await {
                    Ok(inventory) => inventory,
                    Err(e) => {
                        tracing::debug!(model = %name, error = %e, "Progress scan failed");
                        continue;
                    }
                };
                let snapshot = session.lock().await.record_inventory(Instant::now(), &inventory);

                tracing::info!(
                    model = %name,
                    bytes = snapshot.downloaded_bytes,
                    expected = ?snapshot.expected_bytes,
                    percent = ?snapshot.percent(),
                    throughput_bps = ?snapshot.throughput_bps,
                    eta_secs = ?snapshot.eta.map(|d| d.as_secs()),
                    partial_files = snapshot.partial_files,
                    "Download progress"
                );
                metrics::update_downloaded_bytes(&name, snapshot.downloaded_bytes);
                progress.insert(name.clone(), snapshot);

                if let Err(e) = lock.lock().await.heartbeat() {
                    tracing::warn!(model = %name, error = %e, "Failed to refresh download lock");
                }
            }
        })
    }

    /// Download state of `name`, as visible from any process
    pub fn observe(&self, name: &str) -> DownloadState {
        if let Some(state) = self.states.get(name)
            && *state == DownloadState::Requested
        {
            return DownloadState::Requested;
        }

        if DownloadLock::holder(&self.locks_dir(), name, self.stale_after()).is_some() {
            return DownloadState::InProgress;
        }

        // A run of ours that failed stays failed until retried
        if let Some(state) = self.states.get(name)
            && matches!(*state, DownloadState::Failed(_))
        {
            return state.value().clone();
        }

        let dir = self.model_dir(name);
        let has_partials = scan_directory(&dir).is_ok_and(|inventory| inventory.has_partials());
        let unfinished = InstallManifest::load(&dir).is_some_and(|m| !m.is_completed());
        if has_partials || unfinished {
            return DownloadState::Interrupted;
        }

        match self.states.get(name) {
            Some(state) => state.clone(),
            None => DownloadState::Idle,
        }
    }

    /// Latest snapshot published by a run in this process
    pub fn progress(&self, name: &str) -> Option<ProgressSnapshot> {
        self.progress.get(name).map(|s| s.value().clone())
    }

    /// Sample a download from outside: two scans `window` apart
    pub async fn sample_progress(&self, name: &str, window: Duration) -> ManagerResult<ProgressSnapshot> {
        let dir = self.model_dir(name);
        let expected = InstallManifest::load(&dir)
            .map(|m| m.expected_index())
            .filter(|index| index.has_size_info())
            .map(|index| index.total_size());

        let mut session = DownloadSession::new(expected, 2);
        let first = scan(&dir).await?;
        session.record_inventory(Instant::now(), &first);

        tokio::time::sleep(window).await;
        let second = scan(&dir).await?;
        Ok(session.record_inventory(Instant::now(), &second))
    }
}

/// A transfer that died partway leaves resumable state behind
fn classify_transfer(name: &str, err: ManagerError) -> ManagerError {
    match err {
        ManagerError::TransferFailed { name: path, reason } => ManagerError::TransferFailed {
            name: name.to_string(),
            reason: format!("{path}: {reason}"),
        },
        other => other,
    }
}

async fn scan(dir: &Path) -> ManagerResult<LocalInventory> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || scan_directory(&dir))
        .await
        .map_err(|e| ManagerError::Io(std::io::Error::other(e)))?
        .map_err(ManagerError::from)
}
