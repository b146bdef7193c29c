//! Model lifecycle manager
//!
//! Ties the registry, the download orchestrator and the inference engine into
//! one state machine per model:
//!
//! ```text
//! NotInstalled -> Downloading -> Incomplete | Installed -> Loaded
//!                                     (registry entry gone) -> InstalledUnconfigured
//! ```
//!
//! Installed-ness is always derived from what is on disk, never cached.

use crate::config::ManagerConfig;
use crate::download::{DownloadOrchestrator, DownloadReport, DownloadState, ProgressSnapshot};
use crate::engine::{EngineHandle, GeneratedImage, GenerationRequest, InferenceEngine};
use crate::error::{ManagerError, ManagerResult};
use crate::gpu;
use crate::metrics;
use crate::models::{
    HubClient, InstallManifest, LoadReport, ModelDescriptor, ModelRegistry, ModelType,
    RegistryTier, Verification, model_dir_name, scan_directory, verify,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, RwLock, watch};

/// Lifecycle state of one model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    NotInstalled,
    Incomplete,
    Downloading,
    /// Complete on disk but no registry entry
    InstalledUnconfigured,
    Installed,
    Loaded,
}

impl ModelState {
    /// Status vocabulary shared with the CLI
    pub fn status_code(&self) -> &'static str {
        match self {
            Self::NotInstalled => "not_installed",
            Self::Incomplete => "incomplete",
            Self::Downloading => "downloading",
            Self::InstalledUnconfigured => "needs_config",
            Self::Installed | Self::Loaded => "ready",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Installed | Self::Loaded)
    }
}

impl std::fmt::Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.status_code())
    }
}

/// A model resident in the engine
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub name: String,
    pub handle: EngineHandle,
    pub loaded_at: DateTime<Utc>,
}

/// The single loaded-model slot
///
/// Injected into the manager rather than held globally. Callers that load,
/// unload or generate serialise on the inner mutex; readers of the current
/// name go through a watch channel and never wait behind a slow load.
pub struct LoadedSlot {
    model: Mutex<Option<LoadedModel>>,
    current: watch::Sender<Option<String>>,
}

impl LoadedSlot {
    pub fn new() -> Self {
        Self {
            model: Mutex::new(None),
            current: watch::Sender::new(None),
        }
    }

    pub fn current_name(&self) -> Option<String> {
        self.current.borrow().clone()
    }

    /// Receiver notified whenever the loaded model changes
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.current.subscribe()
    }

    async fn lock(&self) -> MutexGuard<'_, Option<LoadedModel>> {
        self.model.lock().await
    }

    fn publish(&self, loaded: &Option<LoadedModel>) {
        self.current
            .send_replace(loaded.as_ref().map(|m| m.name.clone()));
    }
}

impl Default for LoadedSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor plus derived on-disk facts
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub descriptor: ModelDescriptor,
    pub tier: RegistryTier,
    pub state: ModelState,
    pub path: PathBuf,
    pub size_on_disk: u64,
    /// Absent while downloading or when nothing is on disk
    pub verification: Option<Verification>,
}

pub struct ModelManager {
    registry: RwLock<ModelRegistry>,
    orchestrator: DownloadOrchestrator,
    hub: Arc<dyn HubClient>,
    engine: Arc<dyn InferenceEngine>,
    slot: Arc<LoadedSlot>,
    runtime_registry_file: Option<PathBuf>,
}

impl ModelManager {
    pub fn new(
        registry: ModelRegistry,
        orchestrator: DownloadOrchestrator,
        hub: Arc<dyn HubClient>,
        engine: Arc<dyn InferenceEngine>,
        slot: Arc<LoadedSlot>,
    ) -> Self {
        Self {
            registry: RwLock::new(registry),
            orchestrator,
            hub,
            engine,
            slot,
            runtime_registry_file: None,
        }
    }

    /// Build a manager from configuration: builtins, then registry files, then
    /// the persisted runtime tier
    pub fn from_config(
        config: &ManagerConfig,
        hub: Arc<dyn HubClient>,
        engine: Arc<dyn InferenceEngine>,
    ) -> ManagerResult<Self> {
        let mut registry = ModelRegistry::new();
        for path in &config.registry_files {
            registry.load_file(path)?;
        }
        if let Some(path) = &config.runtime_registry_file
            && path.is_file()
        {
            registry.load_file_into(path, RegistryTier::Runtime)?;
        }

        let orchestrator =
            DownloadOrchestrator::new(hub.clone(), config.models_dir.clone(), config.download.clone());
        let mut manager = Self::new(registry, orchestrator, hub, engine, Arc::new(LoadedSlot::new()));
        manager.runtime_registry_file = config.runtime_registry_file.clone();
        Ok(manager)
    }

    pub fn with_runtime_registry_file(mut self, path: PathBuf) -> Self {
        self.runtime_registry_file = Some(path);
        self
    }

    pub fn models_dir(&self) -> &Path {
        self.orchestrator.models_dir()
    }

    pub fn model_dir(&self, name: &str) -> PathBuf {
        self.orchestrator.model_dir(name)
    }

    async fn descriptor(&self, name: &str) -> ManagerResult<ModelDescriptor> {
        self.registry
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ManagerError::ModelNotFound(name.to_string()))
    }

    // ---- registry ----

    /// Every registered descriptor, sorted by name
    pub async fn list_available(&self) -> Vec<ModelDescriptor> {
        self.registry.read().await.all_descriptors()
    }

    /// Register a model in the runtime tier and persist the tier
    pub async fn add_model(&self, name: &str, descriptor: ModelDescriptor) -> ManagerResult<()> {
        let mut registry = self.registry.write().await;
        registry.add_runtime(name, descriptor)?;
        self.persist_runtime(&registry)?;
        tracing::info!(model = %name, "Model registered");
        Ok(())
    }

    /// Remove the visible registry entry; returns false for unknown names
    ///
    /// A loaded model whose name no longer resolves is unloaded.
    pub async fn remove_model(&self, name: &str) -> ManagerResult<bool> {
        let still_registered = {
            let mut registry = self.registry.write().await;
            if !registry.remove(name) {
                return Ok(false);
            }
            self.persist_runtime(&registry)?;
            tracing::info!(model = %name, "Model unregistered");
            registry.contains(name)
        };

        // Registry guard is dropped first: generate() takes the slot, then the registry
        if !still_registered && self.slot.current_name().as_deref() == Some(name) {
            self.unload().await?;
        }
        Ok(true)
    }

    /// Merge a registry document into the runtime tier and persist it
    pub async fn import_registry(&self, path: &Path) -> ManagerResult<LoadReport> {
        let mut registry = self.registry.write().await;
        let report = registry.load_file_into(path, RegistryTier::Runtime)?;
        if !report.loaded.is_empty() {
            self.persist_runtime(&registry)?;
        }
        Ok(report)
    }

    fn persist_runtime(&self, registry: &ModelRegistry) -> ManagerResult<()> {
        match &self.runtime_registry_file {
            Some(path) => registry.save_runtime(path),
            None => Ok(()),
        }
    }

    // ---- status ----

    /// Current lifecycle state of `name`
    ///
    /// Unknown names with nothing on disk are `NotInstalled`.
    pub async fn status(&self, name: &str) -> ManagerResult<ModelState> {
        let (state, _) = self.disk_state(name).await?;
        Ok(self.with_loaded(name, state))
    }

    /// `Loaded` only ever refines `Installed`
    fn with_loaded(&self, name: &str, state: ModelState) -> ModelState {
        if state == ModelState::Installed && self.slot.current_name().as_deref() == Some(name) {
            ModelState::Loaded
        } else {
            state
        }
    }

    /// State from disk and lock alone, plus the verification behind it
    async fn disk_state(&self, name: &str) -> ManagerResult<(ModelState, Option<Verification>)> {
        let registered = self.registry.read().await.get(name).cloned();

        match self.orchestrator.observe(name) {
            DownloadState::Requested | DownloadState::InProgress => {
                return Ok((ModelState::Downloading, None));
            }
            _ => {}
        }

        let dir = self.model_dir(name);
        let inventory = scan_directory(&dir)?;
        if inventory.is_empty() {
            return Ok((ModelState::NotInstalled, None));
        }

        let manifest = InstallManifest::load(&dir);
        let index = match (&manifest, &registered) {
            (Some(manifest), _) => Some(manifest.expected_index()),
            (None, Some(descriptor)) => match self.hub.list_files(&descriptor.repo_id).await {
                Ok(index) => Some(index),
                Err(e) => {
                    tracing::debug!(model = %name, error = %e, "Hub index unavailable, using structural check");
                    None
                }
            },
            (None, None) => None,
        };
        let model_type = match (&registered, &manifest) {
            (Some(descriptor), _) => descriptor.model_type.clone(),
            (None, Some(manifest)) => ModelType::from(manifest.model_type.as_str()),
            (None, None) => ModelType::Other(String::new()),
        };

        let verification = verify(index.as_ref(), &inventory, model_type.required_structure());
        let complete = match &verification {
            Verification::Complete => true,
            Verification::Indeterminate => manifest.as_ref().is_some_and(|m| m.is_completed()),
            _ => false,
        };

        let state = match (complete, registered.is_some()) {
            (true, true) => ModelState::Installed,
            (true, false) if manifest.is_some() => ModelState::InstalledUnconfigured,
            (true, false) => ModelState::NotInstalled,
            (false, _) => ModelState::Incomplete,
        };
        Ok((state, Some(verification)))
    }

    pub async fn is_installed(&self, name: &str) -> ManagerResult<bool> {
        Ok(self.status(name).await?.is_ready())
    }

    /// Registered models that are fully installed
    pub async fn list_installed(&self) -> ManagerResult<Vec<String>> {
        let names = self.registry.read().await.all_names();
        let mut installed = Vec::new();
        for name in names {
            if self.is_installed(&name).await? {
                installed.push(name);
            }
        }
        Ok(installed)
    }

    /// Complete model directories whose registry entry is gone
    pub async fn list_unconfigured(&self) -> ManagerResult<Vec<String>> {
        let entries = match std::fs::read_dir(self.models_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() || entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let Some(manifest) = InstallManifest::load(&path) else {
                continue;
            };
            if model_dir_name(&manifest.name) != entry.file_name().to_string_lossy() {
                continue;
            }
            if self.disk_state(&manifest.name).await?.0 == ModelState::InstalledUnconfigured {
                names.push(manifest.name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.current_name().is_some()
    }

    pub fn current_loaded_name(&self) -> Option<String> {
        self.slot.current_name()
    }

    pub async fn get_model_info(&self, name: &str) -> ManagerResult<ModelInfo> {
        let (tier, descriptor) = self
            .registry
            .read()
            .await
            .get_with_tier(name)
            .ok_or_else(|| ManagerError::ModelNotFound(name.to_string()))?;

        let (state, verification) = self.disk_state(name).await?;
        let state = self.with_loaded(name, state);
        let path = self.model_dir(name);
        let size_on_disk = scan_directory(&path)?.total_bytes;

        Ok(ModelInfo {
            descriptor,
            tier,
            state,
            path,
            size_on_disk,
            verification,
        })
    }

    pub fn download_state(&self, name: &str) -> DownloadState {
        self.orchestrator.observe(name)
    }

    /// Latest progress of `name`
    ///
    /// Uses the in-process snapshot when this process is downloading,
    /// otherwise samples the directory over `window`.
    pub async fn progress(&self, name: &str, window: Duration) -> ManagerResult<ProgressSnapshot> {
        if self.orchestrator.observe(name) == DownloadState::InProgress
            && let Some(snapshot) = self.orchestrator.progress(name)
        {
            return Ok(snapshot);
        }
        self.orchestrator.sample_progress(name, window).await
    }

    // ---- install ----

    /// Download (or resume) a registered model and verify it
    ///
    /// An integrity failure is returned as [`ManagerError::IntegrityMismatch`];
    /// the partial state stays on disk for the next attempt.
    pub async fn install(&self, name: &str, force: bool) -> ManagerResult<DownloadReport> {
        let descriptor = self.descriptor(name).await?;

        if descriptor.requires_agreement() && crate::models::hub::resolve_token().is_none() {
            tracing::warn!(
                model = %name,
                repo_id = %descriptor.repo_id,
                "Model license requires agreement; set HF_TOKEN after accepting it on the hub"
            );
        }

        // A forced reinstall deletes the files under the engine
        if force && self.slot.current_name().as_deref() == Some(name) {
            tracing::info!(model = %name, "Unloading before forced reinstall");
            self.unload().await?;
        }

        let report = self.orchestrator.run(&descriptor, force).await?;
        match &report.state {
            DownloadState::Completed => Ok(report),
            _ => Err(ManagerError::IntegrityMismatch {
                name: name.to_string(),
                detail: report.verification.summary(),
            }),
        }
    }

    /// Delete a model's files, unloading it first if needed
    ///
    /// Returns false when nothing was on disk.
    pub async fn uninstall(&self, name: &str) -> ManagerResult<bool> {
        // Holding the download lock keeps a concurrent install out
        let _lock = self.orchestrator.lock(name)?;

        if self.slot.current_name().as_deref() == Some(name) {
            self.unload().await?;
        }

        let dir = self.model_dir(name);
        if !dir.exists() {
            return Ok(false);
        }
        tokio::fs::remove_dir_all(&dir).await?;
        tracing::info!(model = %name, path = %dir.display(), "Model files removed");
        Ok(true)
    }

    // ---- load ----

    /// Make `name` the loaded model
    ///
    /// A different loaded model is released first. On failure the slot is left
    /// empty.
    pub async fn load(&self, name: &str) -> ManagerResult<()> {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|m| m.name == name) {
            tracing::debug!(model = %name, "Model already loaded");
            return Ok(());
        }

        let descriptor = self.descriptor(name).await?;
        let (state, _) = self.disk_state(name).await?;
        if state != ModelState::Installed {
            return Err(ManagerError::NotReady {
                name: name.to_string(),
                state: state.status_code().to_string(),
            });
        }

        if let Some(previous) = slot.take() {
            self.release(previous).await;
            self.slot.publish(&slot);
        }

        gpu::advise(&descriptor);
        let dir = self.model_dir(name);

        tracing::info!(model = %name, path = %dir.display(), "Loading model");
        match self.engine.load(&descriptor, &dir).await {
            Ok(handle) => {
                *slot = Some(LoadedModel {
                    name: name.to_string(),
                    handle,
                    loaded_at: Utc::now(),
                });
                self.slot.publish(&slot);
                metrics::record_model_loaded(name);
                Ok(())
            }
            Err(e) => {
                tracing::error!(model = %name, error = %e, "Model load failed");
                metrics::record_load_failure(name);
                Err(ManagerError::LoadFailure {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Release the loaded model; no-op when nothing is loaded
    pub async fn unload(&self) -> ManagerResult<()> {
        let mut slot = self.slot.lock().await;
        if let Some(previous) = slot.take() {
            self.release(previous).await;
            self.slot.publish(&slot);
        }
        Ok(())
    }

    async fn release(&self, model: LoadedModel) {
        let name = model.name.clone();
        match self.engine.unload(model.handle).await {
            Ok(()) => tracing::info!(model = %name, "Model unloaded"),
            // The slot is cleared regardless; the engine owns cleanup
            Err(e) => tracing::warn!(model = %name, error = %e, "Engine reported an unload error"),
        }
        metrics::record_model_unloaded(&name);
    }

    /// Run a generation on the loaded model, filling in its defaults
    pub async fn generate(&self, request: GenerationRequest) -> ManagerResult<GeneratedImage> {
        let slot = self.slot.lock().await;
        let loaded = slot.as_ref().ok_or(ManagerError::NoModelLoaded)?;

        let defaults = self
            .registry
            .read()
            .await
            .get(&loaded.name)
            .map(|d| d.parameters.clone())
            .unwrap_or_default();
        let request = request.with_defaults(&defaults);

        tracing::debug!(model = %loaded.name, steps = ?request.num_inference_steps, "Generating");
        self.engine
            .generate(&loaded.handle, &request)
            .await
            .map_err(|e| ManagerError::Generation {
                name: loaded.name.clone(),
                reason: e.to_string(),
            })
    }
}
