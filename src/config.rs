//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Root under which each model gets its own directory
    pub models_dir: PathBuf,
    /// Registry documents loaded into the file tier, in order
    pub registry_files: Vec<PathBuf>,
    /// Where `registry add` persists runtime entries
    pub runtime_registry_file: Option<PathBuf>,
    pub hub: HubConfig,
    pub download: DownloadConfig,
    pub engine: EngineConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            registry_files: Vec::new(),
            runtime_registry_file: Some(default_runtime_registry_file()),
            hub: HubConfig::default(),
            download: DownloadConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HubConfig {
    pub endpoint: String,
    pub revision: String,
    pub connect_timeout_secs: u64,
    /// Timeout of one tree-listing request
    pub list_timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://huggingface.co".to_string(),
            revision: "main".to_string(),
            connect_timeout_secs: 30,
            list_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub progress_interval_secs: u64,
    /// A lock whose heartbeat is older than this is treated as abandoned
    pub stale_lock_secs: u64,
    /// Samples kept per download session
    pub history_len: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            progress_interval_secs: 5,
            stale_lock_secs: 600,
            history_len: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker executable spawned per loaded model
    pub worker_binary: String,
    pub load_timeout_secs: u64,
    /// Extra args passed to the worker before the model arguments
    pub extra_args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_binary: "diffusers-worker".to_string(),
            load_timeout_secs: 600,
            extra_args: Vec::new(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(dir) = std::env::var("DIFFUSER_MODELS_DIR") {
            config.models_dir = PathBuf::from(dir);
        }
        if let Ok(files) = std::env::var("DIFFUSER_REGISTRY_FILE") {
            config.registry_files = std::env::split_paths(&files).collect();
        }
        if let Ok(endpoint) = std::env::var("DIFFUSER_HUB_ENDPOINT") {
            config.hub.endpoint = endpoint;
        }
        if let Ok(binary) = std::env::var("DIFFUSER_WORKER_BINARY") {
            config.engine.worker_binary = binary;
        }
        if let Ok(interval) = std::env::var("DIFFUSER_PROGRESS_INTERVAL") {
            config.download.progress_interval_secs = interval
                .parse()
                .context("Invalid DIFFUSER_PROGRESS_INTERVAL value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.download.progress_interval_secs == 0 {
            anyhow::bail!("download.progress_interval_secs must be > 0");
        }
        if self.download.stale_lock_secs == 0 {
            anyhow::bail!("download.stale_lock_secs must be > 0");
        }
        if self.download.history_len < 2 {
            anyhow::bail!(
                "download.history_len must be >= 2 (got {})",
                self.download.history_len
            );
        }
        if self.engine.load_timeout_secs == 0 {
            anyhow::bail!("engine.load_timeout_secs must be > 0");
        }
        if self.engine.worker_binary.trim().is_empty() {
            anyhow::bail!("engine.worker_binary cannot be empty");
        }
        if !self.hub.endpoint.starts_with("http://") && !self.hub.endpoint.starts_with("https://")
        {
            anyhow::bail!("hub.endpoint must be an http(s) URL (got {})", self.hub.endpoint);
        }

        for file in &self.registry_files {
            if !file.is_file() {
                anyhow::bail!("Registry file not found: {:?}", file);
            }
        }

        if !self.models_dir.exists() {
            std::fs::create_dir_all(&self.models_dir)
                .with_context(|| format!("Cannot create models directory: {:?}", self.models_dir))?;
        }

        Ok(())
    }
}

// Default functions
fn default_models_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("diffuser-manager/models"))
        .unwrap_or_else(|| PathBuf::from("/tmp/diffuser-manager/models"))
}

fn default_runtime_registry_file() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("diffuser-manager/registry.json"))
        .unwrap_or_else(|| PathBuf::from("/tmp/diffuser-manager/registry.json"))
}
