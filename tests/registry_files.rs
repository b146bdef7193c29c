//! Registry file integration tests
//!
//! Covers registry documents on disk: JSON and TOML layouts, per-entry
//! validation, tier precedence and persistence of runtime edits across
//! manager restarts.

use async_trait::async_trait;
use diffuser_manager::config::ManagerConfig;
use diffuser_manager::engine::{
    EngineError, EngineHandle, GeneratedImage, GenerationRequest, InferenceEngine,
};
use diffuser_manager::models::{
    HubClient, HubError, ModelDescriptor, ModelRegistry, ModelType, RegistryTier, RemoteFile,
    RepoIndex,
};
use diffuser_manager::{ManagerError, ModelManager};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct OfflineHub;

#[async_trait]
impl HubClient for OfflineHub {
    async fn list_files(&self, repo_id: &str) -> Result<RepoIndex, HubError> {
        Err(HubError::Unreachable {
            repo_id: repo_id.to_string(),
            reason: "offline".to_string(),
        })
    }

    async fn download(&self, repo_id: &str, _: &Path, _: &[RemoteFile]) -> Result<(), HubError> {
        Err(HubError::Unreachable {
            repo_id: repo_id.to_string(),
            reason: "offline".to_string(),
        })
    }

    async fn download_snapshot(&self, repo_id: &str, _: &Path) -> Result<Vec<String>, HubError> {
        Err(HubError::Unreachable {
            repo_id: repo_id.to_string(),
            reason: "offline".to_string(),
        })
    }
}

struct NoEngine;

#[async_trait]
impl InferenceEngine for NoEngine {
    async fn load(&self, _: &ModelDescriptor, _: &Path) -> Result<EngineHandle, EngineError> {
        Err(EngineError::Spawn("no engine in tests".to_string()))
    }

    async fn unload(&self, handle: EngineHandle) -> Result<(), EngineError> {
        Err(EngineError::UnknownHandle(handle.id))
    }

    async fn generate(
        &self,
        handle: &EngineHandle,
        _: &GenerationRequest,
    ) -> Result<GeneratedImage, EngineError> {
        Err(EngineError::UnknownHandle(handle.id))
    }
}

fn config(temp_dir: &TempDir, registry_files: Vec<std::path::PathBuf>) -> ManagerConfig {
    ManagerConfig {
        models_dir: temp_dir.path().join("models"),
        registry_files,
        runtime_registry_file: Some(temp_dir.path().join("runtime.json")),
        ..Default::default()
    }
}

fn manager(config: &ManagerConfig) -> ModelManager {
    ModelManager::from_config(config, Arc::new(OfflineHub), Arc::new(NoEngine)).unwrap()
}

const JSON_REGISTRY: &str = r#"{
    "flux.1-dev": {
        "repo_id": "mirror/FLUX.1-dev",
        "model_type": "flux",
        "parameters": { "num_inference_steps": 30 }
    },
    "anime-xl": {
        "repo_id": "org/anime-xl",
        "model_type": "sdxl",
        "variant": "fp16"
    },
    "broken": {
        "model_type": "sdxl"
    }
}"#;

const TOML_REGISTRY: &str = r#"
[models.custom-flux]
repo_id = "org/custom-flux"
model_type = "flux"

[models.custom-flux.license_info]
type = "apache-2.0"
requires_agreement = false
commercial_use = true

[models."bad name"]
repo_id = "org/bad"
model_type = "flux"
"#;

#[test]
fn test_json_file_overrides_builtin() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("models.json");
    std::fs::write(&path, JSON_REGISTRY).unwrap();

    let mut registry = ModelRegistry::new();
    let builtin_repo = registry.get("flux.1-dev").unwrap().repo_id.clone();
    let report = registry.load_file(&path).unwrap();

    assert_eq!(report.source, path);
    assert_eq!(report.loaded, vec!["anime-xl".to_string(), "flux.1-dev".to_string()]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].name, "broken");
    assert!(report.skipped[0].reason.contains("repo_id"));

    let (tier, flux) = registry.resolve("flux.1-dev").unwrap();
    assert_eq!(tier, RegistryTier::FileConfigured);
    assert_eq!(flux.repo_id, "mirror/FLUX.1-dev");
    assert_ne!(flux.repo_id, builtin_repo);
    assert_eq!(flux.parameters.num_inference_steps, Some(30));

    let anime = registry.get("anime-xl").unwrap();
    assert_eq!(anime.model_type, ModelType::Sdxl);
    assert_eq!(anime.variant.as_deref(), Some("fp16"));
    assert!(!registry.contains("broken"));
}

#[test]
fn test_toml_file_with_models_table() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("models.toml");
    std::fs::write(&path, TOML_REGISTRY).unwrap();

    let mut registry = ModelRegistry::empty();
    let report = registry.load_file(&path).unwrap();

    assert_eq!(report.loaded, vec!["custom-flux".to_string()]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].name, "bad name");

    let custom = registry.get("custom-flux").unwrap();
    assert_eq!(custom.name, "custom-flux");
    assert!(!custom.requires_agreement());
}

#[test]
fn test_component_keys_cannot_leave_model_dir() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("models.json");
    std::fs::write(
        &path,
        r#"{
            "escape": {
                "repo_id": "org/escape",
                "model_type": "flux",
                "components": {
                    "../../escaped": { "repo_id": "org/lora", "weight_name": "w.safetensors" }
                }
            },
            "rooted": {
                "repo_id": "org/rooted",
                "model_type": "flux",
                "components": {
                    "/tmp/elsewhere": { "repo_id": "org/lora", "weight_name": "w.safetensors" }
                }
            },
            "fine": {
                "repo_id": "org/fine",
                "model_type": "flux",
                "components": {
                    "style": { "repo_id": "org/lora", "weight_name": "w.safetensors" }
                }
            }
        }"#,
    )
    .unwrap();

    let mut registry = ModelRegistry::empty();
    let report = registry.load_file(&path).unwrap();

    assert_eq!(report.loaded, vec!["fine".to_string()]);
    let skipped: Vec<_> = report.skipped.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(skipped, vec!["escape", "rooted"]);
    assert!(!registry.contains("escape"));
}

#[test]
fn test_reloading_same_file_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("models.json");
    std::fs::write(&path, JSON_REGISTRY).unwrap();

    let mut registry = ModelRegistry::new();
    registry.load_file(&path).unwrap();
    let first = registry.all_descriptors();
    registry.load_file(&path).unwrap();

    assert_eq!(registry.all_descriptors(), first);
}

#[test]
fn test_unparseable_file_fails_whole_load() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("models.json");
    std::fs::write(&path, "{ not json").unwrap();

    let mut registry = ModelRegistry::empty();
    assert!(matches!(registry.load_file(&path), Err(ManagerError::Config(_))));
    assert!(registry.is_empty());
}

#[test]
fn test_later_file_wins_within_tier() {
    let temp_dir = TempDir::new().unwrap();
    let first = temp_dir.path().join("a.json");
    let second = temp_dir.path().join("b.toml");
    std::fs::write(&first, r#"{"m": {"repo_id": "org/one", "model_type": "flux"}}"#).unwrap();
    std::fs::write(&second, "[m]\nrepo_id = \"org/two\"\nmodel_type = \"flux\"\n").unwrap();

    let mut registry = ModelRegistry::new();
    for path in [&first, &second] {
        registry.load_file(path).unwrap();
    }
    assert_eq!(registry.get("m").unwrap().repo_id, "org/two");
}

#[tokio::test]
async fn test_runtime_edits_survive_restart() {
    let temp_dir = TempDir::new().unwrap();
    let config = config(&temp_dir, Vec::new());

    {
        let manager = manager(&config);
        let descriptor = ModelDescriptor::new("mine", "me/my-flux", "flux")
            .unwrap()
            .with_variant("fp16");
        manager.add_model("mine", descriptor).await.unwrap();
    }
    assert!(temp_dir.path().join("runtime.json").exists());

    let manager = manager(&config);
    let info = manager.get_model_info("mine").await.unwrap();
    assert_eq!(info.tier, RegistryTier::Runtime);
    assert_eq!(info.descriptor.repo_id, "me/my-flux");
    assert_eq!(info.descriptor.variant.as_deref(), Some("fp16"));

    assert!(manager.remove_model("mine").await.unwrap());
    assert!(!manager.remove_model("mine").await.unwrap());

    let manager = self::manager(&config);
    assert!(matches!(
        manager.get_model_info("mine").await,
        Err(ManagerError::ModelNotFound(_))
    ));
}

#[tokio::test]
async fn test_runtime_tier_shadows_file_tier() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("models.json");
    std::fs::write(&path, JSON_REGISTRY).unwrap();
    let config = config(&temp_dir, vec![path]);

    let manager = manager(&config);
    let override_ = ModelDescriptor::new("anime-xl", "fork/anime-xl", "sdxl").unwrap();
    manager.add_model("anime-xl", override_).await.unwrap();
    assert_eq!(
        manager.get_model_info("anime-xl").await.unwrap().descriptor.repo_id,
        "fork/anime-xl"
    );

    // Dropping the runtime entry reveals the file definition again
    assert!(manager.remove_model("anime-xl").await.unwrap());
    let info = manager.get_model_info("anime-xl").await.unwrap();
    assert_eq!(info.tier, RegistryTier::FileConfigured);
    assert_eq!(info.descriptor.repo_id, "org/anime-xl");
}

#[tokio::test]
async fn test_import_persists_into_runtime_tier() {
    let temp_dir = TempDir::new().unwrap();
    let import = temp_dir.path().join("import.toml");
    std::fs::write(&import, TOML_REGISTRY).unwrap();
    let config = config(&temp_dir, Vec::new());

    let report = manager(&config).import_registry(&import).await.unwrap();
    assert_eq!(report.loaded, vec!["custom-flux".to_string()]);
    assert_eq!(report.skipped.len(), 1);

    let manager = manager(&config);
    let info = manager.get_model_info("custom-flux").await.unwrap();
    assert_eq!(info.tier, RegistryTier::Runtime);
}

#[tokio::test]
async fn test_missing_registry_file_is_error() {
    let temp_dir = TempDir::new().unwrap();
    let config = config(&temp_dir, vec![temp_dir.path().join("absent.json")]);
    let result = ModelManager::from_config(&config, Arc::new(OfflineHub), Arc::new(NoEngine));
    assert!(matches!(result, Err(ManagerError::Config(_))));
}
