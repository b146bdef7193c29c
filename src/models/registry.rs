//! Tiered model registry
//!
//! The effective catalogue is an ordered list of layers (builtin, file
//! configured, runtime). [`ModelRegistry::resolve`] walks the layers from
//! highest to lowest precedence, so the newest tier to define a name wins.
//!
//! The registry itself is single-writer; [`crate::manager::ModelManager`]
//! serialises access behind a lock.

use super::builtin::builtin_models;
use super::descriptor::{ModelDescriptor, RawModelDescriptor};
use crate::error::{ManagerError, ManagerResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Precedence tier of a registry entry (ascending)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryTier {
    Builtin,
    FileConfigured,
    Runtime,
}

impl std::fmt::Display for RegistryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Builtin => write!(f, "builtin"),
            Self::FileConfigured => write!(f, "file_configured"),
            Self::Runtime => write!(f, "runtime"),
        }
    }
}

/// Serialization format of a registry document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Toml,
}

impl DocumentFormat {
    /// `.toml` files are TOML, everything else is JSON
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::Toml,
            _ => Self::Json,
        }
    }
}

/// A registry document entry that was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    pub name: String,
    pub reason: String,
}

/// Outcome of loading one registry document
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub source: PathBuf,
    pub loaded: Vec<String>,
    pub skipped: Vec<SkippedEntry>,
}

#[derive(Debug, Clone)]
struct RegistryLayer {
    tier: RegistryTier,
    entries: BTreeMap<String, ModelDescriptor>,
}

/// Registry of known models across precedence tiers
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    /// Ascending precedence
    layers: Vec<RegistryLayer>,
}

impl ModelRegistry {
    /// Registry with the three standard tiers, all empty
    pub fn empty() -> Self {
        Self::with_precedence(&[
            RegistryTier::Builtin,
            RegistryTier::FileConfigured,
            RegistryTier::Runtime,
        ])
    }

    /// Registry with an explicit layer order, lowest precedence first
    pub fn with_precedence(order: &[RegistryTier]) -> Self {
        let mut layers: Vec<RegistryLayer> = Vec::with_capacity(order.len());
        for tier in order {
            if !layers.iter().any(|l| l.tier == *tier) {
                layers.push(RegistryLayer {
                    tier: *tier,
                    entries: BTreeMap::new(),
                });
            }
        }
        Self { layers }
    }

    /// Registry seeded with the built-in catalogue
    pub fn new() -> Self {
        let mut registry = Self::empty();
        for descriptor in builtin_models() {
            let name = descriptor.name.clone();
            if let Err(e) = registry.add(&name, descriptor, RegistryTier::Builtin) {
                tracing::error!(model = %name, error = %e, "Invalid builtin model skipped");
            }
        }
        registry
    }

    fn layer_mut(&mut self, tier: RegistryTier) -> ManagerResult<&mut RegistryLayer> {
        self.layers
            .iter_mut()
            .find(|l| l.tier == tier)
            .ok_or_else(|| ManagerError::Config(format!("registry has no '{tier}' tier")))
    }

    /// Visible entry for a name along with the tier that supplies it
    pub fn resolve(&self, name: &str) -> Option<(RegistryTier, &ModelDescriptor)> {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| layer.entries.get(name).map(|d| (layer.tier, d)))
    }

    pub fn get(&self, name: &str) -> Option<&ModelDescriptor> {
        self.resolve(name).map(|(_, d)| d)
    }

    /// Owned copy of the visible entry and its tier
    pub fn get_with_tier(&self, name: &str) -> Option<(RegistryTier, ModelDescriptor)> {
        self.resolve(name).map(|(tier, d)| (tier, d.clone()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Insert or overwrite an entry in one tier
    ///
    /// The descriptor is re-keyed to `name` and validated first.
    pub fn add(
        &mut self,
        name: &str,
        mut descriptor: ModelDescriptor,
        tier: RegistryTier,
    ) -> ManagerResult<()> {
        descriptor.name = name.to_string();
        descriptor.validate()?;

        let layer = self.layer_mut(tier)?;
        let replaced = layer.entries.insert(name.to_string(), descriptor).is_some();

        tracing::debug!(model = %name, tier = %tier, replaced, "Registry entry added");
        Ok(())
    }

    /// Insert or overwrite an entry in the runtime tier
    pub fn add_runtime(&mut self, name: &str, descriptor: ModelDescriptor) -> ManagerResult<()> {
        self.add(name, descriptor, RegistryTier::Runtime)
    }

    /// Remove the visible entry for a name
    ///
    /// Only the supplying tier is touched, so a lower-tier definition of the
    /// same name becomes visible again. Returns false if no tier has it.
    pub fn remove(&mut self, name: &str) -> bool {
        let Some(layer) = self
            .layers
            .iter_mut()
            .rev()
            .find(|l| l.entries.contains_key(name))
        else {
            return false;
        };

        layer.entries.remove(name);
        tracing::debug!(model = %name, tier = %layer.tier, "Registry entry removed");
        true
    }

    /// Load a registry document into the file-configured tier
    ///
    /// Entries are validated one at a time; a malformed entry is skipped with
    /// a warning and reported in [`LoadReport::skipped`]. Only an unreadable
    /// or unparseable document fails the whole call.
    pub fn load_file(&mut self, path: &Path) -> ManagerResult<LoadReport> {
        self.load_file_into(path, RegistryTier::FileConfigured)
    }

    /// Load a registry document into a specific tier
    pub fn load_file_into(&mut self, path: &Path, tier: RegistryTier) -> ManagerResult<LoadReport> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ManagerError::Config(format!("failed to read registry file {}: {e}", path.display()))
        })?;
        let mut report = self.load_document_into(&content, DocumentFormat::from_path(path), tier)?;
        report.source = path.to_path_buf();

        tracing::info!(
            path = %path.display(),
            tier = %tier,
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            "Registry file loaded"
        );
        Ok(report)
    }

    /// Parse a registry document from memory into the file-configured tier
    pub fn load_document(
        &mut self,
        content: &str,
        format: DocumentFormat,
    ) -> ManagerResult<LoadReport> {
        self.load_document_into(content, format, RegistryTier::FileConfigured)
    }

    fn load_document_into(
        &mut self,
        content: &str,
        format: DocumentFormat,
        tier: RegistryTier,
    ) -> ManagerResult<LoadReport> {
        let entries = parse_document(content, format)?;
        let mut report = LoadReport::default();

        for (name, value) in entries {
            let parsed = serde_json::from_value::<RawModelDescriptor>(value)
                .map_err(|e| ManagerError::validation(&name, e.to_string()))
                .and_then(|raw| ModelDescriptor::from_raw(&name, raw))
                .and_then(|descriptor| self.add(&name, descriptor, tier));

            match parsed {
                Ok(()) => report.loaded.push(name),
                Err(e) => {
                    tracing::warn!(model = %name, error = %e, "Skipping invalid registry entry");
                    report.skipped.push(SkippedEntry {
                        name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Write one tier as a registry document (atomic: tmp + rename)
    pub fn save_tier(&self, tier: RegistryTier, path: &Path) -> ManagerResult<()> {
        let entries: BTreeMap<&str, RawModelDescriptor> = self
            .layers
            .iter()
            .filter(|l| l.tier == tier)
            .flat_map(|l| l.entries.iter())
            .map(|(name, d)| (name.as_str(), RawModelDescriptor::from(d)))
            .collect();

        let content = match DocumentFormat::from_path(path) {
            DocumentFormat::Json => serde_json::to_string_pretty(&entries)
                .map_err(|e| ManagerError::Config(format!("failed to serialize registry: {e}")))?,
            DocumentFormat::Toml => toml::to_string_pretty(&entries)
                .map_err(|e| ManagerError::Config(format!("failed to serialize registry: {e}")))?,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, path)?;

        tracing::debug!(path = %path.display(), tier = %tier, entries = entries.len(), "Registry tier saved");
        Ok(())
    }

    /// Persist the runtime tier so CLI additions survive restarts
    pub fn save_runtime(&self, path: &Path) -> ManagerResult<()> {
        self.save_tier(RegistryTier::Runtime, path)
    }

    /// Sorted snapshot of every visible name
    pub fn all_names(&self) -> Vec<String> {
        self.layers
            .iter()
            .flat_map(|l| l.entries.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Snapshot of every visible descriptor, sorted by name
    pub fn all_descriptors(&self) -> Vec<ModelDescriptor> {
        self.all_names()
            .iter()
            .filter_map(|name| self.get(name).cloned())
            .collect()
    }

    /// Number of visible entries
    pub fn len(&self) -> usize {
        self.all_names().len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(|l| l.entries.is_empty())
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a document into name -> raw entry pairs
///
/// Accepts a bare mapping or one wrapped in a top-level `models` table.
fn parse_document(
    content: &str,
    format: DocumentFormat,
) -> ManagerResult<serde_json::Map<String, serde_json::Value>> {
    let value: serde_json::Value = match format {
        DocumentFormat::Json => serde_json::from_str(content)
            .map_err(|e| ManagerError::Config(format!("invalid registry JSON: {e}")))?,
        DocumentFormat::Toml => toml::from_str(content)
            .map_err(|e| ManagerError::Config(format!("invalid registry TOML: {e}")))?,
    };

    let serde_json::Value::Object(mut top) = value else {
        return Err(ManagerError::Config(
            "registry document must be a mapping of model name to fields".to_string(),
        ));
    };

    let wrapped = matches!(
        top.get("models"),
        Some(serde_json::Value::Object(inner)) if !inner.contains_key("repo_id")
    );
    if wrapped && let Some(serde_json::Value::Object(inner)) = top.remove("models") {
        return Ok(inner);
    }

    Ok(top)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(repo_id: &str) -> ModelDescriptor {
        ModelDescriptor::new("placeholder", repo_id, "flux").unwrap()
    }

    #[test]
    fn test_new_registry_has_builtins() {
        let registry = ModelRegistry::new();
        assert!(registry.contains("flux.1-dev"));
        assert_eq!(
            registry.resolve("flux.1-dev").map(|(t, _)| t),
            Some(RegistryTier::Builtin)
        );
    }

    #[test]
    fn test_precedence_file_over_builtin_runtime_over_both() {
        let mut registry = ModelRegistry::empty();
        registry
            .add("m", descriptor("org/builtin"), RegistryTier::Builtin)
            .unwrap();
        registry
            .add("m", descriptor("org/file"), RegistryTier::FileConfigured)
            .unwrap();
        assert_eq!(registry.get("m").unwrap().repo_id, "org/file");

        registry.add_runtime("m", descriptor("org/runtime")).unwrap();
        assert_eq!(registry.get("m").unwrap().repo_id, "org/runtime");
    }

    #[test]
    fn test_add_then_remove() {
        let mut registry = ModelRegistry::empty();
        registry
            .add_runtime("m", ModelDescriptor::new("m", "org/m", "x").unwrap())
            .unwrap();
        assert!(registry.remove("m"));
        assert!(registry.get("m").is_none());
        assert!(!registry.remove("m"));
    }

    #[test]
    fn test_remove_reveals_lower_tier() {
        let mut registry = ModelRegistry::empty();
        registry
            .add("m", descriptor("org/builtin"), RegistryTier::Builtin)
            .unwrap();
        registry.add_runtime("m", descriptor("org/runtime")).unwrap();

        assert!(registry.remove("m"));
        assert_eq!(registry.get("m").unwrap().repo_id, "org/builtin");
    }

    #[test]
    fn test_add_rekeys_descriptor() {
        let mut registry = ModelRegistry::empty();
        registry.add_runtime("renamed", descriptor("org/m")).unwrap();
        assert_eq!(registry.get("renamed").unwrap().name, "renamed");
    }

    #[test]
    fn test_add_rejects_invalid_name() {
        let mut registry = ModelRegistry::empty();
        assert!(registry.add_runtime("../evil", descriptor("org/m")).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_missing_tier_is_error() {
        let mut registry = ModelRegistry::with_precedence(&[RegistryTier::Builtin]);
        assert!(registry.add_runtime("m", descriptor("org/m")).is_err());
    }

    #[test]
    fn test_custom_precedence_order() {
        // Runtime below file: file entries win
        let mut registry =
            ModelRegistry::with_precedence(&[RegistryTier::Runtime, RegistryTier::FileConfigured]);
        registry
            .add("m", descriptor("org/file"), RegistryTier::FileConfigured)
            .unwrap();
        registry.add_runtime("m", descriptor("org/runtime")).unwrap();
        assert_eq!(registry.get("m").unwrap().repo_id, "org/file");
    }

    #[test]
    fn test_load_document_skips_bad_entries() {
        let doc = r#"{
            "good": {"repo_id": "org/good", "model_type": "sd15"},
            "no-repo": {"model_type": "sd15"},
            "bad-types": {"repo_id": "org/x", "model_type": "flux", "parameters": {"num_inference_steps": "many"}},
            "also-good": {"repo_id": "org/also", "model_type": "flux"}
        }"#;
        let mut registry = ModelRegistry::empty();
        let report = registry.load_document(doc, DocumentFormat::Json).unwrap();

        assert_eq!(report.loaded, vec!["also-good".to_string(), "good".to_string()]);
        let skipped: Vec<_> = report.skipped.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(skipped, vec!["bad-types", "no-repo"]);
        assert!(registry.contains("good"));
        assert!(!registry.contains("no-repo"));
    }

    #[test]
    fn test_load_document_models_wrapper() {
        let doc = r#"{"models": {"config-test-model": {"repo_id": "test/config-model", "model_type": "sd15"}}}"#;
        let mut registry = ModelRegistry::empty();
        let report = registry.load_document(doc, DocumentFormat::Json).unwrap();
        assert_eq!(report.loaded, vec!["config-test-model".to_string()]);
    }

    #[test]
    fn test_load_document_toml() {
        let doc = r#"
["flux.1-dev"]
repo_id = "mirror/FLUX.1-dev"
model_type = "flux"

["flux.1-dev".parameters]
num_inference_steps = 28
"#;
        let mut registry = ModelRegistry::new();
        registry.load_document(doc, DocumentFormat::Toml).unwrap();

        let (tier, d) = registry.resolve("flux.1-dev").unwrap();
        assert_eq!(tier, RegistryTier::FileConfigured);
        assert_eq!(d.repo_id, "mirror/FLUX.1-dev");
        assert_eq!(d.parameters.num_inference_steps, Some(28));
    }

    #[test]
    fn test_load_document_rejects_non_mapping() {
        let mut registry = ModelRegistry::empty();
        assert!(registry.load_document("[1, 2]", DocumentFormat::Json).is_err());
        assert!(registry.load_document("{not json", DocumentFormat::Json).is_err());
    }

    #[test]
    fn test_load_document_idempotent() {
        let doc = r#"{"a": {"repo_id": "org/a", "model_type": "sd15"}}"#;
        let mut once = ModelRegistry::new();
        once.load_document(doc, DocumentFormat::Json).unwrap();
        let mut twice = ModelRegistry::new();
        twice.load_document(doc, DocumentFormat::Json).unwrap();
        twice.load_document(doc, DocumentFormat::Json).unwrap();

        assert_eq!(once.all_descriptors(), twice.all_descriptors());
    }

    #[test]
    fn test_save_tier_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("runtime.toml");

        let mut registry = ModelRegistry::empty();
        registry
            .add_runtime("m", descriptor("org/m").with_variant("fp16"))
            .unwrap();
        registry.save_runtime(&path).unwrap();

        let mut restored = ModelRegistry::empty();
        let report = restored.load_file(&path).unwrap();
        assert_eq!(report.loaded, vec!["m".to_string()]);
        assert_eq!(restored.get("m").unwrap().variant.as_deref(), Some("fp16"));
    }

    #[test]
    fn test_load_file_into_runtime_tier() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("runtime.json");
        std::fs::write(&path, r#"{"m": {"repo_id": "org/m", "model_type": "sdxl"}}"#).unwrap();

        let mut registry = ModelRegistry::empty();
        registry.load_file_into(&path, RegistryTier::Runtime).unwrap();
        let (tier, _) = registry.get_with_tier("m").unwrap();
        assert_eq!(tier, RegistryTier::Runtime);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_load_file_missing_is_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut registry = ModelRegistry::empty();
        assert!(registry.load_file(&temp_dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn test_all_names_sorted_and_deduplicated() {
        let mut registry = ModelRegistry::empty();
        registry
            .add("b", descriptor("org/b"), RegistryTier::Builtin)
            .unwrap();
        registry.add_runtime("b", descriptor("org/b2")).unwrap();
        registry.add_runtime("a", descriptor("org/a")).unwrap();

        assert_eq!(registry.all_names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.all_descriptors()[1].repo_id, "org/b2");
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(RegistryTier::Builtin.to_string(), "builtin");
        assert_eq!(RegistryTier::FileConfigured.to_string(), "file_configured");
        assert_eq!(RegistryTier::Runtime.to_string(), "runtime");
    }
}
