//! Model descriptors
//!
//! A [`ModelDescriptor`] is the validated record behind one registry name. Raw
//! documents (registry files, CLI input) deserialize into
//! [`RawModelDescriptor`] first and only become descriptors through
//! [`ModelDescriptor::from_raw`], which rejects entries missing `repo_id` or
//! `model_type` up front instead of failing later at load time.

use crate::error::{ManagerError, ManagerResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Pipeline family selecting how the inference engine materialises a model
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ModelType {
    Flux,
    Sd15,
    Sdxl,
    Sd3,
    ControlnetSd15,
    ControlnetSdxl,
    /// Any tag the manager has no structural knowledge of
    Other(String),
}

impl ModelType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Flux => "flux",
            Self::Sd15 => "sd15",
            Self::Sdxl => "sdxl",
            Self::Sd3 => "sd3",
            Self::ControlnetSd15 => "controlnet_sd15",
            Self::ControlnetSdxl => "controlnet_sdxl",
            Self::Other(tag) => tag,
        }
    }

    /// Top-level files and directories every complete copy of this family has.
    ///
    /// Used as the integrity fallback when the hub reports no file sizes.
    pub fn required_structure(&self) -> &'static [&'static str] {
        match self {
            Self::Flux | Self::Sd3 => &["model_index.json", "transformer", "vae"],
            Self::Sd15 | Self::Sdxl => &["model_index.json", "unet", "vae"],
            Self::ControlnetSd15 | Self::ControlnetSdxl => &["config.json"],
            Self::Other(_) => &[],
        }
    }
}

impl From<String> for ModelType {
    fn from(tag: String) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "flux" => Self::Flux,
            "sd15" => Self::Sd15,
            "sdxl" => Self::Sdxl,
            "sd3" => Self::Sd3,
            "controlnet_sd15" => Self::ControlnetSd15,
            "controlnet_sdxl" => Self::ControlnetSdxl,
            _ => Self::Other(tag.trim().to_string()),
        }
    }
}

impl From<&str> for ModelType {
    fn from(tag: &str) -> Self {
        Self::from(tag.to_string())
    }
}

impl From<ModelType> for String {
    fn from(model_type: ModelType) -> Self {
        model_type.as_str().to_string()
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default generation knobs for a model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_inference_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_sequence_length: Option<u32>,
}

/// License metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LicenseInfo {
    #[serde(rename = "type")]
    pub kind: String,
    /// Hub token plus license acceptance needed before download
    #[serde(default)]
    pub requires_agreement: bool,
    #[serde(default)]
    pub commercial_use: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareRequirements {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_vram_gb: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_vram_gb: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_ram_gb: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_space_gb: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance_notes: Option<String>,
}

/// Supplementary weights attached to a model (e.g. a LoRA)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    pub repo_id: String,
    pub weight_name: String,
    #[serde(default = "default_scale")]
    pub scale: f32,
}

fn default_scale() -> f32 {
    1.0
}

impl ComponentDescriptor {
    fn validate(&self, model: &str, key: &str) -> ManagerResult<()> {
        // The key becomes a directory under `components/`
        if key.trim().is_empty()
            || key.starts_with('.')
            || key.chars().any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control())
        {
            return Err(ManagerError::validation(
                model,
                format!("component key '{key}' must be a single plain path segment"),
            ));
        }
        if self.repo_id.trim().is_empty() {
            return Err(ManagerError::validation(
                model,
                format!("component '{key}' is missing repo_id"),
            ));
        }
        if self.weight_name.trim().is_empty()
            || self.weight_name.contains("..")
            || self.weight_name.starts_with(['/', '\\'])
            || std::path::Path::new(&self.weight_name).is_absolute()
        {
            return Err(ManagerError::validation(
                model,
                format!("component '{key}' has an invalid weight_name"),
            ));
        }
        if !self.scale.is_finite() {
            return Err(ManagerError::validation(
                model,
                format!("component '{key}' scale must be finite"),
            ));
        }
        Ok(())
    }
}

/// Unvalidated descriptor fields as they appear in registry documents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawModelDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<GenerationParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_info: Option<LicenseInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_requirements: Option<HardwareRequirements>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, ComponentDescriptor>,
}

/// Validated description of one installable model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub repo_id: String,
    pub model_type: ModelType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    pub parameters: GenerationParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_info: Option<LicenseInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_requirements: Option<HardwareRequirements>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, ComponentDescriptor>,
}

impl ModelDescriptor {
    /// Minimal descriptor; fails if any required field is empty
    pub fn new(
        name: impl Into<String>,
        repo_id: impl Into<String>,
        model_type: impl Into<ModelType>,
    ) -> ManagerResult<Self> {
        let descriptor = Self {
            name: name.into(),
            repo_id: repo_id.into(),
            model_type: model_type.into(),
            variant: None,
            parameters: GenerationParameters::default(),
            license_info: None,
            hardware_requirements: None,
            components: BTreeMap::new(),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Validating factory for document entries
    pub fn from_raw(name: &str, raw: RawModelDescriptor) -> ManagerResult<Self> {
        let repo_id = raw
            .repo_id
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| ManagerError::validation(name, "missing required field 'repo_id'"))?;
        let model_type = raw
            .model_type
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ManagerError::validation(name, "missing required field 'model_type'"))?;

        let descriptor = Self {
            name: name.to_string(),
            repo_id: repo_id.trim().to_string(),
            model_type: ModelType::from(model_type),
            variant: raw.variant,
            parameters: raw.parameters.unwrap_or_default(),
            license_info: raw.license_info,
            hardware_requirements: raw.hardware_requirements,
            components: raw.components,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    pub fn with_parameters(mut self, parameters: GenerationParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_license(mut self, license: LicenseInfo) -> Self {
        self.license_info = Some(license);
        self
    }

    pub fn with_hardware(mut self, hardware: HardwareRequirements) -> Self {
        self.hardware_requirements = Some(hardware);
        self
    }

    pub fn with_component(mut self, key: impl Into<String>, component: ComponentDescriptor) -> Self {
        self.components.insert(key.into(), component);
        self
    }

    /// Check every invariant the registry relies on
    pub fn validate(&self) -> ManagerResult<()> {
        validate_name(&self.name).map_err(|reason| ManagerError::validation(&self.name, reason))?;

        if self.repo_id.trim().is_empty() {
            return Err(ManagerError::validation(&self.name, "missing required field 'repo_id'"));
        }
        if self.model_type.as_str().is_empty() {
            return Err(ManagerError::validation(
                &self.name,
                "missing required field 'model_type'",
            ));
        }
        for (key, component) in &self.components {
            component.validate(&self.name, key)?;
        }
        Ok(())
    }

    /// Directory name under the models root
    pub fn dir_name(&self) -> String {
        model_dir_name(&self.name)
    }

    pub fn requires_agreement(&self) -> bool {
        self.license_info
            .as_ref()
            .is_some_and(|l| l.requires_agreement)
    }

    /// Expected download size in bytes, when the descriptor declares one
    pub fn declared_disk_bytes(&self) -> Option<u64> {
        self.hardware_requirements
            .as_ref()
            .and_then(|h| h.disk_space_gb)
            .filter(|gb| *gb > 0.0)
            .map(|gb| (gb as f64 * 1024.0 * 1024.0 * 1024.0) as u64)
    }
}

impl From<&ModelDescriptor> for RawModelDescriptor {
    fn from(descriptor: &ModelDescriptor) -> Self {
        let parameters = (descriptor.parameters != GenerationParameters::default())
            .then(|| descriptor.parameters.clone());
        Self {
            repo_id: Some(descriptor.repo_id.clone()),
            model_type: Some(descriptor.model_type.to_string()),
            variant: descriptor.variant.clone(),
            parameters,
            license_info: descriptor.license_info.clone(),
            hardware_requirements: descriptor.hardware_requirements.clone(),
            components: descriptor.components.clone(),
        }
    }
}

/// Reject names that cannot safely become a directory name
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("name cannot be empty".to_string());
    }
    if name.starts_with('.') {
        return Err("name cannot start with '.'".to_string());
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control() || c == '\\') {
        return Err("name cannot contain whitespace, control characters or '\\'".to_string());
    }
    if name.split('/').any(|part| part.is_empty() || part == "..") {
        return Err("name cannot contain empty or '..' path segments".to_string());
    }
    // '/' becomes "--" on disk, so neither may appear inside a segment
    if name
        .split('/')
        .any(|part| part.contains("--") || part.starts_with('-') || part.ends_with('-'))
    {
        return Err("name segments cannot contain '--' or start or end with '-'".to_string());
    }
    Ok(())
}

/// Deterministic directory name for a model name
///
/// e.g., "org/custom-flux" -> "org--custom-flux". One-to-one for names that
/// pass [`validate_name`].
pub fn model_dir_name(name: &str) -> String {
    name.replace('/', "--")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_type_tags() {
        assert_eq!(ModelType::from("flux"), ModelType::Flux);
        assert_eq!(ModelType::from("SDXL"), ModelType::Sdxl);
        assert_eq!(ModelType::from("controlnet_sd15"), ModelType::ControlnetSd15);
        assert_eq!(ModelType::from("test"), ModelType::Other("test".to_string()));
        assert_eq!(ModelType::Sd3.to_string(), "sd3");
    }

    #[test]
    fn test_required_structure() {
        assert!(ModelType::Flux.required_structure().contains(&"transformer"));
        assert!(ModelType::Sd15.required_structure().contains(&"unet"));
        assert!(ModelType::Other("x".to_string()).required_structure().is_empty());
    }

    #[test]
    fn test_from_raw_requires_repo_id() {
        let raw = RawModelDescriptor {
            model_type: Some("flux".to_string()),
            ..Default::default()
        };
        let err = ModelDescriptor::from_raw("m", raw).unwrap_err();
        assert!(err.to_string().contains("repo_id"));
    }

    #[test]
    fn test_from_raw_requires_model_type() {
        let raw = RawModelDescriptor {
            repo_id: Some("org/m".to_string()),
            model_type: Some("  ".to_string()),
            ..Default::default()
        };
        let err = ModelDescriptor::from_raw("m", raw).unwrap_err();
        assert!(err.to_string().contains("model_type"));
    }

    #[test]
    fn test_from_raw_full_entry() {
        let json = r#"{
            "repo_id": "test/config-model",
            "model_type": "sd15",
            "variant": "fp16",
            "parameters": {"num_inference_steps": 30, "guidance_scale": 7.5},
            "license_info": {"type": "MIT", "commercial_use": true},
            "components": {
                "lora": {"repo_id": "org/lora", "weight_name": "lora.safetensors", "scale": 0.8}
            }
        }"#;
        let raw: RawModelDescriptor = serde_json::from_str(json).unwrap();
        let descriptor = ModelDescriptor::from_raw("config-test-model", raw).unwrap();

        assert_eq!(descriptor.repo_id, "test/config-model");
        assert_eq!(descriptor.model_type, ModelType::Sd15);
        assert_eq!(descriptor.parameters.num_inference_steps, Some(30));
        let license = descriptor.license_info.as_ref().unwrap();
        assert_eq!(license.kind, "MIT");
        assert!(license.commercial_use);
        assert!(!license.requires_agreement);
        assert_eq!(descriptor.components["lora"].scale, 0.8);
    }

    #[test]
    fn test_component_validation() {
        let result = ModelDescriptor::new("m", "org/m", "flux").map(|d| {
            d.with_component(
                "lora",
                ComponentDescriptor {
                    repo_id: "org/lora".to_string(),
                    weight_name: "../escape.safetensors".to_string(),
                    scale: 1.0,
                },
            )
        });
        assert!(result.unwrap().validate().is_err());
    }

    #[test]
    fn test_component_key_must_be_one_segment() {
        let lora = ComponentDescriptor {
            repo_id: "org/lora".to_string(),
            weight_name: "w.safetensors".to_string(),
            scale: 1.0,
        };
        let base = ModelDescriptor::new("m", "org/m", "flux").unwrap();

        for key in ["../../escaped", "/abs", "a/b", "..", ".hidden", "", "a\\b"] {
            let descriptor = base.clone().with_component(key, lora.clone());
            assert!(descriptor.validate().is_err(), "key {key:?} accepted");
        }
        assert!(base.with_component("style-lora", lora).validate().is_ok());
    }

    #[test]
    fn test_absolute_weight_name_rejected() {
        let descriptor = ModelDescriptor::new("m", "org/m", "flux")
            .unwrap()
            .with_component(
                "lora",
                ComponentDescriptor {
                    repo_id: "org/lora".to_string(),
                    weight_name: "/etc/passwd".to_string(),
                    scale: 1.0,
                },
            );
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("flux.1-dev").is_ok());
        assert!(validate_name("org/custom").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("a/../b").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("trailing/").is_err());
        assert!(validate_name("org--m").is_err());
        assert!(validate_name("org-/m").is_err());
        assert!(validate_name("org/-m").is_err());
    }

    #[test]
    fn test_dir_name() {
        assert_eq!(model_dir_name("flux.1-dev"), "flux.1-dev");
        assert_eq!(model_dir_name("org/custom"), "org--custom");
    }

    #[test]
    fn test_dir_names_do_not_collide() {
        // Both would map to "org--m"
        assert!(validate_name("org/m").is_ok());
        assert!(ModelDescriptor::new("org--m", "other/m", "flux").is_err());
    }

    #[test]
    fn test_raw_roundtrip_keeps_fields() {
        let descriptor = ModelDescriptor::new("m", "org/m", "sdxl")
            .unwrap()
            .with_variant("fp16");
        let raw = RawModelDescriptor::from(&descriptor);
        let rebuilt = ModelDescriptor::from_raw("m", raw).unwrap();
        assert_eq!(descriptor, rebuilt);
    }

    #[test]
    fn test_declared_disk_bytes() {
        let descriptor = ModelDescriptor::new("m", "org/m", "flux")
            .unwrap()
            .with_hardware(HardwareRequirements {
                disk_space_gb: Some(2.0),
                ..Default::default()
            });
        assert_eq!(descriptor.declared_disk_bytes(), Some(2 * 1024 * 1024 * 1024));
    }
}
