//! Built-in model catalogue
//!
//! The lowest-precedence registry tier. Registry documents and runtime
//! additions override these entries by name.

use super::descriptor::{
    ComponentDescriptor, GenerationParameters, HardwareRequirements, LicenseInfo, ModelDescriptor,
    ModelType,
};
use std::collections::BTreeMap;

struct Builtin {
    name: &'static str,
    repo_id: &'static str,
    model_type: ModelType,
    variant: &'static str,
    steps: u32,
    guidance: f32,
    max_sequence_length: Option<u32>,
    license: (&'static str, bool, bool),
    // (min vram, recommended vram, min ram, disk) in GB
    hardware: (f32, f32, f32, f32),
    notes: &'static str,
}

fn catalogue() -> Vec<Builtin> {
    vec![
        Builtin {
            name: "flux.1-dev",
            repo_id: "black-forest-labs/FLUX.1-dev",
            model_type: ModelType::Flux,
            variant: "bf16",
            steps: 50,
            guidance: 3.5,
            max_sequence_length: Some(512),
            license: ("FLUX.1 [dev] Non-Commercial License", true, false),
            hardware: (12.0, 24.0, 16.0, 15.0),
            notes: "Best quality FLUX model; needs a high-end GPU",
        },
        Builtin {
            name: "flux.1-schnell",
            repo_id: "black-forest-labs/FLUX.1-schnell",
            model_type: ModelType::Flux,
            variant: "bf16",
            steps: 4,
            guidance: 0.0,
            max_sequence_length: Some(256),
            license: ("Apache 2.0", false, true),
            hardware: (12.0, 24.0, 16.0, 15.0),
            notes: "Distilled for 4-step generation",
        },
        Builtin {
            name: "stable-diffusion-3.5-medium",
            repo_id: "stabilityai/stable-diffusion-3.5-medium",
            model_type: ModelType::Sd3,
            variant: "fp16",
            steps: 28,
            guidance: 3.5,
            max_sequence_length: None,
            license: ("Stability AI Community License", true, true),
            hardware: (8.0, 12.0, 16.0, 10.0),
            notes: "Good quality-to-speed ratio",
        },
        Builtin {
            name: "stable-diffusion-xl-base",
            repo_id: "stabilityai/stable-diffusion-xl-base-1.0",
            model_type: ModelType::Sdxl,
            variant: "fp16",
            steps: 50,
            guidance: 7.5,
            max_sequence_length: None,
            license: ("CreativeML Open RAIL++-M", false, true),
            hardware: (6.0, 10.0, 16.0, 7.0),
            notes: "1024px native resolution",
        },
        Builtin {
            name: "stable-diffusion-1.5",
            repo_id: "stable-diffusion-v1-5/stable-diffusion-v1-5",
            model_type: ModelType::Sd15,
            variant: "fp16",
            steps: 50,
            guidance: 7.5,
            max_sequence_length: None,
            license: ("CreativeML Open RAIL-M", false, true),
            hardware: (4.0, 6.0, 8.0, 5.0),
            notes: "Smallest model, runs on most hardware",
        },
        Builtin {
            name: "controlnet-canny-sd15",
            repo_id: "lllyasviel/sd-controlnet-canny",
            model_type: ModelType::ControlnetSd15,
            variant: "fp16",
            steps: 50,
            guidance: 7.5,
            max_sequence_length: None,
            license: ("CreativeML Open RAIL-M", false, true),
            hardware: (6.0, 8.0, 8.0, 3.0),
            notes: "Edge-guided generation on top of stable-diffusion-1.5",
        },
    ]
}

impl From<Builtin> for ModelDescriptor {
    fn from(b: Builtin) -> Self {
        let (min_vram, recommended_vram, min_ram, disk) = b.hardware;
        let (kind, requires_agreement, commercial_use) = b.license;
        Self {
            name: b.name.to_string(),
            repo_id: b.repo_id.to_string(),
            model_type: b.model_type,
            variant: Some(b.variant.to_string()),
            parameters: GenerationParameters {
                num_inference_steps: Some(b.steps),
                guidance_scale: Some(b.guidance),
                max_sequence_length: b.max_sequence_length,
            },
            license_info: Some(LicenseInfo {
                kind: kind.to_string(),
                requires_agreement,
                commercial_use,
            }),
            hardware_requirements: Some(HardwareRequirements {
                min_vram_gb: Some(min_vram),
                recommended_vram_gb: Some(recommended_vram),
                min_ram_gb: Some(min_ram),
                disk_space_gb: Some(disk),
                performance_notes: Some(b.notes.to_string()),
            }),
            components: BTreeMap::new(),
        }
    }
}

/// All built-in descriptors
pub fn builtin_models() -> Vec<ModelDescriptor> {
    let mut models: Vec<ModelDescriptor> = catalogue().into_iter().map(Into::into).collect();

    // Same repository as flux.1-dev with a style LoRA fused at load time
    let ghibli = catalogue()
        .into_iter()
        .find(|b| b.name == "flux.1-dev")
        .map(ModelDescriptor::from)
        .map(|mut d| {
            d.name = "flux.1-dev-ghibli".to_string();
            d.with_component(
                "lora",
                ComponentDescriptor {
                    repo_id: "openfree/flux-chatgpt-ghibli-lora".to_string(),
                    weight_name: "flux-chatgpt-ghibli-lora.safetensors".to_string(),
                    scale: 1.0,
                },
            )
        });
    models.extend(ghibli);
    models
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_valid() {
        for model in builtin_models() {
            assert!(model.validate().is_ok(), "invalid builtin {}", model.name);
        }
    }

    #[test]
    fn test_builtin_names_unique() {
        let models = builtin_models();
        let mut names: Vec<_> = models.iter().map(|m| m.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), models.len());
    }

    #[test]
    fn test_expected_builtins_present() {
        let models = builtin_models();
        for expected in ["flux.1-dev", "flux.1-schnell", "stable-diffusion-xl-base"] {
            assert!(models.iter().any(|m| m.name == expected), "missing {expected}");
        }
    }

    #[test]
    fn test_schnell_defaults() {
        let schnell = builtin_models()
            .into_iter()
            .find(|m| m.name == "flux.1-schnell")
            .unwrap();
        assert_eq!(schnell.parameters.num_inference_steps, Some(4));
        assert_eq!(schnell.parameters.guidance_scale, Some(0.0));
        assert!(!schnell.requires_agreement());
    }

    #[test]
    fn test_ghibli_shares_repo_with_dev() {
        let models = builtin_models();
        let dev = models.iter().find(|m| m.name == "flux.1-dev").unwrap();
        let ghibli = models.iter().find(|m| m.name == "flux.1-dev-ghibli").unwrap();
        assert_eq!(dev.repo_id, ghibli.repo_id);
        assert!(ghibli.components.contains_key("lora"));
        assert!(dev.components.is_empty());
    }
}
