//! Inference engine seam
//!
//! Pipeline execution lives outside this crate. The manager only needs to
//! load a verified model directory, run generations against it and release
//! it again; [`InferenceEngine`] is that contract.

pub mod process;

use crate::models::{GenerationParameters, ModelDescriptor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use process::ProcessEngine;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start worker: {0}")]
    Spawn(String),

    #[error("out of GPU memory: {0}")]
    OutOfMemory(String),

    #[error("{0}")]
    Load(String),

    #[error("timed out after {0}s waiting for the model to load")]
    Timeout(u64),

    #[error("worker protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Generation(String),

    #[error("no loaded model with handle {0}")]
    UnknownHandle(u64),
}

/// Opaque reference to a model held by an engine
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineHandle {
    pub id: u64,
    pub model: String,
}

/// One image generation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_inference_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sequence_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Where the worker should write the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Fill unset knobs from a model's defaults
    pub fn with_defaults(mut self, defaults: &GenerationParameters) -> Self {
        self.num_inference_steps = self.num_inference_steps.or(defaults.num_inference_steps);
        self.guidance_scale = self.guidance_scale.or(defaults.guidance_scale);
        self.max_sequence_length = self.max_sequence_length.or(defaults.max_sequence_length);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub path: PathBuf,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub elapsed_ms: Option<u64>,
}

/// External pipeline runtime
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Materialise the model stored at `model_dir`
    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        model_dir: &Path,
    ) -> Result<EngineHandle, EngineError>;

    /// Release everything held for `handle`
    async fn unload(&self, handle: EngineHandle) -> Result<(), EngineError>;

    async fn generate(
        &self,
        handle: &EngineHandle,
        request: &GenerationRequest,
    ) -> Result<GeneratedImage, EngineError>;
}
