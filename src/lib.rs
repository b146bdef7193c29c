//! Diffuser Manager - lifecycle manager for hub-hosted diffusion models
//!
//! Keeps a merged registry of known models, downloads and verifies their
//! repositories resumably, and tracks which model is loaded into the
//! external inference engine.

pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod manager;
pub mod metrics;
pub mod models;

pub use config::ManagerConfig;
pub use download::{DownloadOrchestrator, DownloadReport, DownloadState, ProgressSnapshot};
pub use engine::{GeneratedImage, GenerationRequest, InferenceEngine, ProcessEngine};
pub use error::{ManagerError, ManagerResult};
pub use manager::{LoadedSlot, ModelInfo, ModelManager, ModelState};
pub use models::{HfHubClient, HubClient, ModelDescriptor, ModelRegistry, RegistryTier};
