//! Model catalogue and on-disk state
//!
//! Provides functionality for:
//! - Describing installable models and merging registry tiers
//! - Listing repository files on the hub and fetching them resumably
//! - Scanning a model directory and verifying it against the repository index
//! - Recording install manifests for offline verification

pub mod builtin;
pub mod descriptor;
pub mod hub;
pub mod inventory;
pub mod manifest;
pub mod registry;
pub mod verify;

pub use builtin::builtin_models;
pub use descriptor::{
    ComponentDescriptor, GenerationParameters, HardwareRequirements, LicenseInfo, ModelDescriptor,
    ModelType, RawModelDescriptor, model_dir_name,
};
pub use hub::{HfHubClient, HubClient, HubError, RemoteFile, RepoIndex};
pub use inventory::{LocalInventory, format_bytes, scan_directory};
pub use manifest::InstallManifest;
pub use registry::{DocumentFormat, LoadReport, ModelRegistry, RegistryTier, SkippedEntry};
pub use verify::{SizeMismatch, Verification, verify};
