//! Error types for lifecycle operations
//!
//! Every public manager operation returns a [`ManagerResult`]. Low-level io and
//! network failures are classified into one of these variants before they
//! reach callers.

use crate::models::hub::HubError;
use thiserror::Error;

/// Classified lifecycle errors
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("repository '{repo_id}' is unreachable: {reason}")]
    RepositoryUnreachable { repo_id: String, reason: String },

    #[error("repository '{repo_id}' requires authorization (set HF_TOKEN and accept the license)")]
    RepositoryGated { repo_id: String },

    #[error("transfer of '{name}' failed: {reason}")]
    TransferFailed { name: String, reason: String },

    #[error("transfer of '{name}' was interrupted; run the install again to resume")]
    TransferInterrupted { name: String },

    #[error("'{name}' failed integrity verification: {detail}")]
    IntegrityMismatch { name: String, detail: String },

    #[error("invalid registry entry '{name}': {reason}")]
    RegistryValidation { name: String, reason: String },

    #[error("model '{0}' is not in the registry")]
    ModelNotFound(String),

    #[error("failed to load '{name}': {reason}")]
    LoadFailure { name: String, reason: String },

    #[error("generation with '{name}' failed: {reason}")]
    Generation { name: String, reason: String },

    #[error("a download of '{name}' is already running (pid {pid})")]
    DownloadInProgress { name: String, pid: u32 },

    #[error("model '{name}' is not ready ({state})")]
    NotReady { name: String, state: String },

    #[error("no model is loaded")]
    NoModelLoaded,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ManagerError {
    /// Build a registry validation error
    pub fn validation(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RegistryValidation {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying (or resuming) the same operation can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RepositoryUnreachable { .. }
                | Self::TransferFailed { .. }
                | Self::TransferInterrupted { .. }
                | Self::DownloadInProgress { .. }
        )
    }
}

impl From<HubError> for ManagerError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::Unreachable { repo_id, reason } => {
                Self::RepositoryUnreachable { repo_id, reason }
            }
            HubError::Gated { repo_id } => Self::RepositoryGated { repo_id },
            HubError::Transfer { path, reason } => Self::TransferFailed {
                name: path,
                reason,
            },
            HubError::Io(e) => Self::Io(e),
        }
    }
}

pub type ManagerResult<T> = std::result::Result<T, ManagerError>;
