//! Install manifest
//!
//! `.manifest.json` is written into a model directory when a download starts
//! and stamped with `completed_at` once the download verifies. It records the
//! expected file index, so status queries can verify without a hub round-trip
//! and a complete directory can still be identified after its registry entry
//! disappears.

use super::descriptor::ModelDescriptor;
use super::hub::RepoIndex;
use crate::error::{ManagerError, ManagerResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const MANIFEST_FILE: &str = ".manifest.json";
pub(crate) const MANIFEST_TMP_FILE: &str = ".manifest.tmp";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallManifest {
    pub name: String,
    pub repo_id: String,
    pub model_type: String,
    /// Expected relative path -> size (0 when the hub reported none)
    pub files: BTreeMap<String, u64>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl InstallManifest {
    pub fn new(descriptor: &ModelDescriptor, index: &RepoIndex) -> Self {
        Self {
            name: descriptor.name.clone(),
            repo_id: descriptor.repo_id.clone(),
            model_type: descriptor.model_type.to_string(),
            files: index.files.clone(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Read the manifest of a model directory
    ///
    /// Returns `None` when there is no manifest or it cannot be parsed; the
    /// latter is logged, and callers fall back to a live hub query.
    pub fn load(model_dir: &Path) -> Option<Self> {
        let path = model_dir.join(MANIFEST_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read install manifest");
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt install manifest");
                None
            }
        }
    }

    /// Write atomically (tmp + rename)
    pub fn save(&self, model_dir: &Path) -> ManagerResult<()> {
        fs::create_dir_all(model_dir)?;

        let tmp_path = model_dir.join(MANIFEST_TMP_FILE);
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ManagerError::Config(format!("failed to serialize manifest: {e}")))?;

        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, model_dir.join(MANIFEST_FILE))?;
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn mark_completed(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    /// Add an expected file (component weights land here)
    pub fn expect_file(&mut self, path: impl Into<String>, size: u64) {
        self.files.insert(path.into(), size);
    }

    /// Expected index for offline verification
    pub fn expected_index(&self) -> RepoIndex {
        RepoIndex {
            repo_id: self.repo_id.clone(),
            files: self.files.clone(),
        }
    }
}
