//! Local inventory scanning
//!
//! Walks a model directory and reports what is on disk right now. The scan is
//! read-only and cheap enough to run on every progress tick, which is what lets
//! a second process observe a download it did not start.

use super::hub::PARTIAL_SUFFIX;
use super::manifest::{MANIFEST_FILE, MANIFEST_TMP_FILE};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;

/// Files present under a model directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalInventory {
    /// Relative path (`/`-separated) -> size in bytes
    pub files: BTreeMap<String, u64>,
    /// In-flight transfers keyed by their final relative path
    pub partial: BTreeMap<String, u64>,
    /// Bytes on disk, partials included
    pub total_bytes: u64,
}

impl LocalInventory {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.partial.is_empty()
    }

    pub fn has_partials(&self) -> bool {
        !self.partial.is_empty()
    }

    /// True if `entry` exists as a file or as a directory prefix
    pub fn contains_entry(&self, entry: &str) -> bool {
        let entry = entry.trim_end_matches('/');
        if self.files.contains_key(entry) {
            return true;
        }
        let prefix = format!("{entry}/");
        self.files
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(path, _)| path.starts_with(&prefix))
    }
}

/// Scan `root` recursively
///
/// A missing root yields an empty inventory. Symlinks are skipped rather than
/// followed, and lock files plus the install manifest are ignored.
pub fn scan_directory(root: &Path) -> io::Result<LocalInventory> {
    let mut inventory = LocalInventory::default();
    match std::fs::symlink_metadata(root) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Ok(inventory),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(inventory),
        Err(e) => return Err(e),
    }

    walk(root, "", &mut inventory)?;
    Ok(inventory)
}

fn walk(dir: &Path, prefix: &str, inventory: &mut LocalInventory) -> io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        // Directory removed mid-scan
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            tracing::debug!(path = ?entry.path(), "Skipping non UTF-8 file name");
            continue;
        };
        let meta = match std::fs::symlink_metadata(entry.path()) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        let rel = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };

        if meta.is_dir() {
            walk(&entry.path(), &rel, inventory)?;
        } else if meta.is_file() {
            if name.ends_with(".lock")
                || (prefix.is_empty() && (name == MANIFEST_FILE || name == MANIFEST_TMP_FILE))
            {
                continue;
            }
            let size = meta.len();
            inventory.total_bytes += size;
            match rel.strip_suffix(PARTIAL_SUFFIX) {
                Some(target) => {
                    inventory.partial.insert(target.to_string(), size);
                }
                None => {
                    inventory.files.insert(rel, size);
                }
            }
        }
    }

    Ok(())
}

/// Human-readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
