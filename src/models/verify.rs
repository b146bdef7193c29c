//! Integrity verification
//!
//! Compares a local inventory with the repository index. Byte sizes are the
//! only integrity signal; when the hub gives no sizes the check degrades to a
//! structural one driven by the model family.

use super::hub::RepoIndex;
use super::inventory::LocalInventory;
use serde::Serialize;

/// A present file whose size differs from the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizeMismatch {
    pub path: String,
    pub actual: u64,
    pub expected: u64,
}

/// Verifier verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum Verification {
    Complete,
    /// Sorted relative paths (or structural entries) not on disk
    Missing(Vec<String>),
    SizeMismatch(Vec<SizeMismatch>),
    /// No size info and no structural expectations
    Indeterminate,
}

impl Verification {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }

    /// One-line summary for logs and errors
    pub fn summary(&self) -> String {
        match self {
            Self::Complete => "complete".to_string(),
            Self::Missing(paths) => match paths.as_slice() {
                [] => "missing files".to_string(),
                [only] => format!("missing {only}"),
                [first, rest @ ..] => format!("missing {first} and {} more", rest.len()),
            },
            Self::SizeMismatch(mismatches) => match mismatches.first() {
                Some(m) => format!(
                    "size mismatch on {} file(s), e.g. {} ({} of {} bytes)",
                    mismatches.len(),
                    m.path,
                    m.actual,
                    m.expected
                ),
                None => "size mismatch".to_string(),
            },
            Self::Indeterminate => "indeterminate (no size info)".to_string(),
        }
    }
}

/// Decide whether `inventory` is a complete copy
///
/// Missing files take priority over size mismatches. `required_structure` is
/// only consulted when `index` is absent or carries no sizes.
pub fn verify(
    index: Option<&RepoIndex>,
    inventory: &LocalInventory,
    required_structure: &[&str],
) -> Verification {
    match index {
        Some(index) if index.has_size_info() => verify_sizes(index, inventory),
        _ => verify_structure(inventory, required_structure),
    }
}

fn verify_sizes(index: &RepoIndex, inventory: &LocalInventory) -> Verification {
    let missing: Vec<String> = index
        .files
        .keys()
        .filter(|path| !inventory.files.contains_key(*path))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Verification::Missing(missing);
    }

    let mismatched: Vec<SizeMismatch> = index
        .files
        .iter()
        .filter(|(_, expected)| **expected > 0)
        .filter_map(|(path, expected)| {
            let actual = inventory.files.get(path).copied().unwrap_or(0);
            (actual != *expected).then(|| SizeMismatch {
                path: path.clone(),
                actual,
                expected: *expected,
            })
        })
        .collect();
    if !mismatched.is_empty() {
        return Verification::SizeMismatch(mismatched);
    }

    Verification::Complete
}

fn verify_structure(inventory: &LocalInventory, required_structure: &[&str]) -> Verification {
    if required_structure.is_empty() {
        return Verification::Indeterminate;
    }

    let mut missing: Vec<String> = required_structure
        .iter()
        .filter(|entry| !inventory.contains_entry(entry))
        .map(|entry| entry.to_string())
        .collect();
    missing.sort();

    if missing.is_empty() {
        Verification::Complete
    } else {
        Verification::Missing(missing)
    }
}
