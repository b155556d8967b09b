//! Artifact store management.
//!
//! One directory holds the active dataset, the trained model and its
//! auxiliary artifacts (feature ordering, encoders, metadata). The store is
//! never versioned: accepting a new upload destroys every prior dataset and
//! every derived artifact *before* training starts, so a failed run leaves no
//! model rather than a stale one.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::config::{is_bare_file_name, StoreConfig};

/// Extension every dataset file carries.
const DATASET_EXT: &str = ".csv";
/// Extension of opaque serialized artifacts written by the training job.
const PICKLE_EXT: &str = ".pkl";

/// Files removed (or not) by [`ArtifactStore::clear_for_upload`].
#[derive(Debug, Default, Clone)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    /// `(file name, error message)` for every deletion that failed.
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    layout: StoreConfig,
}

impl ArtifactStore {
    pub fn new(layout: StoreConfig) -> Self {
        Self { layout }
    }

    pub fn dir(&self) -> &Path {
        &self.layout.dir
    }

    pub fn layout(&self) -> &StoreConfig {
        &self.layout
    }

    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.layout.dir).with_context(|| {
            format!(
                "Failed to create artifact directory: {}",
                self.layout.dir.display()
            )
        })
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.layout.dir.join(name)
    }

    pub fn model_path(&self) -> PathBuf {
        self.path_of(&self.layout.model_file)
    }

    pub fn features_path(&self) -> PathBuf {
        self.path_of(&self.layout.features_file)
    }

    pub fn encoders_path(&self) -> PathBuf {
        self.path_of(&self.layout.encoders_file)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.path_of(&self.layout.metadata_file)
    }

    /// A model counts as trained once its metadata document exists.
    pub fn has_model(&self) -> bool {
        self.metadata_path().is_file()
    }

    fn is_model_artifact(&self, name: &str) -> bool {
        name == self.layout.model_file
            || name == self.layout.features_file
            || name == self.layout.encoders_file
            || name == self.layout.metadata_file
            || name.to_ascii_lowercase().ends_with(PICKLE_EXT)
    }

    /// Removes every dataset other than `keep` and every model artifact.
    ///
    /// Best effort: a file that cannot be deleted is logged and reported,
    /// never propagated.
    pub fn clear_for_upload(&self, keep: &str) -> CleanupReport {
        let mut report = CleanupReport::default();

        let entries = match std::fs::read_dir(&self.layout.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    dir = %self.layout.dir.display(),
                    error = %e,
                    "cannot list artifact directory, skipping cleanup"
                );
                return report;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file || name == keep {
                continue;
            }
            if !(is_dataset_file(&name) || self.is_model_artifact(&name)) {
                continue;
            }

            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    tracing::debug!(file = %name, "removed stale artifact");
                    report.removed.push(name);
                }
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "failed to remove stale artifact");
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        report.removed.sort();
        report
    }

    /// Writes the uploaded dataset, replacing any file of the same name.
    ///
    /// The bytes land in a temporary sibling first and are renamed into place,
    /// so readers never observe a half-written dataset.
    pub fn write_dataset(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.ensure_dir()?;
        let target = self.path_of(name);
        let staging = self.path_of(&format!(".{}.upload", name));
        std::fs::write(&staging, bytes)
            .with_context(|| format!("Failed to write upload: {}", staging.display()))?;
        std::fs::rename(&staging, &target)
            .with_context(|| format!("Failed to move upload into place: {}", target.display()))?;
        Ok(())
    }

    /// Finds the dataset left behind by a previous process.
    ///
    /// The single-dataset invariant means there is normally at most one
    /// `*.csv`; if several survived a crashed cleanup, the configured default
    /// wins, then the lexically first name.
    pub fn discover_active_dataset(&self) -> Option<String> {
        let entries = std::fs::read_dir(&self.layout.dir).ok()?;
        let mut datasets: Vec<String> = entries
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| is_dataset_file(name))
            .collect();
        datasets.sort();

        if datasets.iter().any(|d| *d == self.layout.default_dataset) {
            return Some(self.layout.default_dataset.clone());
        }
        datasets.into_iter().next()
    }
}

pub fn is_dataset_file(name: &str) -> bool {
    !name.starts_with('.') && name.to_ascii_lowercase().ends_with(DATASET_EXT)
}

/// Reduces a client-supplied file name to a safe dataset name.
///
/// Any directory part is discarded. Returns `None` for names that are empty
/// or are not `.csv` files.
pub fn sanitize_upload_name(raw: &str) -> Option<String> {
    let name = raw.rsplit(|c| c == '/' || c == '\\').next()?.trim();
    if is_bare_file_name(name) && is_dataset_file(name) {
        Some(name.to_string())
    } else {
        None
    }
}

/// Hex-encoded SHA-256 of an uploaded dataset.
pub fn dataset_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
