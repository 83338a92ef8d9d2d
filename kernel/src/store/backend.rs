// Store Backend
//
// Defines the durability contract for the dedup document, and the
// JSON file implementation used in production.
//
// Save protocol for the file backend:
// 1. serialize the whole document to `<file>.<uuid>.tmp` beside the target
// 2. fsync the temp file
// 3. rename it over the target
// 4. fsync the parent directory
//
// A reader (or the next process) sees either the old or the new
// document, never a partial one.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::StoreError;
use crate::document::StoreDocument;

/// What a backend found when the store was opened.
#[derive(Debug)]
pub enum LoadOutcome {
    /// A valid document was read.
    Found(StoreDocument),

    /// Nothing was persisted yet.
    Missing,

    /// The persisted bytes were unreadable and have been set aside.
    Quarantined { quarantine: Option<PathBuf> },
}

/// Storage backend for the dedup document.
///
/// Properties required from implementations:
/// - `save` is atomic: after a crash the persisted document is either
///   the previous one or the new one
/// - a failed `save` leaves the previous document intact
/// - `load` never fails on unparsable content, only on I/O it cannot
///   recover from
pub trait StateBackend {
    /// Read the persisted document, if any.
    fn load(&self) -> Result<LoadOutcome, StoreError>;

    /// Durably replace the persisted document.
    fn save(&self, document: &StoreDocument) -> Result<(), StoreError>;

    /// Human-readable location, for logs.
    fn location(&self) -> String;
}

/// A single JSON file on the local filesystem.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling path that receives a copy of an unreadable document.
    pub fn quarantine_path(&self) -> PathBuf {
        sibling_with_suffix(&self.path, "corrupted")
    }

    fn quarantine(&self, bytes: &[u8]) -> Option<PathBuf> {
        let target = self.quarantine_path();
        match fs::write(&target, bytes) {
            Ok(()) => {
                tracing::info!(path = %target.display(), "unreadable store document quarantined");
                Some(target)
            }
            Err(error) => {
                tracing::warn!(
                    path = %target.display(),
                    %error,
                    "failed to quarantine unreadable store document"
                );
                None
            }
        }
    }
}

impl StateBackend for JsonFileBackend {
    fn load(&self) -> Result<LoadOutcome, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Ok(LoadOutcome::Missing)
            }
            Err(source) => {
                return Err(StoreError::Load {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        match serde_json::from_slice::<StoreDocument>(&bytes) {
            Ok(document) => Ok(LoadOutcome::Found(document)),
            Err(error) => {
                tracing::error!(
                    path = %self.path.display(),
                    %error,
                    "store document is corrupted, starting from empty state"
                );
                Ok(LoadOutcome::Quarantined {
                    quarantine: self.quarantine(&bytes),
                })
            }
        }
    }

    fn save(&self, document: &StoreDocument) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(document)?;
        write_atomic_with(&self.path, &bytes, |from, to| fs::rename(from, to))
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Atomically replace `path` with `bytes`.
///
/// `rename` performs the final step; it is a parameter so the failure
/// path can be exercised.
pub(crate) fn write_atomic_with<F>(path: &Path, bytes: &[u8], rename: F) -> Result<(), StoreError>
where
    F: FnOnce(&Path, &Path) -> io::Result<()>,
{
    let persist_error = |source| StoreError::Persist {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(persist_error)?;
    }

    let temp = sibling_with_suffix(path, &format!("{}.tmp", Uuid::new_v4().simple()));

    let staged = write_synced(&temp, bytes).and_then(|()| rename(&temp, path));
    if let Err(source) = staged {
        if let Err(cleanup) = fs::remove_file(&temp) {
            if cleanup.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %temp.display(), error = %cleanup, "failed to remove temp file");
            }
        }
        tracing::error!(path = %path.display(), error = %source, "failed to save store document");
        return Err(persist_error(source));
    }

    sync_parent_dir(path);
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

// The rename is already visible once we get here; a failed directory
// sync only weakens power-loss durability of the new entry.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return;
    };
    if let Err(error) = File::open(parent).and_then(|dir| dir.sync_all()) {
        tracing::warn!(path = %parent.display(), %error, "failed to sync store directory");
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
