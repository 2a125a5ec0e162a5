//! The remote storage capability consumed by the watchers and handlers.

use std::path::{Path, PathBuf};

use thiserror::Error;

use drivesync_core::{RemoteChangePackage, RemoteFileMetadata, RemoteId};

#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network timeout, rate limit, unreachable share. Retried next tick.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("remote object {0} not found")]
    NotFound(RemoteId),

    /// The backend refused the request (bad name, parent is a file, ...).
    #[error("remote rejected request: {0}")]
    Rejected(String),

    /// Failure reading or writing a local file during a transfer.
    #[error("local I/O error at {path}: {source}")]
    Local {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failure on the backend's own storage.
    #[error("remote storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("remote index is corrupt: {0}")]
    Corrupt(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_) | RemoteError::Storage { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

pub(crate) fn local_err(path: impl Into<PathBuf>, source: std::io::Error) -> RemoteError {
    RemoteError::Local {
        path: path.into(),
        source,
    }
}

/// A remote tree exposing one global change sequence.
///
/// Every call may fail with a transient error; callers retry on their next
/// scheduled tick rather than looping here.
pub trait RemoteBackend: Send + Sync {
    /// Largest revision the backend has issued.
    fn current_revision(&self) -> Result<u64, RemoteError>;

    /// Latest state of every object changed after `since`.
    fn poll_changes(&self, since: u64) -> Result<RemoteChangePackage, RemoteError>;

    /// Upload `local` as a new file named after it under `parent`.
    fn upload(&self, parent: &RemoteId, local: &Path) -> Result<RemoteFileMetadata, RemoteError>;

    /// Replace the contents of an existing file with `local`.
    fn update(&self, id: &RemoteId, local: &Path) -> Result<RemoteFileMetadata, RemoteError>;

    /// Write the contents of `id` to `destination`.
    fn download(&self, id: &RemoteId, destination: &Path) -> Result<(), RemoteError>;

    /// Delete `id` and, for directories, everything beneath it.
    fn delete(&self, id: &RemoteId) -> Result<(), RemoteError>;

    fn create_directory(
        &self,
        parent: &RemoteId,
        name: &str,
    ) -> Result<RemoteFileMetadata, RemoteError>;

    /// Move and/or rename `id`.
    fn move_to(
        &self,
        id: &RemoteId,
        new_parent: &RemoteId,
        new_name: &str,
    ) -> Result<RemoteFileMetadata, RemoteError>;

    fn list_children(&self, parent: &RemoteId) -> Result<Vec<RemoteFileMetadata>, RemoteError>;

    /// Child of `parent` whose name or id equals `name_or_id`.
    fn find_child(
        &self,
        parent: &RemoteId,
        name_or_id: &str,
    ) -> Result<Option<RemoteFileMetadata>, RemoteError>;
}

/// File name of `local` as the backend will store it.
pub(crate) fn upload_name(local: &Path) -> Result<String, RemoteError> {
    local
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| {
            RemoteError::Rejected(format!("'{}' has no UTF-8 file name", local.display()))
        })
}
