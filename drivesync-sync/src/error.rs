//! Error types for drivesync-sync.

use std::path::PathBuf;

use thiserror::Error;

use drivesync_core::StateError;

use crate::remote::RemoteError;

/// All errors that can arise while detecting or applying changes.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    /// An I/O error on the local tree, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("remote watcher polled before start()")]
    NotStarted,
}

impl SyncError {
    /// Whether the failed item should be retried on the next tick.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
