//! Error types for drivesync-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::RemoteId;

/// Errors raised by the tracked file tree and its persisted form.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error (save path).
    #[error("state JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON parse error on load, with the offending file.
    #[error("failed to parse state at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("parent {parent} of {id} is not tracked")]
    UnknownParent { id: RemoteId, parent: RemoteId },

    #[error("{0} is not tracked")]
    UnknownEntry(RemoteId),

    #[error("'{name}' is already tracked under {parent} as {existing}")]
    NameTaken {
        parent: RemoteId,
        name: String,
        existing: RemoteId,
    },

    #[error("moving {id} under {parent} would create a cycle")]
    Cycle { id: RemoteId, parent: RemoteId },

    #[error("the root entry cannot be moved or removed")]
    RootImmutable,

    /// Persisted state violates a tree invariant.
    #[error("state integrity error: {0}")]
    Integrity(String),
}

/// Errors raised while loading or writing the daemon configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("config not found at {path}; run `drivesync init` first")]
    NotFound { path: PathBuf },

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    #[error("{field} must be at least 1 second")]
    InvalidInterval { field: &'static str },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StateError {
    StateError::Io {
        path: path.into(),
        source,
    }
}
