use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the daemon runtime and its control protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("config error: {0}")]
    Config(#[from] drivesync_core::ConfigError),

    #[error("state error: {0}")]
    State(#[from] drivesync_core::StateError),

    #[error("sync error: {0}")]
    Sync(#[from] drivesync_sync::SyncError),

    #[error("remote error: {0}")]
    Remote(#[from] drivesync_sync::RemoteError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
