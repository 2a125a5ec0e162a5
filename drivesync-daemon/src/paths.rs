use std::path::{Path, PathBuf};

pub use drivesync_core::config::base_dir_at as drivesync_root;
pub use drivesync_core::store::state_path_at as state_path;

pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn socket_path(home: &Path) -> PathBuf {
    drivesync_root(home).join(DAEMON_SOCKET)
}
