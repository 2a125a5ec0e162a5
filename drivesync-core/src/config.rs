//! Daemon configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.drivesync/
//!   config.yaml   (mode 0600, written by `drivesync init`)
//!   state.json    (see `store`)
//! ```
//!
//! Every function has an `_at(home: &Path, …)` form; the no-arg wrappers
//! derive home from `dirs::home_dir()`. Tests only call the `_at` forms.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_MERGE_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_LOCAL_ECHO_WINDOW_SECS: u64 = 5;
pub const DEFAULT_REMOTE_ECHO_WINDOW_SECS: u64 = 30;

/// Where the remote tree lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RemoteConfig {
    /// A directory (usually a mounted share) holding the remote index and blobs.
    Folder { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Local directory kept in sync.
    pub root: PathBuf,
    pub remote: RemoteConfig,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_merge_interval")]
    pub merge_interval_secs: u64,
    #[serde(default = "default_local_echo_window")]
    pub local_echo_window_secs: u64,
    #[serde(default = "default_remote_echo_window")]
    pub remote_echo_window_secs: u64,
    /// File-name patterns never synced. `*` is allowed at either end.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<String>,
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_merge_interval() -> u64 {
    DEFAULT_MERGE_INTERVAL_SECS
}
fn default_local_echo_window() -> u64 {
    DEFAULT_LOCAL_ECHO_WINDOW_SECS
}
fn default_remote_echo_window() -> u64 {
    DEFAULT_REMOTE_ECHO_WINDOW_SECS
}

impl Config {
    pub fn new(root: PathBuf, remote: RemoteConfig) -> Self {
        Self {
            root,
            remote,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            merge_interval_secs: DEFAULT_MERGE_INTERVAL_SECS,
            local_echo_window_secs: DEFAULT_LOCAL_ECHO_WINDOW_SECS,
            remote_echo_window_secs: DEFAULT_REMOTE_ECHO_WINDOW_SECS,
            ignore: Vec::new(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn merge_interval(&self) -> Duration {
        Duration::from_secs(self.merge_interval_secs)
    }

    pub fn local_echo_window(&self) -> Duration {
        Duration::from_secs(self.local_echo_window_secs)
    }

    pub fn remote_echo_window(&self) -> Duration {
        Duration::from_secs(self.remote_echo_window_secs)
    }

    /// Reject zero intervals, which would spin the scheduler.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidInterval {
                field: "poll_interval_secs",
            });
        }
        if self.merge_interval_secs == 0 {
            return Err(ConfigError::InvalidInterval {
                field: "merge_interval_secs",
            });
        }
        Ok(())
    }

    /// `true` when `name` matches one of the ignore patterns.
    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignore.iter().any(|pattern| pattern_matches(pattern, name))
    }
}

/// Match `name` against an ignore pattern (`*` allowed at either end).
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(_), Some(_)) if pattern.len() >= 2 => name.contains(&pattern[1..pattern.len() - 1]),
        (Some(suffix), _) => name.ends_with(suffix),
        (_, Some(prefix)) => name.starts_with(prefix),
        _ => name == pattern,
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// `<home>/.drivesync/`
pub fn base_dir_at(home: &Path) -> PathBuf {
    home.join(".drivesync")
}

/// `<home>/.drivesync/config.yaml`
pub fn config_path_at(home: &Path) -> PathBuf {
    base_dir_at(home).join("config.yaml")
}

/// Load and validate the configuration.
///
/// Returns `ConfigError::NotFound` if absent and `ConfigError::Parse` (with
/// the file path) if malformed.
pub fn load_at(home: &Path) -> Result<Config, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Err(ConfigError::NotFound { path });
    }
    let contents = std::fs::read_to_string(&path)?;
    let config: Config =
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })?;
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<Config, ConfigError> {
    load_at(&home()?)
}

/// Write `config` atomically (mode 0600, directory 0700).
pub fn save_at(home: &Path, config: &Config) -> Result<(), ConfigError> {
    config.validate()?;
    let dir = base_dir_at(home);
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        set_dir_permissions(&dir)?;
    }
    let path = config_path_at(home);
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, serde_yaml::to_string(config)?)?;
    set_file_permissions(&tmp)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

/// Create a default configuration syncing `root` with a folder remote.
pub fn init_at(home: &Path, root: PathBuf, remote_path: PathBuf) -> Result<Config, ConfigError> {
    let config = Config::new(
        root,
        RemoteConfig::Folder { path: remote_path },
    );
    save_at(home, &config)?;
    Ok(config)
}

/// `init_at` convenience wrapper.
pub fn init(root: PathBuf, remote_path: PathBuf) -> Result<Config, ConfigError> {
    init_at(&home()?, root, remote_path)
}

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}
