//! drivesync core library: domain types, the tracked file tree, persisted
//! state and configuration.
//!
//! - [`types`]: identifiers, changes and remote metadata
//! - [`filesystem`]: [`FileSystem`], the revision-tracking tree model
//! - [`store`]: atomic load / save of the model
//! - [`config`]: YAML daemon configuration
//! - [`error`]: [`StateError`], [`ConfigError`]

pub mod config;
pub mod error;
pub mod filesystem;
pub mod store;
pub mod types;

pub use config::{Config, RemoteConfig};
pub use error::{ConfigError, StateError};
pub use filesystem::FileSystem;
pub use types::{
    Change, ChangeKey, ChangeKind, LocalMeta, RemoteChangePackage, RemoteFileMetadata, RemoteId,
    TrackedFile, ROOT_ID,
};
