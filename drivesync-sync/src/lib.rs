//! # drivesync-sync
//!
//! The reconciliation core: pending change sets on both sides, the handlers
//! that replay them onto the opposite side, and the [`ChangesApplier`] that
//! sequences one merge iteration.
//!
//! Everything here is synchronous and blocking; callers that live on an async
//! runtime run these calls on a blocking pool.

pub mod applier;
pub mod bootstrap;
pub mod error;
pub mod folder;
pub mod local_fs;
pub mod local_handler;
pub mod local_watcher;
pub mod memory;
pub mod pending;
pub mod remote;
pub mod remote_handler;
pub mod remote_watcher;
pub mod tree;
pub mod watcher;

pub use applier::{ChangesApplier, MergeSummary};
pub use bootstrap::{initial_sync, rescan, BootstrapReport, RescanReport};
pub use error::SyncError;
pub use folder::FolderBackend;
pub use local_handler::LocalChangesHandler;
pub use local_watcher::{LocalChangesWatcher, LocalEvent, LocalEventKind};
pub use memory::MemoryBackend;
pub use pending::{EchoFilter, PendingChangeSet};
pub use remote::{RemoteBackend, RemoteError};
pub use remote_handler::RemoteChangesHandler;
pub use remote_watcher::RemoteChangesWatcher;
pub use watcher::{read_fs, shared, write_fs, ChangesWatcher, SharedFileSystem};
