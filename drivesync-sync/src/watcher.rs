//! The change-detection abstraction shared by both sides.

use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use drivesync_core::{ChangeKey, FileSystem};

use crate::error::SyncError;
use crate::pending::{EchoFilter, PendingChangeSet};

/// The tracked-tree model, read and updated by both handlers.
pub type SharedFileSystem = Arc<RwLock<FileSystem>>;

pub fn shared(fs: FileSystem) -> SharedFileSystem {
    Arc::new(RwLock::new(fs))
}

// A panic while holding the lock leaves the model as it was after the last
// completed per-entry update, which is still consistent.
pub fn read_fs(fs: &SharedFileSystem) -> RwLockReadGuard<'_, FileSystem> {
    fs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn write_fs(fs: &SharedFileSystem) -> RwLockWriteGuard<'_, FileSystem> {
    fs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Accumulates pending changes of one origin.
///
/// Implementations differ only in how they detect changes; pending storage
/// and echo suppression are shared.
pub trait ChangesWatcher<K: ChangeKey> {
    /// What one detection step consumes: a raw local event, or nothing for a
    /// remote poll.
    type Input;

    /// Run one detection step. Returns how many changes were queued.
    fn observe(&self, input: Self::Input) -> Result<usize, SyncError>;

    fn pending(&self) -> &PendingChangeSet<K>;

    fn echo_filter(&self) -> &EchoFilter<K>;

    /// Mark `keys` as already applied by the opposite side: pending entries
    /// are dropped and late notifications for them are filtered.
    fn ignore_changes(&self, keys: &HashSet<K>) -> usize {
        self.echo_filter().suppress(keys.iter().cloned());
        self.pending().remove_all(keys)
    }
}
