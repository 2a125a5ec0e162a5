//! Turns raw local filesystem notifications into pending `Change<PathBuf>`s.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use drivesync_core::config::pattern_matches;
use drivesync_core::{Change, ChangeKind, FileSystem};

use crate::error::SyncError;
use crate::local_fs::{file_checksum, is_tmp_path};
use crate::pending::{EchoFilter, PendingChangeSet};
use crate::watcher::{read_fs, ChangesWatcher, SharedFileSystem};

/// Backend-neutral raw event from the OS notification source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEvent {
    pub path: PathBuf,
    pub kind: LocalEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEventKind {
    Created,
    Modified,
    Removed,
    /// `path` is the new location.
    Renamed { from: PathBuf },
}

impl LocalEvent {
    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: LocalEventKind::Created,
        }
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: LocalEventKind::Modified,
        }
    }

    pub fn removed(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: LocalEventKind::Removed,
        }
    }

    pub fn renamed(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            path: to.into(),
            kind: LocalEventKind::Renamed { from: from.into() },
        }
    }
}

/// Pending local changes, keyed by absolute path below `root`.
///
/// Paths the remote side just wrote stay suppressed for the echo window, but
/// a notification for one is only dropped while the disk still matches the
/// model. An edit made inside the window is queued like any other.
#[derive(Debug)]
pub struct LocalChangesWatcher {
    root: PathBuf,
    fs: SharedFileSystem,
    ignore: Vec<String>,
    pending: PendingChangeSet<PathBuf>,
    echoes: EchoFilter<PathBuf>,
}

impl LocalChangesWatcher {
    pub fn new(root: impl Into<PathBuf>, fs: SharedFileSystem, echo_window: Duration) -> Self {
        Self {
            root: root.into(),
            fs,
            ignore: Vec::new(),
            pending: PendingChangeSet::new(),
            echoes: EchoFilter::new(echo_window),
        }
    }

    pub fn with_ignore(mut self, patterns: Vec<String>) -> Self {
        self.ignore = patterns;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether changes at `path` are synced at all.
    pub fn is_relevant(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        if relative.as_os_str().is_empty() || is_tmp_path(path) {
            return false;
        }
        relative.components().all(|component| match component {
            Component::Normal(name) => {
                let name = name.to_string_lossy();
                !self.ignore.iter().any(|pattern| pattern_matches(pattern, &name))
            }
            _ => false,
        })
    }

    /// Queue a change found by scanning rather than by notification.
    /// Echo suppression does not apply.
    pub fn enqueue(&self, change: Change<PathBuf>) -> bool {
        if !self.is_relevant(&change.key) {
            return false;
        }
        tracing::trace!("local {} (scan): {}", change.kind, change.key.display());
        self.pending.push(change);
        true
    }

    /// Queue `paths` as newly created, bypassing echo suppression.
    pub fn seed(&self, paths: impl IntoIterator<Item = PathBuf>) -> usize {
        paths
            .into_iter()
            .filter(|path| self.enqueue(Change::local(path.clone(), ChangeKind::Created)))
            .count()
    }

    /// Whether `change` only reflects what the model already records, i.e.
    /// the remote handler's own write.
    fn matches_model(&self, fs: &FileSystem, change: &Change<PathBuf>) -> bool {
        let gone = |path: &Path| {
            path.strip_prefix(&self.root)
                .map_or(true, |relative| fs.get_by_path(relative).is_none())
        };
        match change.kind {
            ChangeKind::Deleted => gone(&change.key),
            ChangeKind::Moved => {
                change.meta.moved_from.as_deref().map_or(true, gone)
                    && self.disk_matches(fs, &change.key)
            }
            ChangeKind::Created | ChangeKind::Modified => self.disk_matches(fs, &change.key),
        }
    }

    fn disk_matches(&self, fs: &FileSystem, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return true;
        };
        let Ok(metadata) = path.symlink_metadata() else {
            // Nothing left to upload.
            return true;
        };
        match fs.get_by_path(relative) {
            None => false,
            Some(entry) if entry.is_dir => metadata.is_dir(),
            Some(_) if metadata.is_dir() => false,
            Some(entry) => match file_checksum(path) {
                Ok((checksum, _)) => entry.checksum.as_deref() == Some(checksum.as_str()),
                Err(_) => true,
            },
        }
    }

    fn is_echo(&self, change: &Change<PathBuf>) -> bool {
        self.echoes.is_suppressed(&change.key) && self.matches_model(&read_fs(&self.fs), change)
    }

    fn record(&self, change: Change<PathBuf>) -> usize {
        if self.is_echo(&change) {
            tracing::debug!("suppressed local echo: {}", change.key.display());
            return 0;
        }
        tracing::trace!("local {}: {}", change.kind, change.key.display());
        self.pending.push(change);
        1
    }

    fn record_rename(&self, from: PathBuf, to: PathBuf) -> usize {
        let change = match self.pending.take(&from) {
            // Never reached the remote: it is simply a new file at `to`.
            Some(previous) if previous.kind == ChangeKind::Created => {
                Change::local(to, ChangeKind::Created)
            }
            Some(previous) => match previous.meta.moved_from {
                Some(origin) => Change::local_move(origin, to),
                None => Change::local_move(from, to),
            },
            None => Change::local_move(from, to),
        };
        self.record(change)
    }
}

impl ChangesWatcher<PathBuf> for LocalChangesWatcher {
    type Input = LocalEvent;

    fn observe(&self, event: LocalEvent) -> Result<usize, SyncError> {
        let LocalEvent { path, kind } = event;
        let queued = match kind {
            LocalEventKind::Renamed { from } => {
                match (self.is_relevant(&from), self.is_relevant(&path)) {
                    (true, true) => self.record_rename(from, path),
                    (false, true) => self.record(Change::local(path, ChangeKind::Created)),
                    (true, false) => self.record(Change::local(from, ChangeKind::Deleted)),
                    (false, false) => 0,
                }
            }
            _ if !self.is_relevant(&path) => 0,
            LocalEventKind::Created => self.record(Change::local(path, ChangeKind::Created)),
            LocalEventKind::Modified => self.record(Change::local(path, ChangeKind::Modified)),
            LocalEventKind::Removed => self.record(Change::local(path, ChangeKind::Deleted)),
        };
        Ok(queued)
    }

    fn pending(&self) -> &PendingChangeSet<PathBuf> {
        &self.pending
    }

    fn echo_filter(&self) -> &EchoFilter<PathBuf> {
        &self.echoes
    }

    /// Notifications may land before the remote handler reports its paths;
    /// a queued change for one of `paths` is dropped only if it is an echo.
    fn ignore_changes(&self, paths: &HashSet<PathBuf>) -> usize {
        self.echoes.suppress(paths.iter().cloned());
        let mut dropped = 0;
        for path in paths {
            let Some(change) = self.pending.take(path) else {
                continue;
            };
            if self.matches_model(&read_fs(&self.fs), &change) {
                dropped += 1;
            } else {
                tracing::debug!("keeping local {} inside echo window: {}", change.kind, path.display());
                self.pending.requeue(change);
            }
        }
        dropped
    }
}
