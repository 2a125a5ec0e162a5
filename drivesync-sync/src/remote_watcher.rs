//! Polls the remote revision-delta endpoint into pending `Change<RemoteId>`s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use drivesync_core::{Change, ChangeKind, FileSystem, RemoteId};

use crate::error::SyncError;
use crate::pending::{lock, EchoFilter, PendingChangeSet};
use crate::remote::RemoteBackend;
use crate::watcher::{read_fs, write_fs, ChangesWatcher, SharedFileSystem};

/// Remote-side watcher.
///
/// Starts uninitialized; [`start`](Self::start) fixes the revision cursor and
/// only then may [`poll`](Self::poll) run. A failed poll leaves both the
/// cursor and the pending set untouched.
///
/// The model's cursor moves as soon as a poll succeeds, while the changes it
/// covers may still be waiting in the pending set. The committed revision
/// trails it and only moves once nothing polled up to it is left unapplied;
/// that is the cursor worth persisting.
pub struct RemoteChangesWatcher {
    backend: Arc<dyn RemoteBackend>,
    fs: SharedFileSystem,
    pending: PendingChangeSet<RemoteId>,
    echoes: EchoFilter<RemoteId>,
    started: AtomicBool,
    checkpoint: Mutex<Checkpoint>,
}

#[derive(Debug, Default)]
struct Checkpoint {
    committed: u64,
    /// A handler holds drained changes that are not applied yet.
    in_flight: bool,
}

impl RemoteChangesWatcher {
    pub fn new(backend: Arc<dyn RemoteBackend>, fs: SharedFileSystem, echo_window: Duration) -> Self {
        Self {
            backend,
            fs,
            pending: PendingChangeSet::new(),
            echoes: EchoFilter::new(echo_window),
            started: AtomicBool::new(false),
            checkpoint: Mutex::new(Checkpoint::default()),
        }
    }

    /// Initialise the cursor and enter the running state.
    ///
    /// A fresh model (cursor 0, nothing tracked) jumps straight to the
    /// backend's current revision, so history from before the first run is
    /// never replayed. Errors here are startup failures.
    pub fn start(&self) -> Result<u64, SyncError> {
        let (current, empty) = {
            let fs = read_fs(&self.fs);
            (fs.revision(), fs.is_empty())
        };
        let revision = if current == 0 && empty {
            let latest = self.backend.current_revision()?;
            write_fs(&self.fs).update_revision(latest);
            tracing::info!("revision cursor initialised to {}", latest);
            latest
        } else {
            tracing::info!("resuming from revision {}", current);
            current
        };
        lock(&self.checkpoint).committed = revision;
        self.started.store(true, Ordering::SeqCst);
        Ok(revision)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn revision(&self) -> u64 {
        read_fs(&self.fs).revision()
    }

    /// Highest revision whose changes have all been applied or dropped.
    pub fn committed_revision(&self) -> u64 {
        lock(&self.checkpoint).committed
    }

    /// Hand every pending change to a handler. The committed revision holds
    /// still until [`finish_apply`](Self::finish_apply).
    pub fn begin_apply(&self) -> Vec<Change<RemoteId>> {
        let mut checkpoint = lock(&self.checkpoint);
        checkpoint.in_flight = true;
        self.pending.drain()
    }

    /// Called once the handler has applied or requeued what it drained.
    pub fn finish_apply(&self) {
        let mut checkpoint = lock(&self.checkpoint);
        checkpoint.in_flight = false;
        self.advance(&mut checkpoint);
    }

    // Polls push before they bump the cursor, so reading the cursor first
    // and then finding nothing pending means everything up to it is applied.
    fn advance(&self, checkpoint: &mut Checkpoint) {
        let revision = self.revision();
        if !checkpoint.in_flight && self.pending.is_empty() && revision > checkpoint.committed {
            tracing::debug!("committed revision {}", revision);
            checkpoint.committed = revision;
        }
    }

    /// One scheduled poll.
    pub fn poll(&self) -> Result<usize, SyncError> {
        self.observe(())
    }

    /// A suppressed change is only an echo while the model still agrees with
    /// what the remote reports; a third-party edit inside the window passes.
    fn is_echo(&self, fs: &FileSystem, change: &Change<RemoteId>) -> bool {
        if !self.echoes.is_suppressed(&change.key) {
            return false;
        }
        match (&change.meta, change.kind) {
            (None, _) | (_, ChangeKind::Deleted) => !fs.contains(&change.key),
            (Some(meta), _) => fs.get(&meta.id).is_some_and(|entry| {
                entry.parent == meta.parent
                    && entry.name == meta.name
                    && entry.is_dir == meta.is_dir
                    && entry.checksum == meta.checksum
            }),
        }
    }
}

impl ChangesWatcher<RemoteId> for RemoteChangesWatcher {
    type Input = ();

    fn observe(&self, _: ()) -> Result<usize, SyncError> {
        if !self.is_started() {
            return Err(SyncError::NotStarted);
        }
        let since = self.revision();
        let package = self.backend.poll_changes(since)?;

        let mut queued = 0;
        {
            let fs = read_fs(&self.fs);
            for change in package.changes {
                if change.key.is_root() {
                    continue;
                }
                if self.is_echo(&fs, &change) {
                    tracing::debug!("suppressed remote echo: {}", change.key);
                    continue;
                }
                tracing::trace!("remote {}: {}", change.kind, change.key);
                self.pending.push(change);
                queued += 1;
            }
        }

        if !write_fs(&self.fs).update_revision(package.revision) {
            tracing::warn!(
                "backend returned revision {} below cursor {}, keeping cursor",
                package.revision,
                since
            );
        }
        if queued > 0 {
            tracing::debug!("polled {} remote change(s) since {}", queued, since);
        }
        self.advance(&mut lock(&self.checkpoint));
        Ok(queued)
    }

    fn pending(&self) -> &PendingChangeSet<RemoteId> {
        &self.pending
    }

    fn echo_filter(&self) -> &EchoFilter<RemoteId> {
        &self.echoes
    }
}
