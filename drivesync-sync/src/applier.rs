//! One merge iteration: local-handle, remote-ignore, remote-handle,
//! local-ignore.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::local_handler::LocalChangesHandler;
use crate::local_watcher::LocalChangesWatcher;
use crate::remote::RemoteBackend;
use crate::remote_handler::RemoteChangesHandler;
use crate::remote_watcher::RemoteChangesWatcher;
use crate::watcher::{read_fs, ChangesWatcher, SharedFileSystem};

/// What one merge iteration did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub iteration: u64,
    /// Remote ids written by the local handler.
    pub uploaded: usize,
    /// Local paths written by the remote handler.
    pub downloaded: usize,
    /// Changes left pending (deferred or retrying) on each side.
    pub local_pending: usize,
    pub remote_pending: usize,
    pub revision: u64,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

pub struct ChangesApplier {
    local_watcher: Arc<LocalChangesWatcher>,
    remote_watcher: Arc<RemoteChangesWatcher>,
    local_handler: LocalChangesHandler,
    remote_handler: RemoteChangesHandler,
    fs: SharedFileSystem,
    gate: Mutex<()>,
    iterations: AtomicU64,
}

impl ChangesApplier {
    pub fn new(
        local_watcher: Arc<LocalChangesWatcher>,
        remote_watcher: Arc<RemoteChangesWatcher>,
        backend: Arc<dyn RemoteBackend>,
        fs: SharedFileSystem,
    ) -> Self {
        let local_handler =
            LocalChangesHandler::new(local_watcher.clone(), backend.clone(), fs.clone());
        let remote_handler = RemoteChangesHandler::new(
            remote_watcher.clone(),
            backend,
            fs.clone(),
            local_watcher.root().to_path_buf(),
        );
        Self {
            local_watcher,
            remote_watcher,
            local_handler,
            remote_handler,
            fs,
            gate: Mutex::new(()),
            iterations: AtomicU64::new(0),
        }
    }

    pub fn local_watcher(&self) -> &Arc<LocalChangesWatcher> {
        &self.local_watcher
    }

    pub fn remote_watcher(&self) -> &Arc<RemoteChangesWatcher> {
        &self.remote_watcher
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::SeqCst)
    }

    /// Run one merge iteration.
    ///
    /// Returns `None` without doing anything when another iteration holds the
    /// gate; the caller's tick is skipped, not queued.
    pub fn merge(&self) -> Option<MergeSummary> {
        let _gate = match self.gate.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                tracing::debug!("merge already in progress, skipping");
                return None;
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let started = Instant::now();

        let uploaded = self.local_handler.handle();
        self.remote_watcher.ignore_changes(&uploaded);

        let downloaded = self.remote_handler.handle();
        self.local_watcher.ignore_changes(&downloaded);

        let iteration = self.iterations.fetch_add(1, Ordering::SeqCst) + 1;
        let summary = MergeSummary {
            iteration,
            uploaded: uploaded.len(),
            downloaded: downloaded.len(),
            local_pending: self.local_watcher.pending().len(),
            remote_pending: self.remote_watcher.pending().len(),
            revision: read_fs(&self.fs).revision(),
            duration_ms: started.elapsed().as_millis() as u64,
            finished_at: Utc::now(),
        };
        if summary.uploaded > 0 || summary.downloaded > 0 {
            tracing::info!(
                "merge #{}: {} uploaded, {} downloaded in {}ms",
                iteration,
                summary.uploaded,
                summary.downloaded,
                summary.duration_ms
            );
        }
        Some(summary)
    }
}
