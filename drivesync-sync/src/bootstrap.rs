//! First-run reconciliation of a fresh model against both trees.
//!
//! The remote tree is walked with `list_children` and mirrored locally; every
//! local path the model still does not know afterwards is seeded into the
//! local watcher. When both sides hold a file with different contents the
//! local copy wins: it is tracked under the remote id and seeded, so the next
//! merge uploads it over the remote one.
//!
//! Later starts skip the mirror and [`rescan`] the local tree instead, so
//! edits made while the daemon was down are queued.

use std::path::{Path, PathBuf};

use serde::Serialize;

use drivesync_core::{Change, ChangeKind, RemoteId, TrackedFile};

use crate::error::{io_err, SyncError};
use crate::local_fs::{file_checksum, tmp_path};
use crate::local_watcher::LocalChangesWatcher;
use crate::remote::RemoteBackend;
use crate::watcher::{read_fs, write_fs, SharedFileSystem};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    /// Remote files written locally.
    pub downloaded: usize,
    /// Remote directories mirrored.
    pub directories: usize,
    /// Files already identical on both sides.
    pub adopted: usize,
    /// Local paths queued for upload.
    pub seeded: usize,
}

/// Mirror the remote tree into `root` and queue local-only paths.
///
/// Remote failures abort the bootstrap; a local file that cannot be written
/// is logged and skipped.
pub fn initial_sync(
    backend: &dyn RemoteBackend,
    fs: &SharedFileSystem,
    root: &Path,
    local: &LocalChangesWatcher,
) -> Result<BootstrapReport, SyncError> {
    let mut report = BootstrapReport::default();
    let mut conflicts = Vec::new();

    let mut stack: Vec<(RemoteId, PathBuf)> = vec![(RemoteId::root(), root.to_path_buf())];
    while let Some((parent, dir)) = stack.pop() {
        for child in backend.list_children(&parent)? {
            let target = dir.join(&child.name);
            if !local.is_relevant(&target) {
                continue;
            }
            if child.is_dir {
                if target.is_file() {
                    tracing::warn!("{} is a file locally, keeping it", target.display());
                    conflicts.push(target);
                    continue;
                }
                std::fs::create_dir_all(&target).map_err(|e| io_err(&target, e))?;
                write_fs(fs).insert(TrackedFile::from(&child))?;
                report.directories += 1;
                stack.push((child.id.clone(), target));
                continue;
            }

            if target.is_dir() {
                tracing::warn!("{} is a directory locally, keeping it", target.display());
                continue;
            }
            match file_checksum(&target) {
                Ok((checksum, _)) if child.checksum.as_deref() == Some(checksum.as_str()) => {
                    report.adopted += 1;
                }
                Ok(_) => {
                    tracing::info!("{} differs from remote, local copy wins", target.display());
                    conflicts.push(target.clone());
                }
                Err(_) => {
                    let tmp = tmp_path(&target);
                    backend.download(&child.id, &tmp)?;
                    if let Err(err) = std::fs::rename(&tmp, &target) {
                        let _ = std::fs::remove_file(&tmp);
                        tracing::error!("could not place {}: {}", target.display(), err);
                        continue;
                    }
                    report.downloaded += 1;
                }
            }
            write_fs(fs).insert(TrackedFile::from(&child))?;
        }
    }

    let mut untracked = untracked_paths(fs, root, local)?;
    untracked.extend(conflicts);
    untracked.sort();
    untracked.dedup();
    report.seeded = local.seed(untracked);

    tracing::info!(
        "initial sync: {} downloaded, {} directories, {} adopted, {} seeded",
        report.downloaded,
        report.directories,
        report.adopted,
        report.seeded
    );
    Ok(report)
}

/// Local differences a restart found against a loaded model.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RescanReport {
    /// Local paths the model does not track.
    pub created: usize,
    /// Tracked paths whose contents or type differ on disk.
    pub modified: usize,
    /// Tracked paths missing from disk.
    pub deleted: usize,
}

/// Compare `root` with a loaded model and queue the differences.
///
/// Untracked paths are queued as created, tracked files whose checksum no
/// longer matches as modified, and tracked paths gone from disk as deleted.
/// Nothing below a missing directory is visited; its deletion covers it.
pub fn rescan(
    fs: &SharedFileSystem,
    root: &Path,
    local: &LocalChangesWatcher,
) -> Result<RescanReport, SyncError> {
    let mut report = RescanReport {
        created: local.seed(untracked_paths(fs, root, local)?),
        ..RescanReport::default()
    };

    let mut changes = Vec::new();
    {
        let fs = read_fs(fs);
        let mut stack: Vec<(RemoteId, PathBuf)> = vec![(RemoteId::root(), root.to_path_buf())];
        while let Some((parent, dir)) = stack.pop() {
            for entry in fs.children(&parent) {
                let path = dir.join(&entry.name);
                let Ok(metadata) = path.symlink_metadata() else {
                    changes.push(Change::local(path, ChangeKind::Deleted));
                    continue;
                };
                if entry.is_dir != metadata.is_dir() {
                    changes.push(Change::local(path, ChangeKind::Modified));
                } else if entry.is_dir {
                    stack.push((entry.id.clone(), path));
                } else {
                    match file_checksum(&path) {
                        Ok((checksum, _)) if entry.checksum.as_deref() == Some(checksum.as_str()) => {}
                        Ok(_) => changes.push(Change::local(path, ChangeKind::Modified)),
                        Err(err) => tracing::warn!("cannot hash {}: {}", path.display(), err),
                    }
                }
            }
        }
    }

    for change in changes {
        let kind = change.kind;
        if !local.enqueue(change) {
            continue;
        }
        match kind {
            ChangeKind::Deleted => report.deleted += 1,
            _ => report.modified += 1,
        }
    }

    tracing::info!(
        "rescan: {} created, {} modified, {} deleted",
        report.created,
        report.modified,
        report.deleted
    );
    Ok(report)
}

/// Top-most local paths below `root` with no model entry. Children of an
/// untracked directory are left to the directory's own upload.
fn untracked_paths(
    fs: &SharedFileSystem,
    root: &Path,
    local: &LocalChangesWatcher,
) -> Result<Vec<PathBuf>, SyncError> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|e| io_err(&dir, e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !local.is_relevant(&path) {
                continue;
            }
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let tracked = read_fs(fs).get_by_path(relative).map(|entry| entry.is_dir);
            match tracked {
                Some(true) if path.is_dir() => stack.push(path),
                Some(_) => {}
                None => found.push(path),
            }
        }
    }
    Ok(found)
}
