//! Replays pending local changes onto the remote backend.
//!
//! The pending set is drained into a map ordered by path. `Path` orders
//! component-wise, so a directory always comes before anything beneath it and
//! a directory created in this batch has its remote id by the time its
//! children are uploaded. A child whose parent is still unknown is requeued
//! for the next iteration instead of failing.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use drivesync_core::{Change, ChangeKind, RemoteFileMetadata, RemoteId, TrackedFile};

use crate::error::{io_err, SyncError};
use crate::local_fs::file_checksum;
use crate::local_watcher::LocalChangesWatcher;
use crate::remote::{RemoteBackend, RemoteError};
use crate::watcher::{read_fs, write_fs, ChangesWatcher, SharedFileSystem};

/// Result of applying one change.
#[derive(Debug)]
enum Step {
    /// The remote was updated; these ids were written or removed.
    Applied(Vec<RemoteId>),
    /// Nothing needed doing.
    Skipped,
    /// The parent directory has no remote id yet.
    Deferred,
}

pub struct LocalChangesHandler {
    watcher: Arc<LocalChangesWatcher>,
    backend: Arc<dyn RemoteBackend>,
    fs: SharedFileSystem,
}

impl LocalChangesHandler {
    pub fn new(
        watcher: Arc<LocalChangesWatcher>,
        backend: Arc<dyn RemoteBackend>,
        fs: SharedFileSystem,
    ) -> Self {
        Self {
            watcher,
            backend,
            fs,
        }
    }

    /// Drain the local pending set into the remote backend.
    ///
    /// Returns every remote id this call created, changed or deleted.
    pub fn handle(&self) -> HashSet<RemoteId> {
        let mut batch: BTreeMap<PathBuf, Change<PathBuf>> = self
            .watcher
            .pending()
            .drain()
            .into_iter()
            .map(|change| (change.key.clone(), change))
            .collect();

        let mut touched = HashSet::new();
        while let Some((path, change)) = batch.pop_first() {
            let mut discovered = Vec::new();
            match self.apply(&change, &mut discovered) {
                Ok(Step::Applied(ids)) => {
                    tracing::info!("pushed {} {}", change.kind, path.display());
                    touched.extend(ids);
                }
                Ok(Step::Skipped) => {}
                Ok(Step::Deferred) => {
                    tracing::debug!("deferring {}: parent not yet on remote", path.display());
                    self.watcher.pending().requeue(change);
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!("will retry {}: {}", path.display(), err);
                    self.watcher.pending().requeue(change);
                }
                Err(err) => {
                    tracing::error!("dropping local change {}: {}", path.display(), err);
                }
            }
            // Children that appeared before the directory was watched.
            for child in discovered {
                batch
                    .entry(child.clone())
                    .or_insert_with(|| Change::local(child, ChangeKind::Created));
            }
        }
        touched
    }

    fn relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(self.watcher.root()).ok()
    }

    fn apply(
        &self,
        change: &Change<PathBuf>,
        discovered: &mut Vec<PathBuf>,
    ) -> Result<Step, SyncError> {
        let path = change.key.as_path();
        let Some(relative) = self.relative(path) else {
            return Ok(Step::Skipped);
        };
        match change.kind {
            ChangeKind::Created | ChangeKind::Modified => self.upsert(path, relative, discovered),
            ChangeKind::Deleted => {
                self.delete(path, relative, change.meta.moved_from.as_deref(), discovered)
            }
            ChangeKind::Moved => match change.meta.moved_from.as_deref() {
                Some(from) => self.relocate(path, relative, from, discovered),
                None => self.upsert(path, relative, discovered),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Create / update
    // -----------------------------------------------------------------------

    fn upsert(
        &self,
        path: &Path,
        relative: &Path,
        discovered: &mut Vec<PathBuf>,
    ) -> Result<Step, SyncError> {
        let metadata = match std::fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{} vanished before upload", path.display());
                return Ok(Step::Skipped);
            }
            Err(err) => return Err(io_err(path, err)),
        };
        if metadata.file_type().is_symlink() {
            tracing::debug!("skipping symlink {}", path.display());
            return Ok(Step::Skipped);
        }
        let Some(name) = relative.file_name().and_then(|n| n.to_str()) else {
            tracing::warn!("skipping {}: name is not UTF-8", path.display());
            return Ok(Step::Skipped);
        };
        let parent_relative = relative.parent().unwrap_or(Path::new(""));

        let (parent, mut existing) = {
            let fs = read_fs(&self.fs);
            (
                fs.id_for_path(parent_relative).cloned(),
                fs.get_by_path(relative).cloned(),
            )
        };
        let Some(parent) = parent else {
            return Ok(Step::Deferred);
        };

        let mut ids = Vec::new();
        if let Some(entry) = existing.take() {
            if entry.is_dir == metadata.is_dir() {
                existing = Some(entry);
            } else {
                // File replaced by a directory or the other way round.
                self.delete_remote(&entry.id)?;
                ids.extend(self.forget(&entry.id));
            }
        }

        let step = if metadata.is_dir() {
            self.upsert_dir(path, &parent, name, existing, discovered)?
        } else {
            self.upsert_file(path, &parent, name, existing)?
        };
        Ok(match step {
            Step::Applied(more) => {
                ids.extend(more);
                Step::Applied(ids)
            }
            Step::Skipped if !ids.is_empty() => Step::Applied(ids),
            other => other,
        })
    }

    fn upsert_dir(
        &self,
        path: &Path,
        parent: &RemoteId,
        name: &str,
        existing: Option<TrackedFile>,
        discovered: &mut Vec<PathBuf>,
    ) -> Result<Step, SyncError> {
        if existing.is_some() {
            return Ok(Step::Skipped);
        }
        let remote = match self.backend.find_child(parent, name)? {
            Some(found) if found.is_dir => found,
            Some(found) => {
                return Err(RemoteError::Rejected(format!(
                    "remote file {} occupies directory name '{name}'",
                    found.id
                ))
                .into())
            }
            None => self.backend.create_directory(parent, name)?,
        };
        self.track(&remote)?;

        let entries = std::fs::read_dir(path).map_err(|e| io_err(path, e))?;
        for entry in entries.flatten() {
            let child = entry.path();
            if self.watcher.is_relevant(&child) {
                discovered.push(child);
            }
        }
        Ok(Step::Applied(vec![remote.id]))
    }

    fn upsert_file(
        &self,
        path: &Path,
        parent: &RemoteId,
        name: &str,
        existing: Option<TrackedFile>,
    ) -> Result<Step, SyncError> {
        let checksum = match file_checksum(path) {
            Ok((checksum, _)) => checksum,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Step::Skipped),
            Err(err) => return Err(io_err(path, err)),
        };

        if let Some(entry) = existing {
            if entry.checksum.as_deref() == Some(checksum.as_str()) {
                return Ok(Step::Skipped);
            }
            match self.backend.update(&entry.id, path) {
                Ok(remote) => {
                    self.track(&remote)?;
                    return Ok(Step::Applied(vec![remote.id]));
                }
                Err(err) if err.is_not_found() => {
                    tracing::info!(
                        "remote copy of {} is gone, uploading anew",
                        path.display()
                    );
                    self.forget(&entry.id);
                }
                Err(err) => return Err(err.into()),
            }
        }

        let remote = match self.backend.find_child(parent, name)? {
            Some(found) if found.is_dir => {
                return Err(RemoteError::Rejected(format!(
                    "remote directory {} occupies file name '{name}'",
                    found.id
                ))
                .into())
            }
            Some(found) if found.checksum.as_deref() == Some(checksum.as_str()) => found,
            Some(found) => self.backend.update(&found.id, path)?,
            None => self.backend.upload(parent, path)?,
        };
        self.track(&remote)?;
        Ok(Step::Applied(vec![remote.id]))
    }

    // -----------------------------------------------------------------------
    // Delete / move
    // -----------------------------------------------------------------------

    fn delete(
        &self,
        path: &Path,
        relative: &Path,
        moved_from: Option<&Path>,
        discovered: &mut Vec<PathBuf>,
    ) -> Result<Step, SyncError> {
        if path.symlink_metadata().is_ok() {
            // Deleted and recreated within one interval.
            return self.upsert(path, relative, discovered);
        }

        let id = {
            let fs = read_fs(&self.fs);
            fs.id_for_path(relative).cloned().or_else(|| {
                moved_from
                    .and_then(|from| self.relative(from))
                    .and_then(|from| fs.id_for_path(from).cloned())
            })
        };
        match id {
            Some(id) if !id.is_root() => {
                self.delete_remote(&id)?;
                Ok(Step::Applied(self.forget(&id)))
            }
            _ => Ok(Step::Skipped),
        }
    }

    fn relocate(
        &self,
        path: &Path,
        relative: &Path,
        from: &Path,
        discovered: &mut Vec<PathBuf>,
    ) -> Result<Step, SyncError> {
        let id = self
            .relative(from)
            .and_then(|from| read_fs(&self.fs).id_for_path(from).cloned());
        let Some(id) = id.filter(|id| !id.is_root()) else {
            return self.upsert(path, relative, discovered);
        };
        if path.symlink_metadata().is_err() {
            return self.delete(path, relative, Some(from), discovered);
        }
        let Some(name) = relative.file_name().and_then(|n| n.to_str()) else {
            return Ok(Step::Skipped);
        };
        let parent_relative = relative.parent().unwrap_or(Path::new(""));

        let (parent, occupant) = {
            let fs = read_fs(&self.fs);
            (
                fs.id_for_path(parent_relative).cloned(),
                fs.id_for_path(relative).cloned(),
            )
        };
        let Some(parent) = parent else {
            return Ok(Step::Deferred);
        };

        let mut ids = Vec::new();
        if let Some(occupant) = occupant.filter(|other| *other != id) {
            // The move overwrote another tracked file.
            self.delete_remote(&occupant)?;
            ids.extend(self.forget(&occupant));
        }

        let remote = match self.backend.move_to(&id, &parent, name) {
            Ok(remote) => remote,
            Err(err) if err.is_not_found() => {
                self.forget(&id);
                return self.upsert(path, relative, discovered);
            }
            Err(err) => return Err(err.into()),
        };
        self.track(&remote)?;
        ids.push(remote.id.clone());

        if !remote.is_dir {
            // Contents may have changed along with the name.
            let existing = read_fs(&self.fs).get(&remote.id).cloned();
            if let Step::Applied(more) = self.upsert_file(path, &parent, name, existing)? {
                ids.extend(more);
            }
        }
        Ok(Step::Applied(ids))
    }

    // -----------------------------------------------------------------------
    // Model bookkeeping
    // -----------------------------------------------------------------------

    fn delete_remote(&self, id: &RemoteId) -> Result<(), SyncError> {
        match self.backend.delete(id) {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn track(&self, remote: &RemoteFileMetadata) -> Result<(), SyncError> {
        write_fs(&self.fs).insert(TrackedFile::from(remote))?;
        Ok(())
    }

    /// Drop `id` and its subtree from the model, returning the removed ids.
    fn forget(&self, id: &RemoteId) -> Vec<RemoteId> {
        match write_fs(&self.fs).remove(id) {
            Ok(removed) => removed.into_iter().map(|(id, _)| id).collect(),
            Err(err) => {
                tracing::warn!("could not forget {}: {}", id, err);
                vec![id.clone()]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::watcher::shared;
    use drivesync_core::FileSystem;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        backend: Arc<MemoryBackend>,
        fs: SharedFileSystem,
        watcher: Arc<LocalChangesWatcher>,
        handler: LocalChangesHandler,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let backend = Arc::new(MemoryBackend::new());
        let fs = shared(FileSystem::new());
        let watcher = Arc::new(LocalChangesWatcher::new(
            &root,
            fs.clone(),
            Duration::from_secs(5),
        ));
        let handler = LocalChangesHandler::new(watcher.clone(), backend.clone(), fs.clone());
        Fixture {
            _tmp: tmp,
            root,
            backend,
            fs,
            watcher,
            handler,
        }
    }

    #[test]
    fn unchanged_checksum_is_not_uploaded_again() {
        let f = fixture();
        let path = f.root.join("a.txt");
        std::fs::write(&path, b"one").unwrap();
        f.watcher.seed([path.clone()]);
        assert_eq!(f.handler.handle().len(), 1);
        assert_eq!(f.backend.upload_count(), 1);

        f.watcher.seed([path.clone()]);
        assert!(f.handler.handle().is_empty());
        assert_eq!(f.backend.upload_count(), 1);

        std::fs::write(&path, b"two").unwrap();
        f.watcher.seed([path]);
        assert_eq!(f.handler.handle().len(), 1);
        assert_eq!(f.backend.upload_count(), 2);
    }

    #[test]
    fn new_directory_brings_its_children() {
        let f = fixture();
        let dir = f.root.join("docs");
        std::fs::create_dir_all(dir.join("deep")).unwrap();
        std::fs::write(dir.join("deep/x.txt"), b"x").unwrap();
        f.watcher.seed([dir]);

        let touched = f.handler.handle();
        assert_eq!(touched.len(), 3);
        assert!(f.backend.lookup("docs/deep/x.txt").is_some());
        assert!(f.watcher.pending().is_empty());
    }

    #[test]
    fn vanished_file_is_dropped() {
        let f = fixture();
        f.watcher.seed([f.root.join("ghost.txt")]);
        assert!(f.handler.handle().is_empty());
        assert!(f.watcher.pending().is_empty());
    }

    #[test]
    fn transient_failure_requeues() {
        let f = fixture();
        let path = f.root.join("a.txt");
        std::fs::write(&path, b"one").unwrap();
        f.watcher.seed([path.clone()]);
        f.backend.fail_next(1);
        assert!(f.handler.handle().is_empty());
        assert!(f.watcher.pending().contains(&path));

        assert_eq!(f.handler.handle().len(), 1);
        assert!(f.watcher.pending().is_empty());
    }

    #[test]
    fn rename_moves_remote_object() {
        let f = fixture();
        let from = f.root.join("a.txt");
        std::fs::write(&from, b"one").unwrap();
        f.watcher.seed([from.clone()]);
        f.handler.handle();
        let id = f.backend.lookup("a.txt").unwrap().id;

        let to = f.root.join("b.txt");
        std::fs::rename(&from, &to).unwrap();
        f.watcher
            .observe(crate::LocalEvent::renamed(&from, &to))
            .unwrap();
        let touched = f.handler.handle();

        assert!(touched.contains(&id));
        assert_eq!(f.backend.lookup("b.txt").map(|m| m.id), Some(id.clone()));
        assert!(f.backend.lookup("a.txt").is_none());
        assert_eq!(f.backend.upload_count(), 1);
        assert_eq!(
            read_fs(&f.fs).path_of(&id),
            Some(PathBuf::from("b.txt"))
        );
    }

    #[test]
    fn delete_removes_remote_and_model_entry() {
        let f = fixture();
        let path = f.root.join("a.txt");
        std::fs::write(&path, b"one").unwrap();
        f.watcher.seed([path.clone()]);
        f.handler.handle();

        std::fs::remove_file(&path).unwrap();
        f.watcher
            .observe(crate::LocalEvent::removed(&path))
            .unwrap();
        assert_eq!(f.handler.handle().len(), 1);
        assert!(f.backend.lookup("a.txt").is_none());
        assert!(read_fs(&f.fs).is_empty());
    }
}
