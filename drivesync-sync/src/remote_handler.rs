//! Replays pending remote changes onto the local tree.
//!
//! Deletions run first so names they free can be reused by the upserts that
//! follow. Upserts run in passes: each pass applies every change whose parent
//! is already tracked, and passes repeat while they make progress. Whatever
//! is left is requeued.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use drivesync_core::{Change, ChangeKind, FileSystem, RemoteFileMetadata, RemoteId, TrackedFile};

use crate::error::{io_err, SyncError};
use crate::local_fs::{file_checksum, tmp_path};
use crate::remote::RemoteBackend;
use crate::remote_watcher::RemoteChangesWatcher;
use crate::watcher::{read_fs, write_fs, ChangesWatcher, SharedFileSystem};

pub struct RemoteChangesHandler {
    watcher: Arc<RemoteChangesWatcher>,
    backend: Arc<dyn RemoteBackend>,
    fs: SharedFileSystem,
    root: PathBuf,
}

impl RemoteChangesHandler {
    pub fn new(
        watcher: Arc<RemoteChangesWatcher>,
        backend: Arc<dyn RemoteBackend>,
        fs: SharedFileSystem,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            watcher,
            backend,
            fs,
            root: root.into(),
        }
    }

    /// Drain the remote pending set into the local tree.
    ///
    /// Returns every absolute local path written, renamed or removed.
    pub fn handle(&self) -> HashSet<PathBuf> {
        let touched = self.apply(self.watcher.begin_apply());
        self.watcher.finish_apply();
        touched
    }

    fn apply(&self, drained: Vec<Change<RemoteId>>) -> HashSet<PathBuf> {
        let (deletions, mut upserts): (Vec<_>, Vec<_>) = drained
            .into_iter()
            .partition(|change| change.kind == ChangeKind::Deleted || change.meta.is_none());

        let mut touched = HashSet::new();
        for change in deletions {
            match self.delete(&change.key) {
                Ok(paths) => touched.extend(paths),
                Err(err) => self.failed(change, err),
            }
        }

        loop {
            let mut progressed = false;
            let mut deferred = Vec::new();
            for change in upserts {
                let Some(meta) = change.meta.as_ref() else {
                    continue;
                };
                match self.upsert(meta) {
                    Ok(Some(paths)) => {
                        progressed = true;
                        touched.extend(paths);
                    }
                    Ok(None) => deferred.push(change),
                    Err(err) => self.failed(change, err),
                }
            }
            if deferred.is_empty() || !progressed {
                for change in deferred {
                    tracing::debug!("deferring remote {}: parent not tracked yet", change.key);
                    self.watcher.pending().requeue(change);
                }
                break;
            }
            upserts = deferred;
        }
        touched
    }

    fn failed(&self, change: Change<RemoteId>, err: SyncError) {
        if err.is_retryable() {
            tracing::warn!("will retry remote {}: {}", change.key, err);
            self.watcher.pending().requeue(change);
        } else {
            tracing::error!("dropping remote change {}: {}", change.key, err);
        }
    }

    fn delete(&self, id: &RemoteId) -> Result<Vec<PathBuf>, SyncError> {
        let Some(relative) = read_fs(&self.fs).path_of(id) else {
            return Ok(Vec::new());
        };
        if id.is_root() {
            return Ok(Vec::new());
        }
        let target = self.root.join(&relative);
        remove_local(&target)?;
        let removed = write_fs(&self.fs).remove(id)?;
        tracing::info!("removed {}", target.display());
        Ok(removed
            .into_iter()
            .map(|(_, relative)| self.root.join(relative))
            .collect())
    }

    /// Apply one created/modified/moved object. `Ok(None)` means its parent
    /// is not tracked yet.
    fn upsert(&self, meta: &RemoteFileMetadata) -> Result<Option<Vec<PathBuf>>, SyncError> {
        let Some(parent) = meta.parent.as_ref() else {
            return Ok(Some(Vec::new()));
        };
        let (target_relative, current, stale, subtree) = {
            let fs = read_fs(&self.fs);
            let Some(parent_relative) = fs.path_of(parent) else {
                return Ok(None);
            };
            let target_relative = parent_relative.join(&meta.name);
            let stale = fs
                .id_for_path(&target_relative)
                .filter(|other| **other != meta.id)
                .cloned();
            (
                target_relative,
                fs.path_of(&meta.id),
                stale,
                subtree(&fs, &meta.id),
            )
        };
        let target = self.root.join(&target_relative);
        let mut touched = Vec::new();

        if let Some(stale) = stale {
            // The name now belongs to another object; its own change has
            // been applied already or will arrive later.
            if let Err(err) = write_fs(&self.fs).remove(&stale) {
                tracing::warn!("could not forget {} at {}: {}", stale, target.display(), err);
            }
        }

        if let Some(current) = current.filter(|current| *current != target_relative) {
            let from = self.root.join(&current);
            if from.symlink_metadata().is_ok() {
                ensure_parent(&target)?;
                std::fs::rename(&from, &target).map_err(|e| io_err(&from, e))?;
                tracing::info!("moved {} -> {}", from.display(), target.display());
            }
            for suffix in &subtree {
                touched.push(from.join(suffix));
                touched.push(target.join(suffix));
            }
            touched.push(from);
        }

        if meta.is_dir {
            if target.is_file() {
                remove_local(&target)?;
            }
            std::fs::create_dir_all(&target).map_err(|e| io_err(&target, e))?;
        } else {
            self.download(meta, &target)?;
        }

        write_fs(&self.fs).insert(TrackedFile::from(meta))?;
        touched.push(target);
        Ok(Some(touched))
    }

    fn download(&self, meta: &RemoteFileMetadata, target: &Path) -> Result<(), SyncError> {
        if target.is_dir() {
            return Err(io_err(
                target,
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "a local directory occupies the file's name",
                ),
            ));
        }
        let local = file_checksum(target).ok().map(|(checksum, _)| checksum);
        if local.is_some() && local == meta.checksum {
            return Ok(());
        }

        ensure_parent(target)?;
        let tmp = tmp_path(target);
        match self.backend.download(&meta.id, &tmp) {
            Ok(()) => {}
            Err(err) => {
                let _ = std::fs::remove_file(&tmp);
                if err.is_not_found() {
                    // Deleted since the poll; the deletion arrives next time.
                    return Ok(());
                }
                return Err(err.into());
            }
        }
        if let Err(err) = std::fs::rename(&tmp, target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(target, err));
        }
        tracing::info!("downloaded {}", target.display());
        Ok(())
    }
}

/// Paths of every descendant of `id`, relative to `id` itself.
fn subtree(fs: &FileSystem, id: &RemoteId) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let mut stack: Vec<(RemoteId, PathBuf)> = vec![(id.clone(), PathBuf::new())];
    while let Some((current, prefix)) = stack.pop() {
        for child in fs.children(&current) {
            let path = prefix.join(&child.name);
            paths.push(path.clone());
            stack.push((child.id.clone(), path));
        }
    }
    paths
}

fn ensure_parent(path: &Path) -> Result<(), SyncError> {
    match path.parent() {
        Some(parent) => std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e)),
        None => Ok(()),
    }
}

fn remove_local(path: &Path) -> Result<(), SyncError> {
    let result = match path.symlink_metadata() {
        Ok(metadata) if metadata.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::watcher::shared;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        backend: Arc<MemoryBackend>,
        fs: SharedFileSystem,
        watcher: Arc<RemoteChangesWatcher>,
        handler: RemoteChangesHandler,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let backend = Arc::new(MemoryBackend::new());
        let fs = shared(FileSystem::new());
        let watcher = Arc::new(RemoteChangesWatcher::new(
            backend.clone(),
            fs.clone(),
            Duration::from_secs(30),
        ));
        watcher.start().unwrap();
        let handler =
            RemoteChangesHandler::new(watcher.clone(), backend.clone(), fs.clone(), &root);
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
    fn nested_objects_land_parent_first() {
        let f = fixture();
        let docs = f.backend.put_directory(&RemoteId::root(), "docs").unwrap();
        let deep = f.backend.put_directory(&docs.id, "deep").unwrap();
        f.backend.put_file(&deep.id, "x.txt", b"hello").unwrap();
        f.watcher.poll().unwrap();

        let touched = f.handler.handle();
        assert_eq!(touched.len(), 3);
        assert_eq!(
            std::fs::read(f.root.join("docs/deep/x.txt")).unwrap(),
            b"hello"
        );
        assert!(f.watcher.pending().is_empty());
        assert_eq!(read_fs(&f.fs).len(), 3);
    }

    #[test]
    fn orphan_is_requeued() {
        let f = fixture();
        let docs = f.backend.put_directory(&RemoteId::root(), "docs").unwrap();
        let file = f.backend.put_file(&docs.id, "x.txt", b"x").unwrap();
        f.watcher.poll().unwrap();
        // Lose the directory's change: the file cannot be placed.
        f.watcher.pending().take(&docs.id);

        assert!(f.handler.handle().is_empty());
        assert!(f.watcher.pending().contains(&file.id));
        assert!(!f.root.join("docs").exists());
    }

    #[test]
    fn remote_rename_moves_local_subtree() {
        let f = fixture();
        let docs = f.backend.put_directory(&RemoteId::root(), "docs").unwrap();
        f.backend.put_file(&docs.id, "x.txt", b"x").unwrap();
        f.watcher.poll().unwrap();
        f.handler.handle();

        f.backend.rename(&docs.id, &RemoteId::root(), "papers").unwrap();
        f.watcher.poll().unwrap();
        let touched = f.handler.handle();

        assert!(f.root.join("papers/x.txt").is_file());
        assert!(!f.root.join("docs").exists());
        assert!(touched.contains(&f.root.join("docs/x.txt")));
        assert!(touched.contains(&f.root.join("papers/x.txt")));
    }

    #[test]
    fn remote_delete_removes_local_tree() {
        let f = fixture();
        let docs = f.backend.put_directory(&RemoteId::root(), "docs").unwrap();
        f.backend.put_file(&docs.id, "x.txt", b"x").unwrap();
        f.watcher.poll().unwrap();
        f.handler.handle();

        f.backend.remove(&docs.id).unwrap();
        f.watcher.poll().unwrap();
        let touched = f.handler.handle();
        assert!(!f.root.join("docs").exists());
        assert_eq!(touched.len(), 2);
        assert!(read_fs(&f.fs).is_empty());
    }

    #[test]
    fn replaced_name_forgets_previous_holder() {
        let f = fixture();
        let old = f.backend.put_file(&RemoteId::root(), "a.txt", b"old").unwrap();
        f.watcher.poll().unwrap();
        f.handler.handle();

        f.backend.remove(&old.id).unwrap();
        let new = f.backend.put_file(&RemoteId::root(), "a.txt", b"new").unwrap();
        f.watcher.poll().unwrap();
        // The deletion is seen later than the new object taking its name.
        let deletion = f.watcher.pending().take(&old.id).unwrap();

        f.handler.handle();
        assert_eq!(std::fs::read(f.root.join("a.txt")).unwrap(), b"new");
        assert!(!read_fs(&f.fs).contains(&old.id));
        assert!(read_fs(&f.fs).contains(&new.id));

        f.watcher.pending().push(deletion);
        f.handler.handle();
        assert_eq!(std::fs::read(f.root.join("a.txt")).unwrap(), b"new");
    }

    #[test]
    fn matching_local_content_is_not_downloaded() {
        let f = fixture();
        std::fs::write(f.root.join("a.txt"), b"same").unwrap();
        f.backend.put_file(&RemoteId::root(), "a.txt", b"same").unwrap();
        f.watcher.poll().unwrap();
        f.backend.fail_next(1);
        // A download attempt would hit the injected failure.
        assert_eq!(f.handler.handle().len(), 1);
        assert!(f.watcher.pending().is_empty());
    }
}
