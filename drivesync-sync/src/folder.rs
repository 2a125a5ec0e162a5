//! Remote backend stored in a plain directory, typically a mounted share.
//!
//! # Storage layout
//!
//! ```text
//! <remote>/
//!   index.json        (object table, revision and change log)
//!   blobs/<id>        (file contents)
//! ```
//!
//! Every operation reloads the index, applies one mutation and writes it back
//! with `.tmp` + rename. One daemon per remote directory.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use drivesync_core::{RemoteChangePackage, RemoteFileMetadata, RemoteId};

use crate::local_fs::file_checksum;
use crate::remote::{local_err, upload_name, RemoteBackend, RemoteError};
use crate::tree::RemoteTree;

#[derive(Debug)]
pub struct FolderBackend {
    dir: PathBuf,
    guard: Mutex<()>,
}

fn storage_err(path: impl Into<PathBuf>, source: std::io::Error) -> RemoteError {
    RemoteError::Storage {
        path: path.into(),
        source,
    }
}

impl FolderBackend {
    /// Open (creating if needed) a folder remote at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RemoteError> {
        let backend = Self {
            dir: dir.into(),
            guard: Mutex::new(()),
        };
        let blobs = backend.blobs_dir();
        std::fs::create_dir_all(&blobs).map_err(|e| storage_err(&blobs, e))?;
        if !backend.index_path().exists() {
            backend.save(&RemoteTree::default())?;
        }
        // Fail at startup rather than on the first poll.
        backend.load()?;
        Ok(backend)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    fn blobs_dir(&self) -> PathBuf {
        self.dir.join("blobs")
    }

    fn blob_path(&self, id: &RemoteId) -> PathBuf {
        self.blobs_dir().join(&id.0)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self) -> Result<RemoteTree, RemoteError> {
        let path = self.index_path();
        let contents = std::fs::read_to_string(&path).map_err(|e| storage_err(&path, e))?;
        serde_json::from_str(&contents)
            .map_err(|err| RemoteError::Corrupt(format!("{}: {err}", path.display())))
    }

    fn save(&self, tree: &RemoteTree) -> Result<(), RemoteError> {
        let path = self.index_path();
        let json = serde_json::to_string(tree)
            .map_err(|err| RemoteError::Corrupt(format!("cannot encode index: {err}")))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| storage_err(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| storage_err(&path, e))
    }

    /// Run `f` against the loaded index and persist it if `f` succeeds.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut RemoteTree) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let _guard = self.lock();
        let mut tree = self.load()?;
        let value = f(&mut tree)?;
        self.save(&tree)?;
        Ok(value)
    }

    fn read<T>(&self, f: impl FnOnce(&RemoteTree) -> Result<T, RemoteError>) -> Result<T, RemoteError> {
        let _guard = self.lock();
        f(&self.load()?)
    }

    /// Copy `local` into the blob store for `id`.
    fn store_blob(&self, id: &RemoteId, local: &Path) -> Result<(), RemoteError> {
        let blob = self.blob_path(id);
        let tmp = blob.with_extension("tmp");
        std::fs::copy(local, &tmp).map_err(|e| local_err(local, e))?;
        std::fs::rename(&tmp, &blob).map_err(|e| storage_err(&blob, e))
    }
}

impl RemoteBackend for FolderBackend {
    fn current_revision(&self) -> Result<u64, RemoteError> {
        self.read(|tree| Ok(tree.revision()))
    }

    fn poll_changes(&self, since: u64) -> Result<RemoteChangePackage, RemoteError> {
        self.read(|tree| Ok(tree.changes_since(since)))
    }

    fn upload(&self, parent: &RemoteId, local: &Path) -> Result<RemoteFileMetadata, RemoteError> {
        let name = upload_name(local)?;
        let (checksum, size) = file_checksum(local).map_err(|e| local_err(local, e))?;
        self.mutate(|tree| {
            let meta = tree.create(parent, &name, false, Some(checksum), size)?;
            self.store_blob(&meta.id, local)?;
            Ok(meta)
        })
    }

    fn update(&self, id: &RemoteId, local: &Path) -> Result<RemoteFileMetadata, RemoteError> {
        let (checksum, size) = file_checksum(local).map_err(|e| local_err(local, e))?;
        self.mutate(|tree| {
            tree.require(id)?;
            self.store_blob(id, local)?;
            tree.update_content(id, checksum, size)
        })
    }

    fn download(&self, id: &RemoteId, destination: &Path) -> Result<(), RemoteError> {
        let _guard = self.lock();
        let tree = self.load()?;
        if tree.require(id)?.is_dir {
            return Err(RemoteError::Rejected(format!("{id} is a directory")));
        }
        let blob = self.blob_path(id);
        std::fs::copy(&blob, destination).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound && !blob.exists() {
                storage_err(&blob, err)
            } else {
                local_err(destination, err)
            }
        })?;
        Ok(())
    }

    fn delete(&self, id: &RemoteId) -> Result<(), RemoteError> {
        let removed = self.mutate(|tree| tree.remove(id))?;
        for removed_id in removed {
            let blob = self.blob_path(&removed_id);
            match std::fs::remove_file(&blob) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!("could not remove blob {}: {}", blob.display(), err);
                }
            }
        }
        Ok(())
    }

    fn create_directory(
        &self,
        parent: &RemoteId,
        name: &str,
    ) -> Result<RemoteFileMetadata, RemoteError> {
        self.mutate(|tree| tree.create(parent, name, true, None, 0))
    }

    fn move_to(
        &self,
        id: &RemoteId,
        new_parent: &RemoteId,
        new_name: &str,
    ) -> Result<RemoteFileMetadata, RemoteError> {
        self.mutate(|tree| tree.relocate(id, new_parent, new_name))
    }

    fn list_children(&self, parent: &RemoteId) -> Result<Vec<RemoteFileMetadata>, RemoteError> {
        self.read(|tree| tree.children(parent))
    }

    fn find_child(
        &self,
        parent: &RemoteId,
        name_or_id: &str,
    ) -> Result<Option<RemoteFileMetadata>, RemoteError> {
        self.read(|tree| tree.find_child(parent, name_or_id))
    }
}
