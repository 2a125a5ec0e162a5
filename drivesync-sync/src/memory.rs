//! In-process remote backend.
//!
//! Besides the [`RemoteBackend`] surface it can play "another client": the
//! `put_*` and `remove` helpers mutate the tree the way a third party editing
//! the remote would, and [`MemoryBackend::fail_next`] injects transient
//! failures.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use drivesync_core::{RemoteChangePackage, RemoteFileMetadata, RemoteId};

use crate::local_fs::bytes_checksum;
use crate::remote::{local_err, upload_name, RemoteBackend, RemoteError};
use crate::tree::RemoteTree;

#[derive(Debug, Default)]
struct MemoryState {
    tree: RemoteTree,
    blobs: HashMap<RemoteId, Vec<u8>>,
    failures: usize,
    uploads: usize,
}

impl MemoryState {
    fn check_failure(&mut self) -> Result<(), RemoteError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(RemoteError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `count` backend calls fail with a transient error.
    pub fn fail_next(&self, count: usize) {
        self.lock().failures = count;
    }

    /// Number of uploads and content updates served so far.
    pub fn upload_count(&self) -> usize {
        self.lock().uploads
    }

    pub fn revision(&self) -> u64 {
        self.lock().tree.revision()
    }

    pub fn content(&self, id: &RemoteId) -> Option<Vec<u8>> {
        self.lock().blobs.get(id).cloned()
    }

    /// Object at a `/`-separated path below the root.
    pub fn lookup(&self, path: &str) -> Option<RemoteFileMetadata> {
        self.lock().tree.lookup(path).cloned()
    }

    /// Create or overwrite `name` under `parent` as another client would.
    pub fn put_file(
        &self,
        parent: &RemoteId,
        name: &str,
        bytes: &[u8],
    ) -> Result<RemoteFileMetadata, RemoteError> {
        let mut state = self.lock();
        let checksum = bytes_checksum(bytes);
        let size = bytes.len() as u64;
        let meta = match state.tree.find_child(parent, name)? {
            Some(existing) => state.tree.update_content(&existing.id, checksum, size)?,
            None => state.tree.create(parent, name, false, Some(checksum), size)?,
        };
        state.blobs.insert(meta.id.clone(), bytes.to_vec());
        Ok(meta)
    }

    pub fn put_directory(
        &self,
        parent: &RemoteId,
        name: &str,
    ) -> Result<RemoteFileMetadata, RemoteError> {
        let mut state = self.lock();
        match state.tree.find_child(parent, name)? {
            Some(existing) if existing.is_dir => Ok(existing),
            _ => state.tree.create(parent, name, true, None, 0),
        }
    }

    pub fn rename(
        &self,
        id: &RemoteId,
        new_parent: &RemoteId,
        new_name: &str,
    ) -> Result<RemoteFileMetadata, RemoteError> {
        self.lock().tree.relocate(id, new_parent, new_name)
    }

    pub fn remove(&self, id: &RemoteId) -> Result<(), RemoteError> {
        let mut state = self.lock();
        for removed in state.tree.remove(id)? {
            state.blobs.remove(&removed);
        }
        Ok(())
    }
}

impl RemoteBackend for MemoryBackend {
    fn current_revision(&self) -> Result<u64, RemoteError> {
        let mut state = self.lock();
        state.check_failure()?;
        Ok(state.tree.revision())
    }

    fn poll_changes(&self, since: u64) -> Result<RemoteChangePackage, RemoteError> {
        let mut state = self.lock();
        state.check_failure()?;
        Ok(state.tree.changes_since(since))
    }

    fn upload(&self, parent: &RemoteId, local: &Path) -> Result<RemoteFileMetadata, RemoteError> {
        let name = upload_name(local)?;
        let bytes = std::fs::read(local).map_err(|e| local_err(local, e))?;
        let mut state = self.lock();
        state.check_failure()?;
        let meta = state.tree.create(
            parent,
            &name,
            false,
            Some(bytes_checksum(&bytes)),
            bytes.len() as u64,
        )?;
        state.blobs.insert(meta.id.clone(), bytes);
        state.uploads += 1;
        Ok(meta)
    }

    fn update(&self, id: &RemoteId, local: &Path) -> Result<RemoteFileMetadata, RemoteError> {
        let bytes = std::fs::read(local).map_err(|e| local_err(local, e))?;
        let mut state = self.lock();
        state.check_failure()?;
        let meta = state
            .tree
            .update_content(id, bytes_checksum(&bytes), bytes.len() as u64)?;
        state.blobs.insert(id.clone(), bytes);
        state.uploads += 1;
        Ok(meta)
    }

    fn download(&self, id: &RemoteId, destination: &Path) -> Result<(), RemoteError> {
        let bytes = {
            let mut state = self.lock();
            state.check_failure()?;
            state.tree.require(id)?;
            state.blobs.get(id).cloned().unwrap_or_default()
        };
        std::fs::write(destination, bytes).map_err(|e| local_err(destination, e))
    }

    fn delete(&self, id: &RemoteId) -> Result<(), RemoteError> {
        self.lock().check_failure()?;
        self.remove(id)
    }

    fn create_directory(
        &self,
        parent: &RemoteId,
        name: &str,
    ) -> Result<RemoteFileMetadata, RemoteError> {
        let mut state = self.lock();
        state.check_failure()?;
        state.tree.create(parent, name, true, None, 0)
    }

    fn move_to(
        &self,
        id: &RemoteId,
        new_parent: &RemoteId,
        new_name: &str,
    ) -> Result<RemoteFileMetadata, RemoteError> {
        let mut state = self.lock();
        state.check_failure()?;
        state.tree.relocate(id, new_parent, new_name)
    }

    fn list_children(&self, parent: &RemoteId) -> Result<Vec<RemoteFileMetadata>, RemoteError> {
        let mut state = self.lock();
        state.check_failure()?;
        state.tree.children(parent)
    }

    fn find_child(
        &self,
        parent: &RemoteId,
        name_or_id: &str,
    ) -> Result<Option<RemoteFileMetadata>, RemoteError> {
        let mut state = self.lock();
        state.check_failure()?;
        state.tree.find_child(parent, name_or_id)
    }
}
