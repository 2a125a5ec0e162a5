//! Revision-tracking model of the synced tree.
//!
//! Entries live in an arena keyed by [`RemoteId`]. Each entry stores only its
//! name and parent; a children index (`parent → name → id`) answers path
//! lookups. Moving a directory relinks one entry and leaves its subtree alone.
//!
//! All paths handled here are relative to the synced root; the empty path is
//! the root itself.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

use crate::error::StateError;
use crate::types::{RemoteId, TrackedFile};

#[derive(Debug, Clone)]
pub struct FileSystem {
    revision: u64,
    entries: HashMap<RemoteId, TrackedFile>,
    children: HashMap<RemoteId, BTreeMap<String, RemoteId>>,
}

impl Default for FileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem {
    /// Empty tree at revision 0 holding only the root sentinel.
    pub fn new() -> Self {
        let root = TrackedFile::root();
        let mut entries = HashMap::new();
        let mut children = HashMap::new();
        children.insert(root.id.clone(), BTreeMap::new());
        entries.insert(root.id.clone(), root);
        Self {
            revision: 0,
            entries,
            children,
        }
    }

    /// Rebuild a tree from persisted entries, validating parent links.
    pub fn from_entries(
        revision: u64,
        entries: impl IntoIterator<Item = TrackedFile>,
    ) -> Result<Self, StateError> {
        let mut fs = Self::new();
        fs.revision = revision;

        let mut pending: Vec<TrackedFile> = entries
            .into_iter()
            .filter(|entry| !entry.id.is_root())
            .collect();

        // Parents may be listed after their children; insert in passes.
        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();
            for entry in pending {
                let parent_known = entry
                    .parent
                    .as_ref()
                    .map(|parent| fs.entries.contains_key(parent))
                    .unwrap_or(false);
                if parent_known {
                    fs.insert(entry)?;
                } else {
                    deferred.push(entry);
                }
            }
            if deferred.len() == before {
                let orphan = &deferred[0];
                return Err(StateError::Integrity(format!(
                    "entry {} ('{}') has no tracked parent",
                    orphan.id, orphan.name
                )));
            }
            pending = deferred;
        }

        Ok(fs)
    }

    // -----------------------------------------------------------------------
    // Revision cursor
    // -----------------------------------------------------------------------

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Advance the revision cursor. Returns `false` (and keeps the current
    /// value) when `revision` would move the cursor backwards.
    pub fn update_revision(&mut self, revision: u64) -> bool {
        if revision < self.revision {
            return false;
        }
        self.revision = revision;
        true
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, id: &RemoteId) -> Option<&TrackedFile> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &RemoteId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of tracked entries, root excluded.
    pub fn len(&self) -> usize {
        self.entries.len() - 1
    }

    /// `true` when nothing but the root is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries in unspecified order, root included.
    pub fn entries(&self) -> impl Iterator<Item = &TrackedFile> {
        self.entries.values()
    }

    /// Direct children of `id`, sorted by name.
    pub fn children(&self, id: &RemoteId) -> Vec<&TrackedFile> {
        self.children
            .get(id)
            .map(|names| {
                names
                    .values()
                    .filter_map(|child| self.entries.get(child))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remote identity of the entry at `path` (relative to the root).
    pub fn id_for_path(&self, path: &Path) -> Option<&RemoteId> {
        let mut current = self.entries.get(&RemoteId::root()).map(|root| &root.id)?;
        for component in path.components() {
            match component {
                Component::Normal(name) => {
                    let name = name.to_str()?;
                    current = self.children.get(current)?.get(name)?;
                }
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn get_by_path(&self, path: &Path) -> Option<&TrackedFile> {
        self.id_for_path(path).and_then(|id| self.entries.get(id))
    }

    /// Path of `id` relative to the root, built by walking parent links.
    pub fn path_of(&self, id: &RemoteId) -> Option<PathBuf> {
        let mut names = Vec::new();
        let mut current = self.entries.get(id)?;
        while let Some(parent) = current.parent.as_ref() {
            names.push(current.name.as_str());
            current = self.entries.get(parent)?;
        }
        Some(names.iter().rev().collect())
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Track `file` under its parent. Re-inserting a known id updates it in
    /// place, relinking when its parent or name changed.
    pub fn insert(&mut self, file: TrackedFile) -> Result<(), StateError> {
        if file.id.is_root() {
            return Err(StateError::RootImmutable);
        }
        let parent = file.parent.clone().ok_or_else(|| {
            StateError::Integrity(format!("non-root entry {} has no parent", file.id))
        })?;
        if !self.entries.contains_key(&parent) {
            return Err(StateError::UnknownParent {
                id: file.id,
                parent,
            });
        }

        if self.entries.contains_key(&file.id) {
            self.relink(&file.id, &parent, &file.name)?;
            if let Some(entry) = self.entries.get_mut(&file.id) {
                entry.is_dir = file.is_dir;
                entry.checksum = file.checksum;
            }
            return Ok(());
        }

        self.claim_name(&parent, &file.name, &file.id)?;
        if file.is_dir {
            self.children.entry(file.id.clone()).or_default();
        }
        self.entries.insert(file.id.clone(), file);
        Ok(())
    }

    /// Move and/or rename `id` to `name` under `new_parent`.
    pub fn relink(
        &mut self,
        id: &RemoteId,
        new_parent: &RemoteId,
        name: &str,
    ) -> Result<(), StateError> {
        if id.is_root() {
            return Err(StateError::RootImmutable);
        }
        let (old_parent, old_name) = match self.entries.get(id) {
            Some(entry) => (entry.parent.clone(), entry.name.clone()),
            None => return Err(StateError::UnknownEntry(id.clone())),
        };
        if !self.entries.contains_key(new_parent) {
            return Err(StateError::UnknownParent {
                id: id.clone(),
                parent: new_parent.clone(),
            });
        }
        if old_parent.as_ref() == Some(new_parent) && old_name == name {
            return Ok(());
        }
        if self.is_ancestor_or_self(id, new_parent) {
            return Err(StateError::Cycle {
                id: id.clone(),
                parent: new_parent.clone(),
            });
        }

        self.claim_name(new_parent, name, id)?;
        if let Some(old_parent) = old_parent.as_ref() {
            self.release_name(old_parent, &old_name, id);
        }
        if let Some(entry) = self.entries.get_mut(id) {
            entry.parent = Some(new_parent.clone());
            entry.name = name.to_owned();
        }
        Ok(())
    }

    /// Stop tracking `id` and everything beneath it. Returns the removed ids
    /// with the relative paths they had, parents before children.
    pub fn remove(&mut self, id: &RemoteId) -> Result<Vec<(RemoteId, PathBuf)>, StateError> {
        if id.is_root() {
            return Err(StateError::RootImmutable);
        }
        let base = self
            .path_of(id)
            .ok_or_else(|| StateError::UnknownEntry(id.clone()))?;

        let mut removed = Vec::new();
        let mut stack = vec![(id.clone(), base)];
        while let Some((current, path)) = stack.pop() {
            if let Some(names) = self.children.remove(&current) {
                for (name, child) in names {
                    stack.push((child, path.join(name)));
                }
            }
            removed.push((current, path));
        }

        if let Some(entry) = self.entries.get(id) {
            if let Some(parent) = entry.parent.clone() {
                let name = entry.name.clone();
                self.release_name(&parent, &name, id);
            }
        }
        for (removed_id, _) in &removed {
            self.entries.remove(removed_id);
        }
        removed.sort_by_key(|(_, path)| path.components().count());
        Ok(removed)
    }

    pub fn set_checksum(
        &mut self,
        id: &RemoteId,
        checksum: Option<String>,
    ) -> Result<(), StateError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| StateError::UnknownEntry(id.clone()))?;
        entry.checksum = checksum;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn claim_name(&mut self, parent: &RemoteId, name: &str, id: &RemoteId) -> Result<(), StateError> {
        let names = self.children.entry(parent.clone()).or_default();
        match names.get(name) {
            Some(existing) if existing != id => Err(StateError::NameTaken {
                parent: parent.clone(),
                name: name.to_owned(),
                existing: existing.clone(),
            }),
            _ => {
                names.insert(name.to_owned(), id.clone());
                Ok(())
            }
        }
    }

    fn release_name(&mut self, parent: &RemoteId, name: &str, id: &RemoteId) {
        if let Some(names) = self.children.get_mut(parent) {
            if names.get(name) == Some(id) {
                names.remove(name);
            }
        }
    }

    fn is_ancestor_or_self(&self, ancestor: &RemoteId, id: &RemoteId) -> bool {
        let mut current = Some(id);
        while let Some(cursor) = current {
            if cursor == ancestor {
                return true;
            }
            current = self.entries.get(cursor).and_then(|e| e.parent.as_ref());
        }
        false
    }
}
