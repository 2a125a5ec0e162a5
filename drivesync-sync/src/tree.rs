//! Object table and change log shared by the bundled backends.
//!
//! Every mutation bumps one global revision and appends to the log, so
//! `changes_since` can answer delta queries the way a hosted drive does.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use drivesync_core::{Change, ChangeKind, RemoteChangePackage, RemoteFileMetadata, RemoteId};

use crate::remote::RemoteError;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogEntry {
    revision: u64,
    id: RemoteId,
    kind: ChangeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTree {
    revision: u64,
    next_id: u64,
    objects: BTreeMap<RemoteId, RemoteFileMetadata>,
    log: Vec<LogEntry>,
}

impl Default for RemoteTree {
    fn default() -> Self {
        let mut objects = BTreeMap::new();
        objects.insert(
            RemoteId::root(),
            RemoteFileMetadata {
                id: RemoteId::root(),
                name: String::new(),
                parent: None,
                is_dir: true,
                checksum: None,
                size: 0,
            },
        );
        Self {
            revision: 0,
            next_id: 0,
            objects,
            log: Vec::new(),
        }
    }
}

impl RemoteTree {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, id: &RemoteId) -> Option<&RemoteFileMetadata> {
        self.objects.get(id)
    }

    pub fn require(&self, id: &RemoteId) -> Result<&RemoteFileMetadata, RemoteError> {
        self.objects
            .get(id)
            .ok_or_else(|| RemoteError::NotFound(id.clone()))
    }

    /// Children of `parent`, sorted by name.
    pub fn children(&self, parent: &RemoteId) -> Result<Vec<RemoteFileMetadata>, RemoteError> {
        self.require_dir(parent)?;
        let mut children: Vec<RemoteFileMetadata> = self
            .objects
            .values()
            .filter(|meta| meta.parent.as_ref() == Some(parent))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    pub fn find_child(
        &self,
        parent: &RemoteId,
        name_or_id: &str,
    ) -> Result<Option<RemoteFileMetadata>, RemoteError> {
        Ok(self
            .children(parent)?
            .into_iter()
            .find(|meta| meta.name == name_or_id || meta.id.0 == name_or_id))
    }

    /// Object at a `/`-separated path below the root.
    pub fn lookup(&self, path: &str) -> Option<&RemoteFileMetadata> {
        let mut current = self.objects.get(&RemoteId::root())?;
        for name in path.split('/').filter(|part| !part.is_empty()) {
            current = self
                .objects
                .values()
                .find(|meta| meta.parent.as_ref() == Some(&current.id) && meta.name == name)?;
        }
        Some(current)
    }

    pub fn create(
        &mut self,
        parent: &RemoteId,
        name: &str,
        is_dir: bool,
        checksum: Option<String>,
        size: u64,
    ) -> Result<RemoteFileMetadata, RemoteError> {
        self.require_dir(parent)?;
        self.require_free_name(parent, name, None)?;

        self.next_id += 1;
        let id = RemoteId::from(format!("obj-{:06}", self.next_id));
        let meta = RemoteFileMetadata {
            id: id.clone(),
            name: name.to_owned(),
            parent: Some(parent.clone()),
            is_dir,
            checksum,
            size,
        };
        self.objects.insert(id.clone(), meta.clone());
        self.record(id, ChangeKind::Created);
        Ok(meta)
    }

    pub fn update_content(
        &mut self,
        id: &RemoteId,
        checksum: String,
        size: u64,
    ) -> Result<RemoteFileMetadata, RemoteError> {
        let meta = self
            .objects
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(id.clone()))?;
        if meta.is_dir {
            return Err(RemoteError::Rejected(format!("{id} is a directory")));
        }
        meta.checksum = Some(checksum);
        meta.size = size;
        let meta = meta.clone();
        self.record(id.clone(), ChangeKind::Modified);
        Ok(meta)
    }

    pub fn relocate(
        &mut self,
        id: &RemoteId,
        new_parent: &RemoteId,
        new_name: &str,
    ) -> Result<RemoteFileMetadata, RemoteError> {
        if id.is_root() {
            return Err(RemoteError::Rejected("the root cannot be moved".to_string()));
        }
        self.require(id)?;
        self.require_dir(new_parent)?;
        self.require_free_name(new_parent, new_name, Some(id))?;

        let mut cursor = Some(new_parent.clone());
        while let Some(current) = cursor {
            if &current == id {
                return Err(RemoteError::Rejected(format!(
                    "moving {id} under {new_parent} would create a cycle"
                )));
            }
            cursor = self.objects.get(&current).and_then(|m| m.parent.clone());
        }

        let meta = self
            .objects
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(id.clone()))?;
        meta.parent = Some(new_parent.clone());
        meta.name = new_name.to_owned();
        let meta = meta.clone();
        self.record(id.clone(), ChangeKind::Moved);
        Ok(meta)
    }

    /// Remove `id` and its subtree, returning every removed id.
    pub fn remove(&mut self, id: &RemoteId) -> Result<Vec<RemoteId>, RemoteError> {
        if id.is_root() {
            return Err(RemoteError::Rejected("the root cannot be deleted".to_string()));
        }
        self.require(id)?;

        let mut removed = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            stack.extend(
                self.objects
                    .values()
                    .filter(|meta| meta.parent.as_ref() == Some(&current))
                    .map(|meta| meta.id.clone()),
            );
            self.objects.remove(&current);
            removed.push(current);
        }
        for removed_id in &removed {
            self.record(removed_id.clone(), ChangeKind::Deleted);
        }
        Ok(removed)
    }

    /// Latest state of every object changed after `since`, in order of first
    /// change so freshly created parents precede their children.
    pub fn changes_since(&self, since: u64) -> RemoteChangePackage {
        let mut order: Vec<RemoteId> = Vec::new();
        let mut kinds: HashMap<RemoteId, ChangeKind> = HashMap::new();
        for entry in self.log.iter().filter(|entry| entry.revision > since) {
            match kinds.get_mut(&entry.id) {
                Some(kind) => *kind = kind.coalesce(entry.kind),
                None => {
                    order.push(entry.id.clone());
                    kinds.insert(entry.id.clone(), entry.kind);
                }
            }
        }

        let changes = order
            .into_iter()
            .map(|id| match self.objects.get(&id) {
                Some(meta) => {
                    let kind = match kinds.get(&id) {
                        Some(ChangeKind::Deleted) | None => ChangeKind::Modified,
                        Some(kind) => *kind,
                    };
                    Change::remote(kind, meta.clone())
                }
                None => Change::remote_deleted(id),
            })
            .collect();

        RemoteChangePackage {
            changes,
            revision: self.revision.max(since),
        }
    }

    fn record(&mut self, id: RemoteId, kind: ChangeKind) {
        self.revision += 1;
        self.log.push(LogEntry {
            revision: self.revision,
            id,
            kind,
        });
    }

    fn require_dir(&self, id: &RemoteId) -> Result<(), RemoteError> {
        if self.require(id)?.is_dir {
            Ok(())
        } else {
            Err(RemoteError::Rejected(format!("{id} is not a directory")))
        }
    }

    fn require_free_name(
        &self,
        parent: &RemoteId,
        name: &str,
        except: Option<&RemoteId>,
    ) -> Result<(), RemoteError> {
        if name.is_empty() || name.contains('/') {
            return Err(RemoteError::Rejected(format!("invalid name '{name}'")));
        }
        let taken = self.objects.values().any(|meta| {
            meta.parent.as_ref() == Some(parent) && meta.name == name && Some(&meta.id) != except
        });
        if taken {
            return Err(RemoteError::Rejected(format!(
                "'{name}' already exists under {parent}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repoll_without_mutation_is_empty() {
        let mut tree = RemoteTree::default();
        tree.create(&RemoteId::root(), "a.txt", false, Some("aa".into()), 2)
            .unwrap();
        let first = tree.changes_since(0);
        assert_eq!(first.changes.len(), 1);
        let second = tree.changes_since(first.revision);
        assert!(second.changes.is_empty());
        assert_eq!(second.revision, first.revision);
    }

    #[test]
    fn delta_reports_latest_state_once_per_object() {
        let mut tree = RemoteTree::default();
        let dir = tree
            .create(&RemoteId::root(), "docs", true, None, 0)
            .unwrap();
        let file = tree
            .create(&dir.id, "a.txt", false, Some("v1".into()), 2)
            .unwrap();
        tree.update_content(&file.id, "v2".into(), 2).unwrap();

        let package = tree.changes_since(0);
        assert_eq!(package.revision, 3);
        let ids: Vec<_> = package.changes.iter().map(|c| c.key.clone()).collect();
        assert_eq!(ids, vec![dir.id.clone(), file.id.clone()]);
        let last = &package.changes[1];
        assert_eq!(last.kind, ChangeKind::Created);
        assert_eq!(
            last.meta.as_ref().and_then(|m| m.checksum.clone()),
            Some("v2".to_string())
        );
    }

    #[test]
    fn removing_directory_logs_subtree_deletions() {
        let mut tree = RemoteTree::default();
        let dir = tree
            .create(&RemoteId::root(), "docs", true, None, 0)
            .unwrap();
        tree.create(&dir.id, "a.txt", false, None, 0).unwrap();
        let since = tree.revision();
        tree.remove(&dir.id).unwrap();

        let package = tree.changes_since(since);
        assert_eq!(package.changes.len(), 2);
        assert!(package
            .changes
            .iter()
            .all(|c| c.kind == ChangeKind::Deleted && c.meta.is_none()));
    }

    #[test]
    fn revision_never_reported_below_request() {
        let tree = RemoteTree::default();
        assert_eq!(tree.changes_since(50).revision, 50);
    }

    #[test]
    fn relocate_rejects_cycles_and_name_clashes() {
        let mut tree = RemoteTree::default();
        let a = tree.create(&RemoteId::root(), "a", true, None, 0).unwrap();
        let b = tree.create(&a.id, "b", true, None, 0).unwrap();
        tree.create(&RemoteId::root(), "c", true, None, 0).unwrap();
        assert!(tree.relocate(&a.id, &b.id, "a").is_err());
        assert!(tree.relocate(&b.id, &RemoteId::root(), "c").is_err());
        let moved = tree.relocate(&b.id, &RemoteId::root(), "b2").unwrap();
        assert_eq!(moved.parent, Some(RemoteId::root()));
        assert_eq!(tree.lookup("b2").map(|m| m.id.clone()), Some(b.id));
    }
}
