//! Domain types shared by both sides of the sync loop.
//!
//! Local changes are keyed by absolute [`PathBuf`], remote changes by
//! [`RemoteId`]. The [`ChangeKey`] trait ties each key type to the metadata a
//! handler needs to mirror the change on the opposite side.

use std::fmt;
use std::fmt::Debug;
use std::hash::Hash;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Identifier the remote backend uses for the synced root directory.
pub const ROOT_ID: &str = "root";

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Stable handle assigned by the remote backend to a file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(pub String);

impl RemoteId {
    pub fn root() -> Self {
        Self(ROOT_ID.to_owned())
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_ID
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RemoteId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RemoteId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Change
// ---------------------------------------------------------------------------

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

impl ChangeKind {
    /// Kind of a pending change after a newer observation of the same key.
    ///
    /// The newest observation wins, except that a pending move keeps its
    /// origin when the file is written afterwards, and a creation stays a
    /// creation when the new file is written again.
    pub fn coalesce(self, next: ChangeKind) -> ChangeKind {
        match (self, next) {
            (ChangeKind::Moved, ChangeKind::Created | ChangeKind::Modified) => ChangeKind::Moved,
            (ChangeKind::Created, ChangeKind::Modified) => ChangeKind::Created,
            (_, next) => next,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Deleted => write!(f, "deleted"),
            ChangeKind::Moved => write!(f, "moved"),
        }
    }
}

/// Key type of a pending change set, with the metadata its changes carry.
pub trait ChangeKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    type Meta: Clone + Debug + Send + Sync + 'static;

    /// Metadata of a pending change after a newer observation of the same key.
    fn merge_meta(previous: Self::Meta, next: Self::Meta) -> Self::Meta;
}

/// Extra detail recorded for local changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalMeta {
    /// Previous absolute path when the change is a move or rename.
    pub moved_from: Option<PathBuf>,
}

impl ChangeKey for PathBuf {
    type Meta = LocalMeta;

    fn merge_meta(previous: LocalMeta, next: LocalMeta) -> LocalMeta {
        LocalMeta {
            moved_from: next.moved_from.or(previous.moved_from),
        }
    }
}

impl ChangeKey for RemoteId {
    /// Latest remote metadata; `None` for deletions.
    type Meta = Option<RemoteFileMetadata>;

    fn merge_meta(
        _previous: Option<RemoteFileMetadata>,
        next: Option<RemoteFileMetadata>,
    ) -> Option<RemoteFileMetadata> {
        next
    }
}

/// One unit of pending work, tagged by the side it was observed on.
#[derive(Debug, Clone)]
pub struct Change<K: ChangeKey> {
    pub key: K,
    pub kind: ChangeKind,
    pub meta: K::Meta,
}

impl<K: ChangeKey> Change<K> {
    pub fn new(key: K, kind: ChangeKind, meta: K::Meta) -> Self {
        Self { key, kind, meta }
    }

    /// Fold a newer observation of the same key into this change.
    pub fn merge(self, next: Change<K>) -> Change<K> {
        Change {
            key: next.key,
            kind: self.kind.coalesce(next.kind),
            meta: K::merge_meta(self.meta, next.meta),
        }
    }
}

impl Change<PathBuf> {
    pub fn local(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self::new(path.into(), kind, LocalMeta::default())
    }

    pub fn local_move(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self::new(
            to.into(),
            ChangeKind::Moved,
            LocalMeta {
                moved_from: Some(from.into()),
            },
        )
    }
}

impl Change<RemoteId> {
    pub fn remote(kind: ChangeKind, file: RemoteFileMetadata) -> Self {
        Self::new(file.id.clone(), kind, Some(file))
    }

    pub fn remote_deleted(id: RemoteId) -> Self {
        Self::new(id, ChangeKind::Deleted, None)
    }
}

// ---------------------------------------------------------------------------
// Remote metadata
// ---------------------------------------------------------------------------

/// Metadata the remote backend reports for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileMetadata {
    pub id: RemoteId,
    pub name: String,
    /// `None` only for the root.
    pub parent: Option<RemoteId>,
    pub is_dir: bool,
    /// SHA-256 hex digest of the contents; absent for directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub size: u64,
}

/// Result of one remote poll.
#[derive(Debug, Clone, Default)]
pub struct RemoteChangePackage {
    pub changes: Vec<Change<RemoteId>>,
    /// Revision to resume from; never below the requested revision.
    pub revision: u64,
}

// ---------------------------------------------------------------------------
// Tracked tree entries
// ---------------------------------------------------------------------------

/// One file or directory whose remote identity is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedFile {
    pub id: RemoteId,
    pub name: String,
    /// `None` only for the root sentinel.
    pub parent: Option<RemoteId>,
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl TrackedFile {
    pub fn root() -> Self {
        Self {
            id: RemoteId::root(),
            name: String::new(),
            parent: None,
            is_dir: true,
            checksum: None,
        }
    }
}

impl From<&RemoteFileMetadata> for TrackedFile {
    fn from(meta: &RemoteFileMetadata) -> Self {
        Self {
            id: meta.id.clone(),
            name: meta.name.clone(),
            parent: meta.parent.clone(),
            is_dir: meta.is_dir,
            checksum: meta.checksum.clone(),
        }
    }
}
