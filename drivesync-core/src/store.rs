//! Persisted sync state: the tracked tree and the revision cursor.
//!
//! Stored as JSON at `<home>/.drivesync/state.json`. Writes use the
//! `.tmp` + rename pattern so a crash never leaves a half-written file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{io_err, StateError};
use crate::filesystem::FileSystem;
use crate::types::TrackedFile;

/// On-disk state payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateFile {
    pub revision: u64,
    pub synced_at: DateTime<Utc>,
    pub entries: Vec<TrackedFile>,
}

impl StateFile {
    /// Snapshot `fs`, entries sorted by id for stable output.
    pub fn capture(fs: &FileSystem) -> Self {
        let mut entries: Vec<TrackedFile> = fs
            .entries()
            .filter(|entry| !entry.id.is_root())
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            revision: fs.revision(),
            synced_at: Utc::now(),
            entries,
        }
    }
}

/// `<home>/.drivesync/state.json`
pub fn state_path_at(home: &Path) -> PathBuf {
    home.join(".drivesync").join("state.json")
}

/// Load the persisted tree. Returns a fresh tree (revision 0, root only)
/// when no state has been written yet.
pub fn load_at(home: &Path) -> Result<FileSystem, StateError> {
    match load_file_at(home)? {
        Some(state) => FileSystem::from_entries(state.revision, state.entries),
        None => Ok(FileSystem::new()),
    }
}

/// Load the raw state payload, `None` if it does not exist.
pub fn load_file_at(home: &Path) -> Result<Option<StateFile>, StateError> {
    let path = state_path_at(home);
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|source| StateError::Parse { path, source })
}

/// Save `fs` atomically, cursor included.
pub fn save_at(home: &Path, fs: &FileSystem) -> Result<(), StateError> {
    save_checkpoint_at(home, fs, fs.revision())
}

/// Save `fs` with `revision` as the persisted cursor.
///
/// The daemon passes the highest revision whose changes have all been
/// applied; the next start polls again from there. Never above the model's
/// own cursor.
pub fn save_checkpoint_at(home: &Path, fs: &FileSystem, revision: u64) -> Result<(), StateError> {
    let mut state = StateFile::capture(fs);
    state.revision = revision.min(fs.revision());

    let path = state_path_at(home);
    let Some(dir) = path.parent() else {
        return Err(io_err(path, std::io::Error::other("invalid state path")));
    };
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(&state)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RemoteId;
    use tempfile::TempDir;

    #[test]
    fn fresh_tree_when_state_missing() {
        let home = TempDir::new().unwrap();
        let fs = load_at(home.path()).unwrap();
        assert_eq!(fs.revision(), 0);
        assert!(fs.is_empty());
    }

    #[test]
    fn tmp_file_cleaned_up_after_save() {
        let home = TempDir::new().unwrap();
        save_at(home.path(), &FileSystem::new()).unwrap();
        let tmp = state_path_at(home.path()).with_extension("json.tmp");
        assert!(!tmp.exists(), "tmp file should be renamed away");
        assert!(state_path_at(home.path()).exists());
    }

    #[test]
    fn checkpoint_persists_older_cursor_with_current_entries() {
        let home = TempDir::new().unwrap();
        let mut fs = FileSystem::new();
        fs.update_revision(9);
        fs.insert(TrackedFile {
            id: RemoteId::from("a"),
            name: "a.txt".into(),
            parent: Some(RemoteId::root()),
            is_dir: false,
            checksum: None,
        })
        .unwrap();

        save_checkpoint_at(home.path(), &fs, 4).unwrap();
        let reloaded = load_at(home.path()).unwrap();
        assert_eq!(reloaded.revision(), 4);
        assert!(reloaded.contains(&RemoteId::from("a")));

        save_checkpoint_at(home.path(), &fs, 12).unwrap();
        assert_eq!(load_at(home.path()).unwrap().revision(), 9);
    }

    #[test]
    fn capture_skips_root_and_sorts() {
        let mut fs = FileSystem::new();
        for id in ["b", "a"] {
            fs.insert(TrackedFile {
                id: RemoteId::from(id),
                name: format!("{id}.txt"),
                parent: Some(RemoteId::root()),
                is_dir: false,
                checksum: None,
            })
            .unwrap();
        }
        let state = StateFile::capture(&fs);
        let ids: Vec<_> = state.entries.iter().map(|e| e.id.0.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
