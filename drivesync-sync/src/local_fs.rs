//! Local file helpers: content digests and temp-file naming.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Suffix of in-flight downloads; the local watcher never reports these.
pub const TMP_SUFFIX: &str = ".drivesync.tmp";

/// SHA-256 hex digest and size of the file at `path`.
pub fn file_checksum(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        size += read as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

pub fn bytes_checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `<path>.drivesync.tmp`, next to `path` so the final rename stays on one
/// filesystem.
pub fn tmp_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}{TMP_SUFFIX}", path.display()))
}

pub fn is_tmp_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(TMP_SUFFIX))
        .unwrap_or(false)
}

/// Number of components below the synced root; parents sort before children.
pub fn depth(path: &Path) -> usize {
    path.components().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_and_bytes_checksums_agree() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let (sum, size) = file_checksum(&path).unwrap();
        assert_eq!(size, 5);
        assert_eq!(sum, bytes_checksum(b"hello"));
        assert_eq!(
            sum,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn tmp_paths_are_recognised() {
        let tmp = tmp_path(Path::new("/r/docs/a.txt"));
        assert_eq!(tmp, PathBuf::from("/r/docs/a.txt.drivesync.tmp"));
        assert!(is_tmp_path(&tmp));
        assert!(!is_tmp_path(Path::new("/r/docs/a.txt")));
    }
}
