//! Synced snapshot
//!
//! Records the `(size, mtime)` of every file the session believes is
//! mirrored remotely. Written by InitialSync and the upload workers, read by
//! the reconciler to detect changes the watcher missed.

use std::fs::Metadata;
use std::time::SystemTime;

use dashmap::DashMap;
use dirsync_core::domain::newtypes::RelativePath;

/// Size and modification time of a local file at the moment it was synced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

impl FileStamp {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            size: metadata.len(),
            mtime: metadata.modified().ok(),
        }
    }
}

/// Concurrent map from path to last synced stamp
#[derive(Debug, Default)]
pub struct SyncedSnapshot {
    entries: DashMap<RelativePath, FileStamp>,
}

impl SyncedSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, path: RelativePath, stamp: FileStamp) {
        self.entries.insert(path, stamp);
    }

    pub fn remove(&self, path: &RelativePath) {
        self.entries.remove(path);
    }

    pub fn get(&self, path: &RelativePath) -> Option<FileStamp> {
        self.entries.get(path).map(|entry| *entry.value())
    }

    /// Returns true if `stamp` differs from what was last synced for `path`
    pub fn is_changed(&self, path: &RelativePath, stamp: &FileStamp) -> bool {
        self.get(path).map_or(true, |synced| synced != *stamp)
    }

    /// All recorded paths, in no particular order
    pub fn paths(&self) -> Vec<RelativePath> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn stamp(size: u64, secs: u64) -> FileStamp {
        FileStamp {
            size,
            mtime: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs)),
        }
    }

    #[test]
    fn test_unknown_path_is_changed() {
        let snapshot = SyncedSnapshot::new();
        let path = RelativePath::new("a.bin").unwrap();
        assert!(snapshot.is_changed(&path, &stamp(1, 1)));
    }

    #[test]
    fn test_record_and_compare() {
        let snapshot = SyncedSnapshot::new();
        let path = RelativePath::new("a.bin").unwrap();
        snapshot.record(path.clone(), stamp(10, 5));

        assert!(!snapshot.is_changed(&path, &stamp(10, 5)));
        assert!(snapshot.is_changed(&path, &stamp(11, 5)));
        assert!(snapshot.is_changed(&path, &stamp(10, 6)));
    }

    #[test]
    fn test_remove() {
        let snapshot = SyncedSnapshot::new();
        let path = RelativePath::new("dir/a.bin").unwrap();
        snapshot.record(path.clone(), stamp(1, 1));
        assert_eq!(snapshot.len(), 1);

        snapshot.remove(&path);
        assert!(snapshot.is_empty());
        assert!(snapshot.get(&path).is_none());
    }
}
