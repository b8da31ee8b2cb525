//! Filesystem change events
//!
//! A [`FileChangeEvent`] is the raw input of the engine: one observation of a
//! path being created, modified or deleted. Events are produced by a watcher
//! adapter and consumed by the change coalescer, which folds bursts of them
//! into a single pending sync per path.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::RelativePath;

/// What happened to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A new file appeared
    Created,
    /// An existing file's content or metadata changed
    Modified,
    /// The file was removed
    Deleted,
}

impl ChangeKind {
    /// Rank used to break ties between observations with the same timestamp
    ///
    /// `Deleted` outranks `Modified`, which outranks `Created`.
    const fn precedence(self) -> u8 {
        match self {
            ChangeKind::Created => 0,
            ChangeKind::Modified => 1,
            ChangeKind::Deleted => 2,
        }
    }

    /// Returns true if `self` should replace `other` when both were observed
    /// at the same instant
    #[must_use]
    pub const fn outranks(self, other: ChangeKind) -> bool {
        self.precedence() > other.precedence()
    }

    /// Returns true for kinds that remove the remote object
    #[must_use]
    pub const fn is_delete(self) -> bool {
        matches!(self, ChangeKind::Deleted)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// A single observed filesystem change under the local root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeEvent {
    /// Path relative to the local root
    pub path: RelativePath,
    /// What happened
    pub kind: ChangeKind,
    /// When the change was observed
    pub observed_at: DateTime<Utc>,
}

impl FileChangeEvent {
    /// Creates an event observed now
    pub fn new(path: RelativePath, kind: ChangeKind) -> Self {
        Self::with_timestamp(path, kind, Utc::now())
    }

    /// Creates an event with an explicit observation time
    pub fn with_timestamp(path: RelativePath, kind: ChangeKind, observed_at: DateTime<Utc>) -> Self {
        Self {
            path,
            kind,
            observed_at,
        }
    }

    pub fn created(path: RelativePath) -> Self {
        Self::new(path, ChangeKind::Created)
    }

    pub fn modified(path: RelativePath) -> Self {
        Self::new(path, ChangeKind::Modified)
    }

    pub fn deleted(path: RelativePath) -> Self {
        Self::new(path, ChangeKind::Deleted)
    }
}
