//! Remote store port (driven/secondary port)
//!
//! This module defines the interface for the durable side of the mirror: an
//! object-storage prefix, a network share, or another directory.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because errors at port boundaries are adapter-specific.
//!   Adapters mark failures that are worth retrying by wrapping them in
//!   [`TransientError`]; the engine treats everything else by inspection.
//! - Uses `#[async_trait]` for async trait methods.
//! - Keys are fully derived by the engine via
//!   [`RemotePrefix::key_for`](crate::domain::RemotePrefix::key_for).

use std::path::Path;

use thiserror::Error;

use crate::domain::newtypes::{RelativePath, RemoteKey, RemotePrefix};

/// Suffix of files and objects that are still being written
///
/// Adapters stage transfers under `<name>.dirsync-part` and rename into place;
/// the watcher, the rescan and the initial copy all ignore such names.
pub const PART_SUFFIX: &str = ".dirsync-part";

/// Returns true if `name` is a staging file or object
pub fn is_part_file(name: &str) -> bool {
    name.ends_with(PART_SUFFIX)
}

// ============================================================================
// RemoteObject
// ============================================================================

/// One entry from a remote listing
///
/// Only used while copying the remote prefix down at session start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Path of the object relative to the listed prefix
    pub path: RelativePath,
    /// Object size in bytes
    pub size: u64,
    /// Content identifier reported by the store, if any
    pub etag: Option<String>,
}

// ============================================================================
// TransientError
// ============================================================================

/// Marker error for failures that may succeed if retried
///
/// Adapters wrap network hiccups, throttling and 5xx responses in this type
/// (`anyhow::Error::new(TransientError::new(..))`) so the engine can retry
/// them without guessing from the message text.
#[derive(Debug, Error)]
#[error("transient remote store error: {message}")]
pub struct TransientError {
    message: String,
}

impl TransientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The underlying failure description
    pub fn message(&self) -> &str {
        &self.message
    }
}

// ============================================================================
// IRemoteStore trait
// ============================================================================

/// Port trait for remote storage operations
///
/// ## Implementation Notes
///
/// - `upload` must not leave a partially-written object visible under `key`
///   on failure when the backend allows avoiding it.
/// - `delete` of a key that does not exist must succeed.
/// - `download` writes the full object content to `local_path`, creating or
///   truncating it. Parent directories already exist.
#[async_trait::async_trait]
pub trait IRemoteStore: Send + Sync {
    /// Lists every object under `prefix`, recursively
    ///
    /// # Returns
    /// One [`RemoteObject`] per object, with paths relative to `prefix`
    async fn get(&self, prefix: &RemotePrefix) -> anyhow::Result<Vec<RemoteObject>>;

    /// Copies the object at `key` into `local_path`
    async fn download(&self, key: &RemoteKey, local_path: &Path) -> anyhow::Result<()>;

    /// Copies the file at `local_path` to the object at `key`, replacing it
    async fn upload(&self, local_path: &Path, key: &RemoteKey) -> anyhow::Result<()>;

    /// Removes the object at `key`
    async fn delete(&self, key: &RemoteKey) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_error_downcasts_through_anyhow() {
        let err = anyhow::Error::new(TransientError::new("503 Slow Down"));
        let transient = err.downcast_ref::<TransientError>().unwrap();
        assert_eq!(transient.message(), "503 Slow Down");
        assert_eq!(
            err.to_string(),
            "transient remote store error: 503 Slow Down"
        );
    }

    #[test]
    fn test_part_file_names() {
        assert!(is_part_file("a.bin.dirsync-part"));
        assert!(!is_part_file("a.bin"));
        assert!(!is_part_file("dirsync-part"));
    }

    #[test]
    fn test_transient_error_survives_context() {
        let err = anyhow::Error::new(TransientError::new("reset")).context("upload a.bin");
        assert!(err.downcast_ref::<TransientError>().is_some());
    }
}
