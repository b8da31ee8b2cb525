//! dirsync Sync - Change propagation engine
//!
//! Provides:
//! - One-shot remote → local copy at session start
//! - Debounced, per-path coalescing of local filesystem events
//! - A bounded upload worker pool with per-path exclusivity and retries
//! - Periodic rescans that catch events the OS watcher dropped
//!
//! ## Modules
//!
//! - [`session`] - [`SyncSession`](session::SyncSession) facade and lifecycle
//! - [`initial_sync`] - Remote → local copy that gates the watch phase
//! - [`coalescer`] - Debounce queue turning raw events into pending syncs
//! - [`scheduler`] - Upload worker pool
//! - [`reconcile`] - Full local rescans against the synced snapshot
//! - [`watcher`] - `notify`-backed [`IWatcher`](dirsync_core::ports::IWatcher) adapter
//!
//! ## Data flow
//!
//! ```text
//! InitialSync (remote → local), then:
//!
//!  IWatcher ──→ mpsc ──→ ChangeCoalescer ──→ UploadScheduler ──→ IRemoteStore
//!                             ▲
//!  Reconciler ──→ mpsc ───────┘
//! ```

pub mod coalescer;
pub mod initial_sync;
pub mod reconcile;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod stats;
pub mod watcher;

use dirsync_core::domain::{errors::DomainError, newtypes::RelativePath};
use thiserror::Error;

pub use initial_sync::{InitialSync, InitialSyncReport};
pub use session::{SessionConfig, SyncSession};
pub use watcher::NotifyWatcher;

/// Errors that can occur during synchronization operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// The initial remote → local copy could not complete
    #[error("Initial sync failed for {target}: {reason}")]
    InitialSync {
        /// The prefix or key that failed
        target: String,
        /// Why it failed
        reason: String,
    },

    /// The session API was used out of order (e.g. `start()` twice)
    #[error("Invalid session state: {0}")]
    InvalidState(DomainError),

    /// A retryable upload or delete failure
    #[error("Transient upload error for {path}: {reason}")]
    TransientUpload {
        /// The path being synced
        path: RelativePath,
        /// The store's error
        reason: String,
    },

    /// A path could not be synced and was left as-is
    #[error("Failed to sync {path} after {attempts} attempt(s): {reason}")]
    PermanentSyncFailure {
        /// The path that failed
        path: RelativePath,
        /// Attempts made, including the first
        attempts: u32,
        /// The last error seen
        reason: String,
    },

    /// The filesystem event source failed or closed
    #[error("Watcher failure: {0}")]
    WatcherFailure(String),

    /// An I/O error occurred during local file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A domain-level error propagated from dirsync-core
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),
}

/// A path that permanently failed to sync, as reported on the failure channel
#[derive(Debug)]
pub struct SyncFailure {
    /// The path left un-synced
    pub path: RelativePath,
    /// Why it failed
    pub error: SyncError,
}
