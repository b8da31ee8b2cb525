//! Port definitions (hexagonal architecture interfaces)
//!
//! Ports are the interfaces the engine depends on, whose implementations
//! live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IRemoteStore`] - List, download, upload and delete remote objects
//! - [`IWatcher`] - Subscribe to filesystem change events under a directory

pub mod remote_store;
pub mod watcher;

pub use remote_store::{is_part_file, IRemoteStore, RemoteObject, TransientError, PART_SUFFIX};
pub use watcher::{IWatcher, WatchGuard, WatchMessage, WatchSubscription};
