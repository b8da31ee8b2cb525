//! Filesystem watcher port
//!
//! Defines the event source the engine subscribes to once the initial copy is
//! done. A subscription is a live, unbounded sequence of
//! [`WatchMessage`]s delivered over a tokio channel, plus a guard that keeps
//! the underlying OS watch alive.
//!
//! ## Design Notes
//!
//! - `subscribe` is synchronous: OS watch registration is a blocking syscall
//!   and happens once per session.
//! - The event stream never ends on its own. An [`WatchMessage::Error`] or a
//!   closed channel means the source has failed, and the session treats that
//!   as fatal.
//! - Dropping the [`WatchGuard`] stops the watch.

use std::any::Any;
use std::fmt;
use std::path::Path;

use tokio::sync::mpsc;

use crate::domain::change::FileChangeEvent;

/// One item from a watch subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchMessage {
    /// A change under the watched root
    Event(FileChangeEvent),
    /// The event source reported an error; events may have been lost
    Error(String),
}

/// RAII handle for an active filesystem watch
///
/// Holds whatever the adapter needs to keep alive (typically the OS watcher
/// itself). Dropping the guard stops the watch.
pub struct WatchGuard {
    inner: Option<Box<dyn Any + Send>>,
}

impl WatchGuard {
    /// Wraps an adapter-specific resource
    pub fn new<T: Any + Send>(resource: T) -> Self {
        Self {
            inner: Some(Box::new(resource)),
        }
    }

    /// A guard that holds nothing
    pub fn noop() -> Self {
        Self { inner: None }
    }

    /// Returns true if this guard keeps a resource alive
    pub fn is_active(&self) -> bool {
        self.inner.is_some()
    }
}

impl fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchGuard")
            .field("active", &self.is_active())
            .finish()
    }
}

/// A live subscription to filesystem changes
#[derive(Debug)]
pub struct WatchSubscription {
    events: mpsc::Receiver<WatchMessage>,
    guard: WatchGuard,
}

impl WatchSubscription {
    pub fn new(events: mpsc::Receiver<WatchMessage>, guard: WatchGuard) -> Self {
        Self { events, guard }
    }

    /// Splits the subscription into its event stream and guard
    pub fn into_parts(self) -> (mpsc::Receiver<WatchMessage>, WatchGuard) {
        (self.events, self.guard)
    }
}

/// Port trait for filesystem event sources
///
/// Paths in delivered events are relative to the `root` passed to
/// `subscribe`. Implementations must watch the whole subtree.
pub trait IWatcher: Send + Sync {
    /// Starts watching `root` recursively
    ///
    /// # Errors
    /// Returns an error if the watch cannot be registered (missing directory,
    /// permissions, OS watch limits)
    fn subscribe(&self, root: &Path) -> anyhow::Result<WatchSubscription>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::newtypes::RelativePath;

    #[test]
    fn test_guard_drop_releases_resource() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        struct Tracked(std::sync::mpsc::Sender<()>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                let _ = self.0.send(());
            }
        }

        let guard = WatchGuard::new(Tracked(tx));
        assert!(guard.is_active());
        drop(guard);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_subscription_into_parts() {
        let (tx, rx) = mpsc::channel(4);
        let sub = WatchSubscription::new(rx, WatchGuard::noop());
        let (mut events, guard) = sub.into_parts();
        assert!(!guard.is_active());

        let event = FileChangeEvent::created(RelativePath::new("a.txt").unwrap());
        tx.send(WatchMessage::Event(event.clone())).await.unwrap();
        assert_eq!(events.recv().await, Some(WatchMessage::Event(event)));
    }
}
