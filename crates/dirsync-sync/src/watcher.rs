//! File watcher - `notify`-backed [`IWatcher`] adapter
//!
//! Wraps the OS-native watcher (inotify on Linux, FSEvents/kqueue on macOS)
//! and converts raw `notify` events into [`FileChangeEvent`]s relative to the
//! watched root. Renames are split into a delete of the old path and a
//! create of the new one. Errors from the OS watcher are forwarded as
//! [`WatchMessage::Error`].
//!
//! ```text
//! inotify / FSEvents
//!       │
//!       ▼
//!  NotifyWatcher ──→ mpsc::channel<WatchMessage> ──→ ChangeCoalescer
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dirsync_core::domain::{ChangeKind, FileChangeEvent, RelativePath};
use dirsync_core::ports::{is_part_file, IWatcher, WatchGuard, WatchMessage, WatchSubscription};
use notify::event::{Flag, ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};


/// Default capacity of the event channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Recursive OS watcher for a local directory
#[derive(Debug, Clone)]
pub struct NotifyWatcher {
    channel_capacity: usize,
}

impl NotifyWatcher {
    pub fn new() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl Default for NotifyWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl IWatcher for NotifyWatcher {
    /// Starts a recursive watch on `root`
    ///
    /// The returned guard owns the OS watcher; dropping it stops the watch
    /// and closes the event channel.
    fn subscribe(&self, root: &Path) -> Result<WatchSubscription> {
        // FSEvents reports canonical paths; match them against a canonical root
        let root = std::fs::canonicalize(root)
            .with_context(|| format!("Failed to resolve watch root: {}", root.display()))?;
        let (tx, rx) = mpsc::channel::<WatchMessage>(self.channel_capacity);

        info!(path = %root.display(), "Starting recursive watch");

        let callback_root = root.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                let messages = match res {
                    Ok(event) => map_notify_event(&event, &callback_root)
                        .into_iter()
                        .map(WatchMessage::Event)
                        .collect(),
                    Err(err) => {
                        error!(error = %err, "File watcher error");
                        vec![WatchMessage::Error(err.to_string())]
                    }
                };
                for message in messages {
                    if tx.blocking_send(message).is_err() {
                        debug!("Watch subscription dropped, discarding event");
                        return;
                    }
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch path: {}", root.display()))?;

        Ok(WatchSubscription::new(rx, WatchGuard::new(watcher)))
    }
}

// ============================================================================
// Event mapping - notify::Event → FileChangeEvent
// ============================================================================

/// Converts a `notify::Event` into zero or more [`FileChangeEvent`]s
///
/// - `Create(*)` → `Created`
/// - `Modify(Name(Both))` with 2 paths → `Deleted(old)` + `Created(new)`
/// - `Modify(Name(From))` → `Deleted`, `Modify(Name(To))` → `Created`
/// - `Remove(*)` → `Deleted`
/// - any other `Modify(*)` → `Modified`
/// - access and unknown events are ignored
///
/// Paths outside `root`, the root itself and partial download files are
/// dropped. A directory that appears (created, or renamed/moved into the
/// tree) also yields a `Created` event for every file beneath it, since the
/// OS reports only the directory itself.
pub fn map_notify_event(event: &notify::Event, root: &Path) -> Vec<FileChangeEvent> {
    if event.flag() == Some(Flag::Rescan) {
        warn!("Watcher lost events and requested a rescan");
    }

    let paths = &event.paths;
    let mapped: Vec<(ChangeKind, &PathBuf)> = match &event.kind {
        EventKind::Create(_) => paths.iter().map(|p| (ChangeKind::Created, p)).collect(),

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            vec![
                (ChangeKind::Deleted, &paths[0]),
                (ChangeKind::Created, &paths[1]),
            ]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.iter().map(|p| (ChangeKind::Deleted, p)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.iter().map(|p| (ChangeKind::Created, p)).collect()
        }
        EventKind::Modify(_) => paths.iter().map(|p| (ChangeKind::Modified, p)).collect(),

        EventKind::Remove(_) => paths.iter().map(|p| (ChangeKind::Deleted, p)).collect(),

        _ => {
            debug!(kind = ?event.kind, "Ignoring event kind");
            Vec::new()
        }
    };

    let mut events = Vec::new();
    for (kind, path) in mapped {
        let Some(relative) = to_relative(root, path) else {
            continue;
        };
        debug!(path = %relative, %kind, "Mapped watcher event");
        events.push(FileChangeEvent::new(relative, kind));
        if kind == ChangeKind::Created && path.is_dir() {
            expand_directory(root, path, &mut events);
        }
    }
    events
}

/// Emits `Created` for every file under a directory that just appeared
fn expand_directory(root: &Path, dir: &Path, events: &mut Vec<FileChangeEvent>) {
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(path = %current.display(), error = %err, "Cannot list new directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            match entry.file_type() {
                Ok(kind) if kind.is_dir() => pending.push(path),
                Ok(kind) if kind.is_file() => {
                    if let Some(relative) = to_relative(root, &path) {
                        events.push(FileChangeEvent::created(relative));
                    }
                }
                _ => {}
            }
        }
    }
}

fn to_relative(root: &Path, path: &Path) -> Option<RelativePath> {
    let relative = RelativePath::from_local(root, path).ok()?;
    if is_part_file(relative.file_name()) {
        return None;
    }
    Some(relative)
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, RemoveKind};

    use super::*;

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        notify::Event {
            kind,
            paths: paths.iter().map(PathBuf::from).collect(),
            attrs: Default::default(),
        }
    }

    fn summary(events: &[FileChangeEvent]) -> Vec<(String, ChangeKind)> {
        events
            .iter()
            .map(|e| (e.path.to_string(), e.kind))
            .collect()
    }

    const ROOT: &str = "/data/run";

    #[test]
    fn test_map_create_event() {
        let mapped = map_notify_event(
            &event(EventKind::Create(CreateKind::File), &["/data/run/a.txt"]),
            Path::new(ROOT),
        );
        assert_eq!(summary(&mapped), vec![("a.txt".into(), ChangeKind::Created)]);
    }

    #[test]
    fn test_map_modify_data_event() {
        let mapped = map_notify_event(
            &event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &["/data/run/logs/log.txt"],
            ),
            Path::new(ROOT),
        );
        assert_eq!(
            summary(&mapped),
            vec![("logs/log.txt".into(), ChangeKind::Modified)]
        );
    }

    #[test]
    fn test_map_rename_splits_into_delete_and_create() {
        let mapped = map_notify_event(
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/data/run/old.txt", "/data/run/new.txt"],
            ),
            Path::new(ROOT),
        );
        assert_eq!(
            summary(&mapped),
            vec![
                ("old.txt".into(), ChangeKind::Deleted),
                ("new.txt".into(), ChangeKind::Created),
            ]
        );
    }

    #[test]
    fn test_map_rename_halves() {
        let from = map_notify_event(
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                &["/data/run/a.txt"],
            ),
            Path::new(ROOT),
        );
        let to = map_notify_event(
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::To)),
                &["/data/run/b.txt"],
            ),
            Path::new(ROOT),
        );
        assert_eq!(summary(&from), vec![("a.txt".into(), ChangeKind::Deleted)]);
        assert_eq!(summary(&to), vec![("b.txt".into(), ChangeKind::Created)]);
    }

    #[test]
    fn test_map_remove_event() {
        let mapped = map_notify_event(
            &event(EventKind::Remove(RemoveKind::File), &["/data/run/old.bin"]),
            Path::new(ROOT),
        );
        assert_eq!(summary(&mapped), vec![("old.bin".into(), ChangeKind::Deleted)]);
    }

    #[test]
    fn test_map_metadata_event_is_modified() {
        let mapped = map_notify_event(
            &event(
                EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
                &["/data/run/a.txt"],
            ),
            Path::new(ROOT),
        );
        assert_eq!(summary(&mapped), vec![("a.txt".into(), ChangeKind::Modified)]);
    }

    #[test]
    fn test_map_ignores_access_outside_root_and_part_files() {
        let root = Path::new(ROOT);
        assert!(map_notify_event(
            &event(EventKind::Access(AccessKind::Read), &["/data/run/a.txt"]),
            root
        )
        .is_empty());
        assert!(map_notify_event(
            &event(EventKind::Create(CreateKind::File), &["/elsewhere/a.txt"]),
            root
        )
        .is_empty());
        assert!(map_notify_event(
            &event(
                EventKind::Create(CreateKind::File),
                &["/data/run/a.bin.dirsync-part"]
            ),
            root
        )
        .is_empty());
        assert!(map_notify_event(&event(EventKind::Create(CreateKind::File), &[]), root).is_empty());
    }

    #[test]
    fn test_map_new_directory_includes_its_files() {
        let dir = tempfile::tempdir().unwrap();
        let moved = dir.path().join("run-7");
        std::fs::create_dir_all(moved.join("logs")).unwrap();
        std::fs::write(moved.join("ckpt.bin"), b"w").unwrap();
        std::fs::write(moved.join("logs/log.txt"), b"l").unwrap();
        std::fs::write(moved.join("logs/x.dirsync-part"), b"p").unwrap();

        let mapped = map_notify_event(
            &notify::Event {
                kind: EventKind::Modify(ModifyKind::Name(RenameMode::To)),
                paths: vec![moved.clone()],
                attrs: Default::default(),
            },
            dir.path(),
        );

        let mut found = summary(&mapped);
        found.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            found,
            vec![
                ("run-7".into(), ChangeKind::Created),
                ("run-7/ckpt.bin".into(), ChangeKind::Created),
                ("run-7/logs/log.txt".into(), ChangeKind::Created),
            ]
        );
    }

    #[tokio::test]
    async fn test_subscribe_reports_file_writes() {
        let dir = tempfile::tempdir().unwrap();
        let subscription = NotifyWatcher::new().subscribe(dir.path()).unwrap();
        let (mut rx, guard) = subscription.into_parts();
        assert!(guard.is_active());

        std::fs::write(dir.path().join("log.txt"), b"a").unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(WatchMessage::Event(event)) if event.path.as_str() == "log.txt" => {
                        return event
                    }
                    Some(_) => continue,
                    None => panic!("watch channel closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(message.path.as_str(), "log.txt");
        drop(guard);
    }

    #[test]
    fn test_subscribe_missing_root_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(NotifyWatcher::new()
            .subscribe(&dir.path().join("missing"))
            .is_err());
    }
}
