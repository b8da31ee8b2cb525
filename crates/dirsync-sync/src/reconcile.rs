//! Reconciler - full local rescans against the synced snapshot
//!
//! OS watchers drop events (queue overflow, directories moved in wholesale).
//! The reconciler walks the local root, compares every regular file against
//! the [`SyncedSnapshot`] and turns differences into change events, which
//! go through the coalescer like any watcher event.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dirsync_core::domain::{FileChangeEvent, RelativePath};
use dirsync_core::ports::is_part_file;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::snapshot::{FileStamp, SyncedSnapshot};

pub struct Reconciler {
    local_root: PathBuf,
    snapshot: Arc<SyncedSnapshot>,
}

impl Reconciler {
    pub fn new(local_root: PathBuf, snapshot: Arc<SyncedSnapshot>) -> Self {
        Self {
            local_root,
            snapshot,
        }
    }

    /// Walks the local root and reports what differs from the snapshot
    ///
    /// New or changed files are reported as `Modified`, snapshot entries
    /// with no local file as `Deleted`.
    #[tracing::instrument(skip(self), fields(local_root = %self.local_root.display()))]
    pub async fn scan(&self) -> Result<Vec<FileChangeEvent>> {
        let mut found = HashMap::new();
        self.walk_directory(&self.local_root, &mut found).await?;

        let mut events: Vec<FileChangeEvent> = found
            .iter()
            .filter(|(path, stamp)| self.snapshot.is_changed(path, stamp))
            .map(|(path, _)| FileChangeEvent::modified(path.clone()))
            .collect();

        events.extend(
            self.snapshot
                .paths()
                .into_iter()
                .filter(|path| !found.contains_key(path))
                .map(FileChangeEvent::deleted),
        );

        debug!(files = found.len(), changes = events.len(), "Rescan complete");
        Ok(events)
    }

    fn walk_directory<'a>(
        &'a self,
        dir: &'a Path,
        found: &'a mut HashMap<RelativePath, FileStamp>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut entries = tokio::fs::read_dir(dir)
                .await
                .with_context(|| format!("Failed to read directory: {}", dir.display()))?;

            while let Some(entry) = entries.next_entry().await? {
                let entry_path = entry.path();
                let metadata = match entry.metadata().await {
                    Ok(metadata) => metadata,
                    // Removed between listing and stat
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(err.into()),
                };

                if metadata.is_dir() {
                    self.walk_directory(&entry_path, found).await?;
                } else if metadata.is_file() {
                    if entry
                        .file_name()
                        .to_str()
                        .map_or(false, is_part_file)
                    {
                        continue;
                    }
                    match RelativePath::from_local(&self.local_root, &entry_path) {
                        Ok(path) => {
                            found.insert(path, FileStamp::from_metadata(&metadata));
                        }
                        Err(err) => {
                            warn!(path = %entry_path.display(), %err, "Skipping unsyncable path");
                        }
                    }
                }
            }

            Ok(())
        })
    }

    /// Rescans every `period` until cancelled, injecting changes into `tx`
    ///
    /// The first scan happens one full period after start. Returns early if
    /// the receiving side is gone.
    pub async fn run_periodic(
        self: Arc<Self>,
        period: Duration,
        tx: mpsc::Sender<FileChangeEvent>,
        cancel: CancellationToken,
    ) {
        info!(period_secs = period.as_secs(), "Periodic rescan enabled");
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let events = match self.scan().await {
                Ok(events) => events,
                Err(err) => {
                    warn!(error = %err, "Periodic rescan failed");
                    continue;
                }
            };

            if !events.is_empty() {
                info!(changes = events.len(), "Rescan found unsynced changes");
            }
            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }

        debug!("Periodic rescan stopped");
    }
}
