//! Initial sync - one-shot remote → local copy
//!
//! Lists the remote prefix and downloads every object under the local root
//! with bounded concurrency. This is an ordering barrier: the watch phase
//! starts only after every object is present locally, because watching a
//! half-populated directory could push stale state back to the remote.
//!
//! Each object is downloaded to `<path>.dirsync-part` and renamed into place,
//! so an interrupted copy never leaves a truncated file under the real name.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dirsync_core::domain::{RelativePath, RemotePrefix};
use dirsync_core::ports::{is_part_file, IRemoteStore, RemoteObject, PART_SUFFIX};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::retry::{with_retry, RetryPolicy};
use crate::snapshot::{FileStamp, SyncedSnapshot};
use crate::SyncError;

/// Summary of a completed initial sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitialSyncReport {
    /// Objects returned by the listing
    pub objects_listed: usize,
    /// Objects written to the local root
    pub files_downloaded: usize,
    /// Sum of the listed sizes of downloaded objects
    pub bytes_downloaded: u64,
}

/// Copies a remote prefix into a local directory
pub struct InitialSync {
    store: Arc<dyn IRemoteStore>,
    local_root: PathBuf,
    prefix: RemotePrefix,
    snapshot: Arc<SyncedSnapshot>,
    concurrency: usize,
    retry: RetryPolicy,
}

impl InitialSync {
    pub fn new(
        store: Arc<dyn IRemoteStore>,
        local_root: PathBuf,
        prefix: RemotePrefix,
        snapshot: Arc<SyncedSnapshot>,
    ) -> Self {
        Self {
            store,
            local_root,
            prefix,
            snapshot,
            concurrency: 4,
            retry: RetryPolicy::new(
                3,
                std::time::Duration::from_secs(1),
                std::time::Duration::from_secs(30),
            ),
        }
    }

    /// Maximum simultaneous downloads
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Per-object retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Runs the copy to completion
    ///
    /// # Errors
    /// Returns [`SyncError::InitialSync`] if the local root cannot be
    /// created, the listing fails, or any object still fails after its
    /// retries. The first such object aborts the remaining downloads.
    #[tracing::instrument(skip(self), fields(prefix = %self.prefix, local_root = %self.local_root.display()))]
    pub async fn run(&self) -> Result<InitialSyncReport, SyncError> {
        tokio::fs::create_dir_all(&self.local_root)
            .await
            .map_err(|e| SyncError::InitialSync {
                target: self.local_root.display().to_string(),
                reason: format!("cannot create local root: {e}"),
            })?;

        let objects = with_retry("list_remote", &self.retry, || {
            let store = self.store.clone();
            let prefix = self.prefix.clone();
            async move { store.get(&prefix).await }
        })
        .await
        .map_err(|e| SyncError::InitialSync {
            target: self.prefix.to_string(),
            reason: format!("{e:#}"),
        })?;

        let mut report = InitialSyncReport {
            objects_listed: objects.len(),
            ..Default::default()
        };
        info!(objects = objects.len(), "Remote listing complete");

        // Directory placeholder objects share their path with other objects' parents
        let directories: HashSet<RelativePath> = objects
            .iter()
            .flat_map(|object| std::iter::successors(object.path.parent(), RelativePath::parent))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut downloads = JoinSet::new();

        for object in objects {
            if is_part_file(object.path.file_name()) {
                warn!(path = %object.path, "Skipping leftover partial download object");
                continue;
            }
            if directories.contains(&object.path) {
                debug!(path = %object.path, "Skipping directory placeholder object");
                continue;
            }

            let semaphore = semaphore.clone();
            let store = self.store.clone();
            let local_root = self.local_root.clone();
            let prefix = self.prefix.clone();
            let retry = self.retry;

            downloads.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = download_object(store, &local_root, &prefix, &object, &retry).await;
                (object, outcome)
            });
        }

        while let Some(joined) = downloads.join_next().await {
            let (object, outcome) = match joined {
                Ok(done) => done,
                Err(join_err) => {
                    downloads.abort_all();
                    return Err(SyncError::InitialSync {
                        target: self.prefix.to_string(),
                        reason: format!("download task failed: {join_err}"),
                    });
                }
            };

            match outcome {
                Ok(stamp) => {
                    debug!(path = %object.path, size = object.size, "Downloaded");
                    self.snapshot.record(object.path.clone(), stamp);
                    report.files_downloaded += 1;
                    report.bytes_downloaded += object.size;
                }
                Err(err) => {
                    downloads.abort_all();
                    let key = self.prefix.key_for(&object.path);
                    return Err(SyncError::InitialSync {
                        target: key.to_string(),
                        reason: format!("{err:#}"),
                    });
                }
            }
        }

        info!(
            files = report.files_downloaded,
            bytes = report.bytes_downloaded,
            "Initial sync complete"
        );
        Ok(report)
    }
}

async fn download_object(
    store: Arc<dyn IRemoteStore>,
    local_root: &Path,
    prefix: &RemotePrefix,
    object: &RemoteObject,
    retry: &RetryPolicy,
) -> anyhow::Result<FileStamp> {
    let key = prefix.key_for(&object.path);
    let target = object.path.to_local(local_root);
    let part = part_path(&object.path, local_root);

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let fetched = with_retry("download", retry, || {
        let store = store.clone();
        let key = key.clone();
        let part = part.clone();
        async move { store.download(&key, &part).await }
    })
    .await;

    if let Err(err) = fetched {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(err);
    }

    tokio::fs::rename(&part, &target).await?;
    let metadata = tokio::fs::metadata(&target).await?;
    Ok(FileStamp::from_metadata(&metadata))
}

fn part_path(path: &RelativePath, local_root: &Path) -> PathBuf {
    let mut name = path.to_local(local_root).into_os_string();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}
