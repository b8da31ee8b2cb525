//! LocalDirStore - IRemoteStore over a directory
//!
//! Serves `file://` prefixes: NFS/SMB mounts, FUSE-mounted buckets, or a
//! plain directory in tests. Uploads are written to a temporary sibling and
//! renamed into place so readers never observe a partial object.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use dirsync_core::domain::{RelativePath, RemoteKey, RemotePrefix};
use dirsync_core::ports::{IRemoteStore, RemoteObject, PART_SUFFIX};


/// Remote store backed by a local directory
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    /// Creates a store rooted at a `file://` prefix
    ///
    /// # Errors
    /// Returns an error if the prefix is not a `file://` URI
    pub fn new(prefix: &RemotePrefix) -> Result<Self> {
        let root = prefix
            .to_file_path()
            .with_context(|| format!("not a local directory URI: {prefix}"))?;
        Ok(Self { root })
    }

    /// Creates a store rooted at `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &RemoteKey) -> PathBuf {
        key.path().to_local(&self.root)
    }

    fn walk_directory<'a>(
        &'a self,
        dir: &'a Path,
        objects: &'a mut Vec<RemoteObject>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut entries = tokio::fs::read_dir(dir)
                .await
                .with_context(|| format!("Failed to read directory: {}", dir.display()))?;

            while let Some(entry) = entries.next_entry().await? {
                let entry_path = entry.path();
                let metadata = entry.metadata().await?;

                if metadata.is_dir() {
                    self.walk_directory(&entry_path, objects).await?;
                    continue;
                }
                if !metadata.is_file() {
                    continue;
                }
                if entry.file_name().to_string_lossy().ends_with(PART_SUFFIX) {
                    continue;
                }

                let path = match RelativePath::from_local(&self.root, &entry_path) {
                    Ok(path) => path,
                    Err(err) => {
                        warn!(path = %entry_path.display(), %err, "Skipping unlistable object");
                        continue;
                    }
                };
                let mtime_ns = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_nanos());

                objects.push(RemoteObject {
                    path,
                    size: metadata.len(),
                    etag: Some(format!("{:x}-{:x}", metadata.len(), mtime_ns)),
                });
            }

            Ok(())
        })
    }
}

#[async_trait]
impl IRemoteStore for LocalDirStore {
    #[tracing::instrument(skip(self), fields(root = %self.root.display()))]
    async fn get(&self, _prefix: &RemotePrefix) -> Result<Vec<RemoteObject>> {
        let mut objects = Vec::new();
        match tokio::fs::metadata(&self.root).await {
            Ok(metadata) if metadata.is_dir() => {
                self.walk_directory(&self.root, &mut objects).await?;
            }
            Ok(_) => anyhow::bail!("remote root is not a directory: {}", self.root.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("Remote root does not exist yet, listing is empty");
            }
            Err(err) => return Err(err.into()),
        }
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    #[tracing::instrument(skip(self, key), fields(key = %key))]
    async fn download(&self, key: &RemoteKey, local_path: &Path) -> Result<()> {
        let source = self.object_path(key);
        tokio::fs::copy(&source, local_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to copy {} to {}",
                    source.display(),
                    local_path.display()
                )
            })?;
        Ok(())
    }

    #[tracing::instrument(skip(self, key), fields(key = %key))]
    async fn upload(&self, local_path: &Path, key: &RemoteKey) -> Result<()> {
        let target = self.object_path(key);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut staging = target.clone().into_os_string();
        staging.push(PART_SUFFIX);
        let staging = PathBuf::from(staging);

        if let Err(err) = tokio::fs::copy(local_path, &staging).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(anyhow::Error::new(err)
                .context(format!("Failed to copy {} to the store", local_path.display())));
        }
        tokio::fs::rename(&staging, &target).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, key), fields(key = %key))]
    async fn delete(&self, key: &RemoteKey) -> Result<()> {
        let target = self.object_path(key);
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("Object already absent");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        // Prune directories left empty, stopping at the first non-empty one
        let mut dir = target.parent();
        while let Some(current) = dir {
            if current == self.root || tokio::fs::remove_dir(current).await.is_err() {
                break;
            }
            dir = current.parent();
        }
        Ok(())
    }
}
