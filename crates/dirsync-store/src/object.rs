//! ObjectStoreRemote - IRemoteStore over the `object_store` crate
//!
//! Serves `s3://`, `gs://`, `az://`/`abfs://`, `http(s)://` and `memory://`
//! prefixes. Credentials and endpoints come from the usual environment
//! variables (`AWS_*`, `GOOGLE_*`, `AZURE_*`), passed to the builders in
//! lowercase as `object_store` expects.
//!
//! Small files are sent with a single `put`; larger ones are streamed with a
//! multipart upload so memory use stays bounded.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use dirsync_core::domain::{RelativePath, RemoteKey, RemotePrefix};
use dirsync_core::ports::{is_part_file, IRemoteStore, RemoteObject, TransientError};


/// Files up to this size are uploaded with a single request
const SINGLE_PUT_LIMIT: u64 = 16 * 1024 * 1024;

/// Read size while streaming a multipart upload
const MULTIPART_CHUNK: usize = 8 * 1024 * 1024;

/// Environment variable prefixes forwarded to the backend builders
const ENV_PREFIXES: &[&str] = &["aws_", "google_", "azure_", "object_store_"];

/// Remote store backed by an `object_store` backend
#[derive(Debug, Clone)]
pub struct ObjectStoreRemote {
    store: Arc<dyn ObjectStore>,
    /// Object path of the prefix inside the bucket/container
    base: ObjectPath,
}

impl ObjectStoreRemote {
    /// Builds the backend for `prefix` from its URI and the environment
    ///
    /// # Errors
    /// Returns an error if the scheme is unknown to `object_store` or the
    /// backend configuration is incomplete
    pub fn new(prefix: &RemotePrefix) -> Result<Self> {
        let options = std::env::vars()
            .map(|(key, value)| (key.to_ascii_lowercase(), value))
            .filter(|(key, _)| ENV_PREFIXES.iter().any(|p| key.starts_with(p)));

        let (store, base) = object_store::parse_url_opts(prefix.url(), options)
            .with_context(|| format!("Failed to configure object store for {prefix}"))?;
        debug!(%prefix, base = %base, "Object store configured");

        Ok(Self {
            store: Arc::from(store),
            base,
        })
    }

    /// Wraps an existing backend, rooted at `base`
    pub fn with_store(store: Arc<dyn ObjectStore>, base: ObjectPath) -> Self {
        Self { store, base }
    }

    fn location(&self, path: &RelativePath) -> ObjectPath {
        path.segments()
            .fold(self.base.clone(), |location, segment| location.child(segment))
    }

    fn relative(&self, location: &ObjectPath) -> Option<RelativePath> {
        let parts: Vec<String> = location
            .prefix_match(&self.base)?
            .map(|part| part.as_ref().to_string())
            .collect();
        RelativePath::new(parts.join("/")).ok()
    }
}

/// Marks backend errors that are worth retrying
fn classify(err: object_store::Error) -> anyhow::Error {
    match err {
        object_store::Error::Generic { .. } | object_store::Error::JoinError { .. } => {
            anyhow::Error::new(TransientError::new(err.to_string()))
        }
        other => anyhow::Error::new(other),
    }
}

#[async_trait]
impl IRemoteStore for ObjectStoreRemote {
    #[tracing::instrument(skip(self, prefix), fields(prefix = %prefix))]
    async fn get(&self, prefix: &RemotePrefix) -> Result<Vec<RemoteObject>> {
        let listed: Vec<object_store::ObjectMeta> = self
            .store
            .list(Some(&self.base))
            .try_collect()
            .await
            .map_err(classify)?;

        let mut objects = Vec::with_capacity(listed.len());
        for meta in listed {
            let Some(path) = self.relative(&meta.location) else {
                warn!(location = %meta.location, "Skipping object outside the prefix");
                continue;
            };
            if is_part_file(path.file_name()) {
                continue;
            }
            objects.push(RemoteObject {
                path,
                size: meta.size as u64,
                etag: meta.e_tag,
            });
        }
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    #[tracing::instrument(skip(self, key), fields(key = %key))]
    async fn download(&self, key: &RemoteKey, local_path: &Path) -> Result<()> {
        let location = self.location(key.path());
        let mut stream = self
            .store
            .get(&location)
            .await
            .map_err(classify)?
            .into_stream();

        let mut file = tokio::fs::File::create(local_path)
            .await
            .with_context(|| format!("Failed to create {}", local_path.display()))?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify)?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, key), fields(key = %key))]
    async fn upload(&self, local_path: &Path, key: &RemoteKey) -> Result<()> {
        let location = self.location(key.path());
        let size = tokio::fs::metadata(local_path).await?.len();

        if size <= SINGLE_PUT_LIMIT {
            let data = tokio::fs::read(local_path).await?;
            self.store
                .put(&location, PutPayload::from(data))
                .await
                .map_err(classify)?;
            return Ok(());
        }

        debug!(size, "Streaming multipart upload");
        let upload = self
            .store
            .put_multipart(&location)
            .await
            .map_err(classify)?;
        let mut writer = WriteMultipart::new(upload);
        let mut file = tokio::fs::File::open(local_path).await?;
        let mut buffer = vec![0u8; MULTIPART_CHUNK];

        loop {
            let read = match file.read(&mut buffer).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) => {
                    let _ = writer.abort().await;
                    return Err(err.into());
                }
            };
            if let Err(err) = writer.wait_for_capacity(4).await {
                let _ = writer.abort().await;
                return Err(classify(err));
            }
            writer.write(&buffer[..read]);
        }

        writer.finish().await.map_err(classify)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, key), fields(key = %key))]
    async fn delete(&self, key: &RemoteKey) -> Result<()> {
        let location = self.location(key.path());
        match self.store.delete(&location).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => {
                debug!("Object already absent");
                Ok(())
            }
            Err(err) => Err(classify(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;

    use super::*;

    fn remote() -> ObjectStoreRemote {
        ObjectStoreRemote::with_store(Arc::new(InMemory::new()), ObjectPath::from("run"))
    }

    fn key(path: &str) -> RemoteKey {
        RemotePrefix::parse("memory:///run")
            .unwrap()
            .key_for(&RelativePath::new(path).unwrap())
    }

    #[tokio::test]
    async fn test_upload_list_download_delete() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("log.txt");
        std::fs::write(&source, b"ab").unwrap();
        let remote = remote();
        let prefix = RemotePrefix::parse("memory:///run").unwrap();

        remote.upload(&source, &key("logs/log.txt")).await.unwrap();

        let listed = remote.get(&prefix).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path.as_str(), "logs/log.txt");
        assert_eq!(listed[0].size, 2);

        let copy = dir.path().join("copy.txt");
        remote.download(&key("logs/log.txt"), &copy).await.unwrap();
        assert_eq!(std::fs::read(&copy).unwrap(), b"ab");

        remote.delete(&key("logs/log.txt")).await.unwrap();
        assert!(remote.get(&prefix).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        remote().delete(&key("never.bin")).await.unwrap();
    }

    #[tokio::test]
    async fn test_download_missing_is_not_transient() {
        let dir = tempfile::tempdir().unwrap();
        let err = remote()
            .download(&key("missing.bin"), &dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<TransientError>().is_none());
    }
}
