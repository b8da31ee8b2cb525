//! dirsync Store - Remote store adapters
//!
//! Implementations of the [`IRemoteStore`] port:
//!
//! - [`local::LocalDirStore`] - a directory on a mounted filesystem
//!   (`file://` URIs and plain paths)
//! - `object::ObjectStoreRemote` - S3, GCS, Azure Blob and HTTP stores via
//!   the `object_store` crate (`object-store` feature)
//!
//! [`open`] picks the adapter from the prefix's URI scheme.

pub mod local;
#[cfg(feature = "object-store")]
pub mod object;

use std::sync::Arc;

use anyhow::Result;
use dirsync_core::domain::RemotePrefix;
use dirsync_core::ports::IRemoteStore;

pub use local::LocalDirStore;
#[cfg(feature = "object-store")]
pub use object::ObjectStoreRemote;

/// Opens the adapter serving `prefix`
///
/// # Errors
/// Returns an error if the scheme is unsupported by this build or the
/// backend cannot be configured.
pub fn open(prefix: &RemotePrefix) -> Result<Arc<dyn IRemoteStore>> {
    match prefix.scheme() {
        "file" => Ok(Arc::new(LocalDirStore::new(prefix)?)),
        #[cfg(feature = "object-store")]
        _ => Ok(Arc::new(ObjectStoreRemote::new(prefix)?)),
        #[cfg(not(feature = "object-store"))]
        other => anyhow::bail!(
            "remote scheme `{other}` needs dirsync built with the `object-store` feature"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_file_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = RemotePrefix::parse(dir.path().to_str().unwrap()).unwrap();
        assert!(open(&prefix).is_ok());
    }

    #[cfg(not(feature = "object-store"))]
    #[test]
    fn test_open_unsupported_scheme() {
        let prefix = RemotePrefix::parse("s3://bucket/run").unwrap();
        let err = open(&prefix).err().unwrap();
        assert!(err.to_string().contains("object-store"));
    }
}
