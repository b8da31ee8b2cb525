//! Integration tests for LocalDirStore
//!
//! Each test works in its own temporary directory pair: one directory acts
//! as the remote root, the other as the local side.

use std::sync::Arc;

use dirsync_core::domain::{RelativePath, RemoteKey, RemotePrefix};
use dirsync_core::ports::IRemoteStore;
use dirsync_store::{open, LocalDirStore};

// ============================================================================
// Test helpers
// ============================================================================

struct Dirs {
    remote: tempfile::TempDir,
    local: tempfile::TempDir,
    prefix: RemotePrefix,
}

fn setup() -> Dirs {
    let remote = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let prefix = RemotePrefix::parse(remote.path().to_str().unwrap()).unwrap();
    Dirs {
        remote,
        local,
        prefix,
    }
}

fn key(dirs: &Dirs, path: &str) -> RemoteKey {
    dirs.prefix.key_for(&RelativePath::new(path).unwrap())
}

fn store(dirs: &Dirs) -> Arc<dyn IRemoteStore> {
    open(&dirs.prefix).unwrap()
}

// ============================================================================
// Listing
// ============================================================================

#[tokio::test]
async fn test_get_lists_nested_files() {
    let dirs = setup();
    std::fs::create_dir_all(dirs.remote.path().join("logs/run")).unwrap();
    std::fs::write(dirs.remote.path().join("ckpt-1.bin"), b"0123456789").unwrap();
    std::fs::write(dirs.remote.path().join("logs/run/log.txt"), b"hello").unwrap();
    std::fs::write(dirs.remote.path().join("half.bin.dirsync-part"), b"x").unwrap();

    let objects = store(&dirs).get(&dirs.prefix).await.unwrap();

    let paths: Vec<&str> = objects.iter().map(|o| o.path.as_str()).collect();
    assert_eq!(paths, vec!["ckpt-1.bin", "logs/run/log.txt"]);
    assert_eq!(objects[0].size, 10);
    assert!(objects[0].etag.is_some());
}

#[tokio::test]
async fn test_get_missing_root_is_empty() {
    let dirs = setup();
    let missing = dirs.remote.path().join("not-yet");
    let store = LocalDirStore::with_root(&missing);
    let prefix = RemotePrefix::parse(missing.to_str().unwrap()).unwrap();

    assert!(store.get(&prefix).await.unwrap().is_empty());
}

// ============================================================================
// Transfers
// ============================================================================

#[tokio::test]
async fn test_upload_then_download() {
    let dirs = setup();
    let source = dirs.local.path().join("log.txt");
    std::fs::write(&source, b"ab").unwrap();
    let store = store(&dirs);

    store.upload(&source, &key(&dirs, "logs/log.txt")).await.unwrap();
    assert_eq!(
        std::fs::read(dirs.remote.path().join("logs/log.txt")).unwrap(),
        b"ab"
    );
    assert!(!dirs
        .remote
        .path()
        .join("logs/log.txt.dirsync-part")
        .exists());

    let copy = dirs.local.path().join("copy.txt");
    store.download(&key(&dirs, "logs/log.txt"), &copy).await.unwrap();
    assert_eq!(std::fs::read(&copy).unwrap(), b"ab");
}

#[tokio::test]
async fn test_upload_overwrites() {
    let dirs = setup();
    let source = dirs.local.path().join("a.bin");
    let store = store(&dirs);

    std::fs::write(&source, b"v1").unwrap();
    store.upload(&source, &key(&dirs, "a.bin")).await.unwrap();
    std::fs::write(&source, b"v2-longer").unwrap();
    store.upload(&source, &key(&dirs, "a.bin")).await.unwrap();

    assert_eq!(
        std::fs::read(dirs.remote.path().join("a.bin")).unwrap(),
        b"v2-longer"
    );
}

#[tokio::test]
async fn test_upload_missing_source_fails() {
    let dirs = setup();
    let result = store(&dirs)
        .upload(&dirs.local.path().join("nope"), &key(&dirs, "nope"))
        .await;
    assert!(result.is_err());
    assert!(!dirs.remote.path().join("nope.dirsync-part").exists());
}

#[tokio::test]
async fn test_download_missing_object_fails() {
    let dirs = setup();
    let result = store(&dirs)
        .download(&key(&dirs, "ghost.bin"), &dirs.local.path().join("ghost.bin"))
        .await;
    assert!(result.is_err());
}

// ============================================================================
// Deletion
// ============================================================================

#[tokio::test]
async fn test_delete_removes_object_and_empty_parents() {
    let dirs = setup();
    std::fs::create_dir_all(dirs.remote.path().join("a/b")).unwrap();
    std::fs::write(dirs.remote.path().join("a/b/old.bin"), b"x").unwrap();
    std::fs::write(dirs.remote.path().join("keep.bin"), b"y").unwrap();

    store(&dirs).delete(&key(&dirs, "a/b/old.bin")).await.unwrap();

    assert!(!dirs.remote.path().join("a").exists());
    assert!(dirs.remote.path().join("keep.bin").exists());
    assert!(dirs.remote.path().exists());
}

#[tokio::test]
async fn test_delete_missing_is_ok() {
    let dirs = setup();
    store(&dirs).delete(&key(&dirs, "never.bin")).await.unwrap();
}
