//! End-to-end scenarios against the public `DiskFileSystemProvider` API,
//! covering the concrete walkthroughs this crate is built around: create and
//! overwrite, the missing-create guard, position advance across reads, an
//! explicit seek leaving the cached position untouched, watch coalescing,
//! and case-only copy/rename on a case-insensitive host.

use disk_fs_provider::bulk_io::WriteFileOptions;
use disk_fs_provider::descriptor::OpenOptions;
use disk_fs_provider::mutations::TransferOptions;
use disk_fs_provider::{Capabilities, DiskFileSystemProvider, FileSystemProviderErrorCode, ProviderConfig, Resource};

fn provider() -> std::sync::Arc<DiskFileSystemProvider> {
    DiskFileSystemProvider::new(ProviderConfig::default())
}

#[tokio::test]
async fn create_and_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let provider = provider();
    let resource = Resource::from_path(dir.path().join("a"));

    provider.write_file(&resource, &[0x41, 0x42], WriteFileOptions { create: true, overwrite: true, unlock: false }).await.unwrap();
    assert_eq!(provider.read_file(&resource).await.unwrap(), vec![0x41, 0x42]);

    provider.write_file(&resource, &[0x43], WriteFileOptions { create: false, overwrite: true, unlock: false }).await.unwrap();
    assert_eq!(provider.read_file(&resource).await.unwrap(), vec![0x43]);
}

#[tokio::test]
async fn missing_create_guard() {
    let dir = tempfile::tempdir().unwrap();
    let provider = provider();
    let resource = Resource::from_path(dir.path().join("nonexistent").join("b"));

    let err = provider.write_file(&resource, &[0x00], WriteFileOptions { create: false, overwrite: true, unlock: false }).await.unwrap_err();
    assert_eq!(err.code(), FileSystemProviderErrorCode::FileNotFound);
}

#[tokio::test]
async fn position_advance_and_explicit_seek() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("c");
    tokio::fs::write(&path, b"hello").await.unwrap();
    let resource = Resource::from_path(&path);
    let provider = provider();

    let fd = provider.open(&resource, OpenOptions { write: false, create: false, unlock: false }).await.unwrap();

    let mut buf = [0u8; 3];
    assert_eq!(provider.read(fd, 0, &mut buf).await.unwrap(), 3);
    assert_eq!(&buf, b"hel");

    let mut buf2 = [0u8; 2];
    assert_eq!(provider.read(fd, 3, &mut buf2).await.unwrap(), 2);
    assert_eq!(&buf2, b"lo");

    // Explicit seek back to an already-consumed offset: cached position is
    // unaffected by this read (§4.3 step 3 second bullet).
    let mut buf3 = [0u8; 1];
    assert_eq!(provider.read(fd, 0, &mut buf3).await.unwrap(), 1);
    assert_eq!(&buf3, b"h");

    provider.close(fd).await.unwrap();
}

#[tokio::test]
async fn watch_coalescing_results_in_one_backend() {
    let provider = provider();

    let _a = provider.watch_recursive("/tmp/scenario-a", vec![]).await;
    let _b = provider.watch_recursive("/tmp/scenario-b", vec![]).await;
    let _c = provider.watch_recursive("/tmp/scenario-c", vec![]).await;

    // The throttled delayer coalesces the synchronous burst into a single
    // refresh; give it a moment to run.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}

#[tokio::test]
async fn case_only_copy_fails_but_rename_succeeds_on_case_insensitive_host() {
    let provider = provider();
    if provider.capabilities().contains(Capabilities::PATH_CASE_SENSITIVE) {
        // Host filesystem is case-sensitive (e.g. Linux): the scenario this
        // test documents doesn't apply here.
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let upper = dir.path().join("X");
    tokio::fs::write(&upper, b"data").await.unwrap();
    let lower = dir.path().join("x");

    let err = provider.copy(&Resource::from_path(&upper), &Resource::from_path(&lower), TransferOptions { overwrite: true }).await.unwrap_err();
    assert_eq!(err.code(), FileSystemProviderErrorCode::FileExists);

    provider.rename(&Resource::from_path(&upper), &Resource::from_path(&lower), TransferOptions { overwrite: true }).await.unwrap();
}

#[tokio::test]
async fn dispose_tears_down_active_watcher_without_panicking() {
    let provider = provider();
    let _sub = provider.watch_recursive("/tmp/dispose-scenario", vec![]).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    provider.dispose().await;
}
