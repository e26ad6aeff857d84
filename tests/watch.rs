//! Integration tests for the watch multiplexer (§4.5) against the public API.

use disk_fs_provider::{DiskFileSystemProvider, ProviderConfig};

fn provider() -> std::sync::Arc<DiskFileSystemProvider> {
    DiskFileSystemProvider::new(ProviderConfig::default())
}

#[tokio::test]
async fn watch_recursive_survives_disposal_of_one_of_several_requests() {
    let provider = provider();

    let a = provider.watch_recursive("/tmp/watch-a", vec![]).await;
    let _b = provider.watch_recursive("/tmp/watch-b", vec![]).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // Dropping one request's subscription must not tear down the shared
    // backend out from under the remaining request.
    drop(a);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    provider.dispose().await;
}

#[tokio::test]
async fn watch_non_recursive_detects_a_file_change() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("watched.txt");
    tokio::fs::write(&file, b"initial").await.unwrap();
    let provider = provider();

    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorder = std::sync::Arc::clone(&seen);
    provider.on_did_change_file(move |change| recorder.lock().unwrap().push(change.path.clone()));

    let _sub = provider.watch_non_recursive(dir.path());
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    tokio::fs::write(&file, b"updated").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    assert!(!seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn dispose_is_idempotent_with_no_active_watches() {
    let provider = provider();
    provider.dispose().await;
    provider.dispose().await;
}
