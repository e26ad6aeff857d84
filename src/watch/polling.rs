//! Polling backend (§4.5): re-walks the watched folders on an interval and
//! diffs mtimes/existence against the previous snapshot. Used when polling
//! is forced via config, or as the degrade path for filesystems where an
//! efficient native watcher can't be established (e.g., network mounts).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use std::sync::atomic::{AtomicBool, Ordering};

use super::backend::WatchBackend;
use super::WatchRequest;
use crate::capabilities::{FileChange, FileChangeKind};

type Snapshot = HashMap<PathBuf, u64>;

pub struct PollingBackend {
    command_tx: mpsc::Sender<Command>,
    verbose: Arc<AtomicBool>,
}

enum Command {
    Reconfigure(Vec<WatchRequest>),
    Stop,
}

impl PollingBackend {
    pub fn new(folders: Vec<WatchRequest>, on_change: Arc<dyn Fn(FileChange) + Send + Sync>, verbose: bool, interval_ms: u64) -> Self {
        let (command_tx, command_rx) = mpsc::channel(8);
        let verbose = Arc::new(AtomicBool::new(verbose));

        tokio::spawn(run_poll_loop(folders, on_change, command_rx, Duration::from_millis(interval_ms), Arc::clone(&verbose)));

        Self { command_tx, verbose }
    }
}

#[async_trait]
impl WatchBackend for PollingBackend {
    async fn watch(&mut self, folders: Vec<WatchRequest>) {
        let _ = self.command_tx.send(Command::Reconfigure(folders)).await;
    }

    async fn set_verbose_logging(&mut self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    async fn dispose(&mut self) {
        let _ = self.command_tx.send(Command::Stop).await;
    }
}

async fn run_poll_loop(
    mut folders: Vec<WatchRequest>,
    on_change: Arc<dyn Fn(FileChange) + Send + Sync>,
    mut commands: mpsc::Receiver<Command>,
    interval: Duration,
    verbose: Arc<AtomicBool>,
) {
    let mut snapshot = take_snapshot(&folders).await;

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::Reconfigure(new_folders)) => {
                        folders = new_folders;
                        snapshot = take_snapshot(&folders).await;
                    }
                    Some(Command::Stop) | None => {
                        debug!("polling backend stopped");
                        return;
                    }
                }
            }
            _ = tokio::time::sleep(interval) => {
                let fresh = take_snapshot(&folders).await;
                diff_and_emit(&snapshot, &fresh, &on_change, verbose.load(Ordering::Relaxed));
                snapshot = fresh;
            }
        }
    }
}

async fn take_snapshot(folders: &[WatchRequest]) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for folder in folders {
        walk_into(std::path::Path::new(&folder.path), &folder.excludes, &mut snapshot).await;
    }
    snapshot
}

fn walk_into<'a>(
    dir: &'a std::path::Path,
    excludes: &'a [String],
    snapshot: &'a mut Snapshot,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else { return };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if is_excluded(&path, excludes) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else { continue };
            let mtime = meta.modified().ok().and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok()).map(|d| d.as_millis() as u64).unwrap_or(0);
            snapshot.insert(path.clone(), mtime);
            if meta.is_dir() {
                walk_into(&path, excludes, snapshot).await;
            }
        }
    })
}

fn is_excluded(path: &std::path::Path, excludes: &[String]) -> bool {
    let path_str = path.to_string_lossy();
    excludes.iter().any(|pattern| path_str.contains(pattern.trim_matches('*')))
}

fn diff_and_emit(before: &Snapshot, after: &Snapshot, on_change: &Arc<dyn Fn(FileChange) + Send + Sync>, verbose: bool) {
    let mut emit = |path: &PathBuf, kind: FileChangeKind| {
        if verbose {
            debug!(path = %path.display(), ?kind, "polling backend: file change event");
        }
        on_change(FileChange { path: path.clone(), kind });
    };

    for (path, mtime) in after {
        match before.get(path) {
            None => emit(path, FileChangeKind::Created),
            Some(prev) if prev != mtime => emit(path, FileChangeKind::Changed),
            _ => {}
        }
    }
    for path in before.keys() {
        if !after.contains_key(path) {
            emit(path, FileChangeKind::Deleted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detects_created_and_modified_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let file_a = dir.path().join("a.txt");
        tokio::fs::write(&file_a, b"x").await.unwrap();

        let folders = vec![WatchRequest { path: dir.path().to_string_lossy().into_owned(), excludes: vec![] }];
        let before = take_snapshot(&folders).await;

        tokio::fs::write(&file_a, b"xx").await.unwrap();
        let file_b = dir.path().join("b.txt");
        tokio::fs::write(&file_b, b"y").await.unwrap();
        tokio::fs::remove_file(&file_a).await.unwrap();

        let after = take_snapshot(&folders).await;

        let events = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let events_clone = events.clone();
        diff_and_emit(&before, &after, &Arc::new(move |change: FileChange| events_clone.lock().unwrap().push(change.kind)), false);

        let kinds = events.lock().unwrap();
        assert!(kinds.contains(&FileChangeKind::Created));
        assert!(kinds.contains(&FileChangeKind::Deleted));
    }
}
