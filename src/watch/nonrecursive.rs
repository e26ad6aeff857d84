//! Non-recursive single-path watcher (§4.5).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::capabilities::{Emitter, FileChange, FileChangeKind, Subscription};

/// Instantiate a per-path simple watcher, wiring its change callback to
/// `on_change` and routing errors to `on_error` (the provider's error
/// emitter per §4.5: "its log callback to both the log service and, if
/// `type == 'error'`, the error emitter"). Subscribes to `on_log_level` to
/// toggle verbose logging dynamically (§4.5), and returns a disposable that
/// tears down both the native watcher and that log-level subscription.
pub fn watch_non_recursive(
    path: impl AsRef<Path>,
    on_change: Arc<Emitter<FileChange>>,
    on_error: Arc<Emitter<String>>,
    on_log_level: Arc<Emitter<bool>>,
) -> Subscription {
    let path = path.as_ref().to_path_buf();
    let change_sink = Arc::clone(&on_change);
    let error_sink = Arc::clone(&on_error);
    let path_for_handler = path.clone();
    let verbose_logging = Arc::new(AtomicBool::new(false));

    let handler_verbose = Arc::clone(&verbose_logging);
    let handler = move |event: notify::Result<notify::Event>| match event {
        Ok(event) => {
            for changed_path in event.paths {
                let kind = match event.kind {
                    notify::EventKind::Create(_) => FileChangeKind::Created,
                    notify::EventKind::Remove(_) => FileChangeKind::Deleted,
                    _ => FileChangeKind::Changed,
                };
                if handler_verbose.load(Ordering::Relaxed) {
                    debug!(path = %changed_path.display(), ?kind, "non-recursive watch event");
                }
                change_sink.fire(&FileChange { path: changed_path, kind });
            }
        }
        Err(err) => {
            let message = format!("watch error on {}: {err}", path_for_handler.display());
            warn!("{message}");
            error_sink.fire(&message);
        }
    };

    let watcher = RecommendedWatcher::new(handler, notify::Config::default());
    let watcher = match watcher {
        Ok(mut w) => {
            if let Err(err) = w.watch(&path, RecursiveMode::NonRecursive) {
                warn!(path = %path.display(), error = %err, "failed to start non-recursive watch");
            }
            Some(w)
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to construct non-recursive watcher");
            None
        }
    };

    let log_level_sub = on_log_level.subscribe_disposable(move |verbose| {
        verbose_logging.store(*verbose, Ordering::Relaxed);
    });

    let watcher_teardown = Subscription::new(move || {
        drop(watcher);
    });

    Subscription::combine(vec![watcher_teardown, log_level_sub])
}
