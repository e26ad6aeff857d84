//! Capability bitset, typed event emitters, and the disposable/subscription
//! teardown primitive shared by the watch subsystem (§3, §6, §9).

use bitflags::bitflags;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

bitflags! {
    /// Static per-instance capability bitset, computed lazily on first read (§3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u16 {
        const FILE_READ_WRITE = 0b0000_0001;
        const FILE_OPEN_READ_WRITE_CLOSE = 0b0000_0010;
        const FILE_READ_STREAM = 0b0000_0100;
        const FILE_FOLDER_COPY = 0b0000_1000;
        const FILE_WRITE_UNLOCK = 0b0001_0000;
        /// Only set on platforms whose local filesystem is case-sensitive
        /// (Linux).
        const PATH_CASE_SENSITIVE = 0b0010_0000;
    }
}

/// Compute the capability bitset for this host (§3, §8 invariant 7).
pub fn capabilities() -> Capabilities {
    let mut caps = Capabilities::FILE_READ_WRITE
        | Capabilities::FILE_OPEN_READ_WRITE_CLOSE
        | Capabilities::FILE_READ_STREAM
        | Capabilities::FILE_FOLDER_COPY
        | Capabilities::FILE_WRITE_UNLOCK;
    if is_case_sensitive_platform() {
        caps |= Capabilities::PATH_CASE_SENSITIVE;
    }
    caps
}

pub fn is_case_sensitive_platform() -> bool {
    cfg!(target_os = "linux")
}

/// One changed file/directory and the kind of change (§6 `onDidChangeFile`).
#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: std::path::PathBuf,
    pub kind: FileChangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Created,
    Changed,
    Deleted,
}

/// A typed observer primitive: a broadcast channel over boxed listener
/// callbacks (§9). Most listeners live for the provider's whole lifetime
/// ([`subscribe`](Emitter::subscribe)); a few — like a watcher's log-level
/// feed — need to unsubscribe when their own owner tears down, which
/// [`subscribe_disposable`](Emitter::subscribe_disposable) supports via a
/// token-keyed [`Subscription`].
pub struct Emitter<T> {
    listeners: Mutex<HashMap<u64, Box<dyn Fn(&T) + Send + Sync>>>,
    next_token: AtomicU64,
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self { listeners: Mutex::new(HashMap::new()), next_token: AtomicU64::new(0) }
    }
}

impl<T> Emitter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe for the lifetime of the emitter; there is no way to remove
    /// this listener short of dropping the emitter itself.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().expect("emitter mutex poisoned").insert(token, Box::new(listener));
    }

    /// Subscribe and return a [`Subscription`] that removes `listener` again
    /// on dispose or drop.
    pub fn subscribe_disposable(self: &Arc<Self>, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().expect("emitter mutex poisoned").insert(token, Box::new(listener));

        let this = Arc::clone(self);
        Subscription::new(move || {
            this.listeners.lock().expect("emitter mutex poisoned").remove(&token);
        })
    }

    /// Fire listeners; the provider does not reorder, batch, or coalesce
    /// beyond what the backend already did (§5). Iteration order over
    /// concurrently-subscribed listeners is unspecified.
    pub fn fire(&self, event: &T) {
        let listeners = self.listeners.lock().expect("emitter mutex poisoned");
        for listener in listeners.values() {
            listener(event);
        }
    }
}

/// Composite disposable: a scoped teardown callback invoked exactly once,
/// on explicit `dispose()` or on drop, whichever comes first (§9).
pub struct Subscription {
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self { teardown: Some(Box::new(teardown)) }
    }

    /// Combine several disposables into one that tears all of them down.
    pub fn combine(subscriptions: Vec<Subscription>) -> Subscription {
        Subscription::new(move || {
            for mut sub in subscriptions {
                sub.dispose();
            }
        })
    }

    pub fn dispose(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_include_path_case_sensitive_only_on_linux() {
        let caps = capabilities();
        assert_eq!(caps.contains(Capabilities::PATH_CASE_SENSITIVE), is_case_sensitive_platform());
    }

    #[test]
    fn emitter_fires_subscribed_listeners() {
        let emitter: Emitter<u32> = Emitter::new();
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        emitter.subscribe(move |v| seen_clone.lock().unwrap().push(*v));
        emitter.fire(&7);
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn subscription_teardown_runs_once_on_drop() {
        let count = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let count_clone = count.clone();
        {
            let _sub = Subscription::new(move || {
                count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn subscription_teardown_runs_once_on_explicit_dispose() {
        let count = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let count_clone = count.clone();
        let mut sub = Subscription::new(move || {
            count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        sub.dispose();
        drop(sub);
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
