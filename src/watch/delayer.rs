//! Throttled delayer (§9): a "scheduled-at-most-once" token. Calling
//! `trigger(f)` while a run is already pending replaces the task that will
//! run; the first scheduled call fires after `delay` elapses. This crate
//! only ever uses `delay = 0`, which still coalesces a same-tick burst of
//! callers onto a single eventual run (§8.5) rather than guaranteeing
//! synchronous execution.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type BoxedTask = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

pub struct ThrottledDelayer {
    next_task: Arc<Mutex<Option<BoxedTask>>>,
    scheduled: Arc<AtomicBool>,
}

impl ThrottledDelayer {
    pub fn new() -> Self {
        Self { next_task: Arc::new(Mutex::new(None)), scheduled: Arc::new(AtomicBool::new(false)) }
    }

    /// Replace the pending task with `task`. Spawns the delay-then-run
    /// runner only if one isn't already in flight.
    pub fn trigger<F>(&self, task: F)
    where
        F: FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + 'static,
    {
        *self.next_task.lock().expect("delayer mutex poisoned") = Some(Box::new(task));

        if self.scheduled.swap(true, Ordering::SeqCst) {
            // A runner is already waiting out the delay; it will pick up
            // this task (or whatever supersedes it next) when it fires.
            return;
        }

        let next_task = Arc::clone(&self.next_task);
        let scheduled = Arc::clone(&self.scheduled);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::ZERO).await;
            scheduled.store(false, Ordering::SeqCst);
            let task = next_task.lock().expect("delayer mutex poisoned").take();
            if let Some(task) = task {
                task().await;
            }
        });
    }
}

impl Default for ThrottledDelayer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn bursts_of_triggers_run_exactly_once() {
        let delayer = ThrottledDelayer::new();
        let runs = Arc::new(AtomicU32::new(0));

        for _ in 0..5 {
            let runs = Arc::clone(&runs);
            delayer.trigger(move || {
                Box::pin(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
            });
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
