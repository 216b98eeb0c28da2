//! Fixed-interval background actions
//!
//! Runs an async closure on a fixed cadence (heartbeats, stale-order sweeps)
//! until stopped. A panicking tick is logged and the cadence continues; a
//! tick that overruns its interval delays the next one rather than bursting.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Handle to a repeating background action
pub struct PeriodicAction {
    name: String,
    stop: Arc<Notify>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicAction {
    /// Spawn the action. The first tick fires after one full interval.
    pub fn start<F, Fut>(name: impl Into<String>, interval: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let stop = Arc::new(Notify::new());

        let task_stop = Arc::clone(&stop);
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval's first tick is immediate; swallow it
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_stop.notified() => {
                        debug!(action = %task_name, "periodic action stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if AssertUnwindSafe(action()).catch_unwind().await.is_err() {
                            error!(action = %task_name, "periodic action panicked");
                        }
                    }
                }
            }
        });

        Self {
            name,
            stop,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the cadence and wait for an in-flight tick to finish.
    pub async fn stop(&self) {
        self.stop.notify_waiters();
        self.stop.notify_one();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for PeriodicAction {
    fn drop(&mut self) {
        // Best effort if the owner never called stop()
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_ticks_at_interval() {
        let count = Arc::new(AtomicU32::new(0));
        let tick_count = count.clone();
        let action = PeriodicAction::start("counter", Duration::from_millis(100), move || {
            let tick_count = tick_count.clone();
            async move {
                tick_count.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        action.stop().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_ticks() {
        let count = Arc::new(AtomicU32::new(0));
        let tick_count = count.clone();
        let action = PeriodicAction::start("counter", Duration::from_millis(100), move || {
            let tick_count = tick_count.clone();
            async move {
                tick_count.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        action.stop().await;
        let seen = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_tick_does_not_stop_cadence() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let tick_log = log.clone();
        let ticks = Arc::new(AtomicU32::new(0));
        let tick_ticks = ticks.clone();
        let action = PeriodicAction::start("flaky", Duration::from_millis(100), move || {
            let tick_log = tick_log.clone();
            let n = tick_ticks.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    panic!("first tick fails");
                }
                tick_log.lock().push(n);
            }
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        action.stop().await;
        assert_eq!(*log.lock(), vec![1]);
    }
}
