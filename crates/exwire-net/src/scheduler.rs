//! Serialized action executor
//!
//! A scheduler owns one tokio task draining a [`ScheduledQueue`] of boxed
//! async actions. Actions run strictly one at a time in due order, so state
//! touched only from scheduled actions needs no locking. A panicking action
//! is logged and isolated; the scheduler keeps running.

use crate::scheduled_queue::ScheduledQueue;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Boxed action: receives `true` when another action is already due, so it
/// can skip redundant work that the next action will redo anyway.
type Action = Box<dyn FnOnce(bool) -> BoxFuture<'static, ()> + Send>;

/// Runs scheduled actions serially on a dedicated task
pub struct Scheduler {
    name: String,
    queue: ScheduledQueue<Action>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the worker task. The name appears in log lines.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        // Spawning below needs the item type pinned down up front
        let queue: ScheduledQueue<Action> = ScheduledQueue::new();

        let worker_queue = queue.clone();
        let worker_name = name.clone();
        let worker = tokio::spawn(async move {
            while let Some((action, more_ready)) = worker_queue.next().await {
                let result = AssertUnwindSafe(action(more_ready)).catch_unwind().await;
                if result.is_err() {
                    error!(scheduler = %worker_name, "scheduled action panicked");
                }
            }
            debug!(scheduler = %worker_name, "scheduler drained");
        });

        Arc::new(Self {
            name,
            queue,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Schedule an action to run as soon as the worker is free.
    /// Returns false if the scheduler was disposed.
    pub fn schedule<F, Fut>(&self, action: F) -> bool
    where
        F: FnOnce(bool) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.schedule_after(Duration::ZERO, action)
    }

    /// Schedule an action to run after a delay.
    /// Returns false if the scheduler was disposed.
    pub fn schedule_after<F, Fut>(&self, delay: Duration, action: F) -> bool
    where
        F: FnOnce(bool) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Action = Box::new(move |more_ready| action(more_ready).boxed());
        self.queue.push_after(delay, boxed)
    }

    /// Number of actions waiting to run
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Stop accepting actions, run out the backlog, and join the worker.
    pub async fn dispose(&self) {
        self.queue.close();
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if handle.await.is_err() {
                error!(scheduler = %self.name, "scheduler worker aborted");
            }
        }
    }
}
