//! Observer lists with panic isolation
//!
//! Connection lifecycle events fan out to registered callbacks. One
//! misbehaving observer must not take down the connection machinery or
//! starve its peers, so each call is individually unwind-guarded.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// A list of observers for one event kind
pub struct CallbackSet<A> {
    name: &'static str,
    callbacks: Mutex<Vec<Callback<A>>>,
}

impl<A> CallbackSet<A> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Register an observer
    pub fn add(&self, callback: impl Fn(&A) + Send + Sync + 'static) {
        self.callbacks.lock().push(Arc::new(callback));
    }

    /// Invoke every observer with the event. A panicking observer is logged
    /// and the rest still run.
    pub fn emit(&self, event: &A) {
        let snapshot: Vec<Callback<A>> = self.callbacks.lock().clone();
        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!(event = self.name, "observer panicked");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.lock().is_empty()
    }
}
