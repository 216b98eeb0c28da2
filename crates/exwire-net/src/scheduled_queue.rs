//! Time-ordered multi-producer queue
//!
//! Producers push items with an optional due time; a single consumer awaits
//! them in due order. Items with equal due times are delivered in push order.
//! The consumer also learns whether more items are already due, which lets it
//! batch work without re-polling.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::time::sleep_until;

struct Entry<T> {
    due: Instant,
    /// Push-order tiebreak for equal due times
    seq: u64,
    item: T,
}

// BinaryHeap is a max-heap; reverse so the earliest entry surfaces first
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

struct QueueState<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
    closed: bool,
}

/// Time-ordered MPSC queue
///
/// Cloning shares the underlying queue. Any clone may push; only one
/// consumer should call [`next`](Self::next) at a time.
pub struct ScheduledQueue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> Clone for ScheduledQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send> Default for ScheduledQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> ScheduledQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    heap: BinaryHeap::new(),
                    next_seq: 0,
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Push an item due immediately. Returns false if the queue is closed.
    pub fn push(&self, item: T) -> bool {
        self.push_at(Instant::now(), item)
    }

    /// Push an item due at the given instant. Returns false if closed.
    pub fn push_at(&self, due: Instant, item: T) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return false;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Entry { due, seq, item });
        }
        self.inner.notify.notify_one();
        true
    }

    /// Push an item due after a delay. Returns false if closed.
    pub fn push_after(&self, delay: std::time::Duration, item: T) -> bool {
        self.push_at(Instant::now() + delay, item)
    }

    /// Await the next due item.
    ///
    /// Returns the item plus a flag telling whether another item is already
    /// due behind it. Returns `None` once the queue is closed and drained.
    /// Items pushed before `close` are still delivered.
    pub async fn next(&self) -> Option<(T, bool)> {
        loop {
            // Create before inspecting state so a notify between the unlock
            // and the await is not lost (Notify stores the permit).
            let notified = self.inner.notify.notified();

            let wait_until = {
                let mut state = self.inner.state.lock();
                let now = Instant::now();
                match state.heap.peek() {
                    Some(entry) if entry.due <= now => {
                        let entry = state
                            .heap
                            .pop()
                            .unwrap_or_else(|| unreachable!("peeked entry vanished"));
                        let more_ready =
                            state.heap.peek().is_some_and(|next| next.due <= now);
                        return Some((entry.item, more_ready));
                    }
                    Some(entry) => Some(entry.due),
                    None if state.closed => return None,
                    None => None,
                }
            };

            match wait_until {
                Some(due) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = sleep_until(due.into()) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Number of queued items, due or not
    pub fn len(&self) -> usize {
        self.inner.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue. Pending items are still delivered; new pushes are
    /// rejected.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_for_equal_due_times() {
        let queue = ScheduledQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);

        let (a, more_a) = queue.next().await.unwrap();
        let (b, more_b) = queue.next().await.unwrap();
        let (c, more_c) = queue.next().await.unwrap();

        assert_eq!((a, b, c), (1, 2, 3));
        assert!(more_a);
        assert!(more_b);
        assert!(!more_c);
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_order_not_push_order() {
        let queue = ScheduledQueue::new();
        queue.push_after(Duration::from_millis(100), "late");
        queue.push_after(Duration::from_millis(10), "early");

        let (first, _) = queue.next().await.unwrap();
        let (second, _) = queue.next().await.unwrap();
        assert_eq!(first, "early");
        assert_eq!(second, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_waits_for_due_time() {
        let queue = ScheduledQueue::new();
        let start = tokio::time::Instant::now();
        queue.push_after(Duration::from_millis(50), ());

        queue.next().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_push_wakes_waiting_consumer() {
        let queue = ScheduledQueue::new();
        let producer = queue.clone();

        let consumer = tokio::spawn(async move { queue.next().await });
        tokio::task::yield_now().await;
        producer.push(7);

        let (item, more) = consumer.await.unwrap().unwrap();
        assert_eq!(item, 7);
        assert!(!more);
    }

    #[tokio::test]
    async fn test_close_rejects_pushes_and_drains() {
        let queue = ScheduledQueue::new();
        queue.push(1);
        queue.close();

        assert!(!queue.push(2));
        assert_eq!(queue.next().await, Some((1, false)));
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_empty_consumer() {
        let queue = ScheduledQueue::<()>::new();
        let closer = queue.clone();

        let consumer = tokio::spawn(async move { queue.next().await });
        tokio::task::yield_now().await;
        closer.close();

        assert_eq!(consumer.await.unwrap(), None);
    }
}
