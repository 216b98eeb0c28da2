//! Buffered message delivery with a handshake phase
//!
//! A reader starts in the buffering phase: the receive task pushes decoded
//! messages while the handshake inspects them with `peek`, defers them with
//! `skip`, or removes them with `consume`. Once the handshake attaches a
//! sink, everything left in the buffer is drained to it in arrival order and
//! later pushes go straight through.
//!
//! Buffering accessors called after the sink is attached indicate a broken
//! caller and panic.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

/// Sink callback: `(message, is_last)` where `is_last` is false only while
/// draining a backlog with more messages behind this one.
pub type SinkFn<T> = Box<dyn FnMut(T, bool) + Send>;

struct ReaderState<T> {
    /// Buffered messages; consumed slots become `None` until compaction
    slots: VecDeque<Option<T>>,
    /// Index of the next message to peek
    cursor: usize,
    /// Number of `Some` slots
    live: usize,
    sink: Option<SinkFn<T>>,
    closed: bool,
}

impl<T> ReaderState<T> {
    /// Drop consumed slots once they make up half the buffer, remapping the
    /// cursor to the surviving messages.
    fn maybe_compact(&mut self) {
        if self.slots.len() < 8 || self.slots.len() < self.live * 2 {
            return;
        }
        let mut new_cursor = 0;
        let mut kept = VecDeque::with_capacity(self.live);
        for (i, slot) in self.slots.drain(..).enumerate() {
            if let Some(item) = slot {
                if i < self.cursor {
                    new_cursor += 1;
                }
                kept.push_back(Some(item));
            }
        }
        self.slots = kept;
        self.cursor = new_cursor;
    }

    fn next_live_from_cursor(&self) -> Option<usize> {
        (self.cursor..self.slots.len()).find(|&i| self.slots[i].is_some())
    }
}

/// Shared handle to a connection's inbound message buffer
pub struct MessageReader<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<ReaderState<T>>,
    notify: Notify,
}

impl<T> Clone for MessageReader<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for MessageReader<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> MessageReader<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ReaderState {
                    slots: VecDeque::new(),
                    cursor: 0,
                    live: 0,
                    sink: None,
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Deliver one inbound message.
    ///
    /// Buffering phase: appended for the handshake. Sink phase: handed to
    /// the sink directly. Returns false if the reader is closed.
    pub fn push(&self, item: T) -> bool {
        let taken = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return false;
            }
            match state.sink.take() {
                Some(sink) => sink,
                None => {
                    state.slots.push_back(Some(item));
                    state.live += 1;
                    drop(state);
                    self.inner.notify.notify_one();
                    return true;
                }
            }
        };

        // Sink runs without the lock so it may call back into the reader.
        // Pushes racing the callback land in the buffer; flush them before
        // putting the sink back. `sink` is None only once it has been
        // reinstalled, which ends the loop.
        let mut sink = Some(taken);
        let mut next = Some(item);
        while let Some(item) = next {
            match sink.as_mut() {
                Some(sink) => sink(item, true),
                None => unreachable!("sink reinstalled with backlog pending"),
            }
            next = {
                let mut state = self.inner.state.lock();
                match state.next_live_from_cursor() {
                    Some(i) => {
                        let item = state.slots[i]
                            .take()
                            .unwrap_or_else(|| unreachable!("live slot empty"));
                        state.live -= 1;
                        state.cursor = i + 1;
                        state.maybe_compact();
                        Some(item)
                    }
                    None => {
                        state.sink = sink.take();
                        None
                    }
                }
            };
        }
        true
    }

    /// Await the message at the cursor without advancing.
    ///
    /// Returns `None` once the reader is closed. Panics if a sink is
    /// attached.
    pub async fn peek(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let state = self.inner.state.lock();
                assert!(state.sink.is_none(), "peek after sink attach");
                if let Some(i) = state.next_live_from_cursor() {
                    return state.slots[i].clone();
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// [`peek`](Self::peek) bounded by a timeout; `None` on timeout or close.
    pub async fn peek_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.peek()).await.ok()?
    }

    /// Advance past the cursor message, leaving it for the sink drain.
    /// Panics if a sink is attached or nothing has been peeked.
    pub fn skip(&self) {
        let mut state = self.inner.state.lock();
        assert!(state.sink.is_none(), "skip after sink attach");
        let i = state
            .next_live_from_cursor()
            .unwrap_or_else(|| panic!("skip with no buffered message"));
        state.cursor = i + 1;
    }

    /// Remove the cursor message; it will not reach the sink.
    /// Panics if a sink is attached or nothing has been peeked.
    pub fn consume(&self) -> T {
        let mut state = self.inner.state.lock();
        assert!(state.sink.is_none(), "consume after sink attach");
        let i = state
            .next_live_from_cursor()
            .unwrap_or_else(|| panic!("consume with no buffered message"));
        let item = state.slots[i]
            .take()
            .unwrap_or_else(|| unreachable!("live slot empty"));
        state.live -= 1;
        state.cursor = i + 1;
        state.maybe_compact();
        item
    }

    /// Number of buffered (unconsumed) messages
    pub fn buffered(&self) -> usize {
        self.inner.state.lock().live
    }

    /// End the buffering phase: drain every unconsumed message to `sink` in
    /// arrival order (skipped ones included), then deliver pushes directly.
    ///
    /// The drain marks `is_last = false` for all but the final backlog
    /// message. Panics if a sink is already attached.
    pub fn attach_sink(&self, mut sink: SinkFn<T>) {
        let backlog: Vec<T> = {
            let mut state = self.inner.state.lock();
            assert!(state.sink.is_none(), "sink already attached");
            state.cursor = 0;
            state.live = 0;
            state.slots.drain(..).flatten().collect()
        };

        trace!(backlog = backlog.len(), "attaching sink");
        let n = backlog.len();
        for (i, item) in backlog.into_iter().enumerate() {
            sink(item, i + 1 == n);
        }

        let flush = {
            let mut state = self.inner.state.lock();
            if state.live == 0 {
                state.sink = Some(sink);
                None
            } else {
                // A push slipped in while draining without the lock
                Some(sink)
            }
        };
        if let Some(sink) = flush {
            self.flush_then_install(sink);
        }
    }

    fn flush_then_install(&self, mut sink: SinkFn<T>) {
        loop {
            let item = {
                let mut state = self.inner.state.lock();
                match state.next_live_from_cursor() {
                    Some(i) => {
                        let item = state.slots[i]
                            .take()
                            .unwrap_or_else(|| unreachable!("live slot empty"));
                        state.live -= 1;
                        state.cursor = i + 1;
                        item
                    }
                    None => {
                        state.sink = Some(sink);
                        return;
                    }
                }
            };
            sink(item, true);
        }
    }

    /// Close the reader: pushes are rejected and `peek` returns `None`.
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

    #[tokio::test]
    async fn test_peek_does_not_advance() {
        let reader = MessageReader::new();
        reader.push(1);

        assert_eq!(reader.peek().await, Some(1));
        assert_eq!(reader.peek().await, Some(1));
    }

    #[tokio::test]
    async fn test_consume_removes_message() {
        let reader = MessageReader::new();
        reader.push(1);
        reader.push(2);

        assert_eq!(reader.peek().await, Some(1));
        assert_eq!(reader.consume(), 1);
        assert_eq!(reader.peek().await, Some(2));
        assert_eq!(reader.buffered(), 1);
    }

    #[tokio::test]
    async fn test_skip_defers_to_sink() {
        let reader = MessageReader::new();
        reader.push(1);
        reader.push(2);
        reader.push(3);

        assert_eq!(reader.peek().await, Some(1));
        reader.skip(); // 1 stays buffered
        assert_eq!(reader.peek().await, Some(2));
        reader.consume(); // 2 removed
        assert_eq!(reader.peek().await, Some(3));
        reader.skip();

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink_log = delivered.clone();
        reader.attach_sink(Box::new(move |item, is_last| {
            sink_log.lock().push((item, is_last));
        }));

        // Arrival order, skipped messages included, consumed one absent
        assert_eq!(*delivered.lock(), vec![(1, false), (3, true)]);
    }

    #[tokio::test]
    async fn test_peek_waits_for_push() {
        let reader = MessageReader::new();
        let pusher = reader.clone();

        let peeked = tokio::spawn(async move { reader.peek().await });
        tokio::task::yield_now().await;
        pusher.push(42);

        assert_eq!(peeked.await.unwrap(), Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peek_timeout_elapses() {
        let reader = MessageReader::<u32>::new();
        assert_eq!(reader.peek_timeout(Duration::from_millis(50)).await, None);
    }

    #[tokio::test]
    async fn test_direct_delivery_after_attach() {
        let reader = MessageReader::new();
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink_log = delivered.clone();
        reader.attach_sink(Box::new(move |item, is_last| {
            sink_log.lock().push((item, is_last));
        }));

        reader.push(1);
        reader.push(2);

        assert_eq!(*delivered.lock(), vec![(1, true), (2, true)]);
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn test_drain_is_last_flags() {
        let reader = MessageReader::new();
        for i in 0..3 {
            reader.push(i);
        }

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink_log = delivered.clone();
        reader.attach_sink(Box::new(move |item, is_last| {
            sink_log.lock().push((item, is_last));
        }));

        assert_eq!(*delivered.lock(), vec![(0, false), (1, false), (2, true)]);
    }

    #[tokio::test]
    #[should_panic(expected = "peek after sink attach")]
    async fn test_peek_after_attach_panics() {
        let reader = MessageReader::<u32>::new();
        reader.attach_sink(Box::new(|_, _| {}));
        let _ = reader.peek().await;
    }

    #[tokio::test]
    async fn test_close_rejects_push_and_ends_peek() {
        let reader = MessageReader::<u32>::new();
        reader.close();

        assert!(!reader.push(1));
        assert_eq!(reader.peek().await, None);
    }

    #[tokio::test]
    async fn test_sink_reentrant_push_is_flushed() {
        let reader = MessageReader::new();
        let delivered = Arc::new(Mutex::new(Vec::new()));

        let sink_log = delivered.clone();
        let reentrant = reader.clone();
        reader.attach_sink(Box::new(move |item, _| {
            sink_log.lock().push(item);
            // The sink is detached while it runs, so this lands in the
            // buffer and must be flushed before the sink is reinstalled.
            if item < 100 {
                reentrant.push(item + 100);
            }
        }));

        reader.push(1);

        assert_eq!(*delivered.lock(), vec![1, 101]);
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn test_compaction_preserves_order() {
        let reader = MessageReader::new();
        for i in 0..32 {
            reader.push(i);
        }
        // Consume enough to trigger compaction, then verify the remainder
        for expected in 0..20 {
            assert_eq!(reader.peek().await, Some(expected));
            assert_eq!(reader.consume(), expected);
        }
        for expected in 20..32 {
            assert_eq!(reader.peek().await, Some(expected));
            reader.skip();
        }

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink_log = delivered.clone();
        reader.attach_sink(Box::new(move |item, _| {
            sink_log.lock().push(item);
        }));
        assert_eq!(*delivered.lock(), (20..32).collect::<Vec<_>>());
    }
}
