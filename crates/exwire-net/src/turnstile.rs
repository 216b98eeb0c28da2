//! Single-inflight request gate
//!
//! A turnstile admits one outstanding request at a time over a
//! [`DurableConnection`]. While a request is inflight, further sends are
//! parked in a deadline-ordered queue and dispatched one by one as each
//! predecessor completes. Every completion is invoked exactly once: with the
//! reply, or with `None` on a send failure, a reply timeout, or a disconnect.
//! A reply timeout also recycles the connection, since a feed that stops
//! answering is indistinguishable from a dead one.

use crate::codec::Codec;
use crate::durable::DurableConnection;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Completion callback: `Some(reply)` on success, `None` otherwise.
pub type DoneFn<In> = Box<dyn FnOnce(Option<In>) + Send>;

/// Timeouts for the turnstile
#[derive(Debug, Clone)]
pub struct TurnstileConfig {
    /// How long a dispatched request may wait for the transport to confirm
    /// the send. Queued requests are not bounded by this; they wait for
    /// their turn.
    pub send_timeout: Duration,
    /// How long a sent request may wait for its reply
    pub reply_timeout: Duration,
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(10),
        }
    }
}

impl TurnstileConfig {
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }
}

struct Inflight<In> {
    done: DoneFn<In>,
    id: u64,
}

/// A parked request awaiting the inflight slot
struct Queued<C: Codec> {
    due: Instant,
    /// Admission-order tiebreak for equal due times
    id: u64,
    msg: C::Out,
    done: DoneFn<C::In>,
}

// BinaryHeap is a max-heap; reverse so the earliest entry surfaces first
impl<C: Codec> Ord for Queued<C> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.due, other.id).cmp(&(self.due, self.id))
    }
}

impl<C: Codec> PartialOrd for Queued<C> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<C: Codec> PartialEq for Queued<C> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.id == other.id
    }
}

impl<C: Codec> Eq for Queued<C> {}

struct State<C: Codec> {
    inflight: Option<Inflight<C::In>>,
    /// Non-empty only while a request is inflight: settling the slot
    /// promotes the head under the same lock.
    queue: BinaryHeap<Queued<C>>,
}

struct Inner<C: Codec> {
    durable: DurableConnection<C>,
    config: TurnstileConfig,
    state: Mutex<State<C>>,
    next_id: AtomicU64,
}

/// Serializes request/reply exchanges over one connection
pub struct Turnstile<C: Codec> {
    inner: Arc<Inner<C>>,
}

impl<C: Codec> Turnstile<C> {
    pub fn new(durable: DurableConnection<C>, config: TurnstileConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                durable,
                config,
                state: Mutex::new(State {
                    inflight: None,
                    queue: BinaryHeap::new(),
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Send one request. `done` fires exactly once.
    ///
    /// If the inflight slot is free the request goes out immediately;
    /// otherwise it is queued and dispatched once its predecessors complete
    /// by reply, timeout, or disconnect. Returns false only when `done` has
    /// already been called with `None`.
    pub async fn send(&self, msg: C::Out, done: DoneFn<C::In>) -> bool {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);

        {
            let mut state = self.inner.state.lock();
            if state.inflight.is_some() {
                state.queue.push(Queued {
                    due: Instant::now(),
                    id,
                    msg,
                    done,
                });
                return true;
            }
            state.inflight = Some(Inflight { done, id });
        }

        Arc::clone(&self.inner).dispatch(id, msg).await
    }

    /// Route an inbound reply to the inflight request.
    ///
    /// Returns true if a request was completed by it. The next queued
    /// request, if any, is dispatched afterwards.
    pub fn on_reply(&self, reply: C::In) -> bool {
        match self.inner.settle(None) {
            Some((done, next)) => {
                done(Some(reply));
                self.inner.promote(next);
                true
            }
            None => false,
        }
    }

    /// Fail the inflight request and advance the queue. Called on
    /// disconnect; queued requests go out once the connection returns.
    pub fn on_disconnect(&self) {
        if let Some((done, next)) = self.inner.settle(None) {
            done(None);
            self.inner.promote(next);
        }
    }

    /// True if a request is currently awaiting its reply.
    pub fn is_busy(&self) -> bool {
        self.inner.state.lock().inflight.is_some()
    }

    /// Number of requests queued behind the inflight one
    pub fn pending(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

impl<C: Codec> Inner<C> {
    /// Put the claimed request on the wire and arm its reply timeout.
    async fn dispatch(self: Arc<Self>, id: u64, msg: C::Out) -> bool {
        if !self.durable.connected() {
            self.fail_dispatch(id);
            return false;
        }
        let guard = match self.durable.lock_timeout(self.config.send_timeout).await {
            Ok(guard) => guard,
            Err(_) => {
                self.fail_dispatch(id);
                return false;
            }
        };
        if guard.writer().send(&msg).await.is_err() {
            drop(guard);
            self.fail_dispatch(id);
            return false;
        }
        drop(guard);

        self.arm_reply_timeout(id);
        true
    }

    fn fail_dispatch(self: &Arc<Self>, id: u64) {
        if let Some((done, next)) = self.settle(Some(id)) {
            done(None);
            self.promote(next);
        }
    }

    fn arm_reply_timeout(self: &Arc<Self>, id: u64) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.reply_timeout).await;
            if let Some((done, next)) = inner.settle(Some(id)) {
                warn!("reply timeout, recycling connection");
                done(None);
                inner.durable.reconnect();
                // Goes out on the replacement connection
                inner.promote(next);
            }
        });
    }

    /// Complete the inflight slot and promote the queue head into it, both
    /// under one lock, so the slot is never observably free while requests
    /// are queued. With `Some(id)` the slot is only settled if it still
    /// holds that request.
    ///
    /// Returns the settled completion plus the promoted request to
    /// dispatch, or `None` if the slot was empty or held a different id.
    fn settle(&self, id: Option<u64>) -> Option<(DoneFn<C::In>, Option<(u64, C::Out)>)> {
        let mut state = self.state.lock();
        let entry = match state.inflight.take() {
            Some(entry) if id.map_or(true, |want| want == entry.id) => entry,
            other => {
                state.inflight = other;
                return None;
            }
        };
        let next = state.queue.pop().map(|queued| {
            state.inflight = Some(Inflight {
                done: queued.done,
                id: queued.id,
            });
            (queued.id, queued.msg)
        });
        Some((entry.done, next))
    }

    /// Dispatch a promoted request on its own task. The caller has already
    /// run the settled completion, so ordering is preserved.
    fn promote(self: &Arc<Self>, next: Option<(u64, C::Out)>) {
        if let Some((id, msg)) = next {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.dispatch(id, msg).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FnConnector;
    use crate::durable::DurableConfig;
    use crate::transport::{MockHandle, MockTransport};
    use exwire_types::WireResult;
    use std::sync::atomic::AtomicU32;

    struct LineCodec;

    impl Codec for LineCodec {
        type In = String;
        type Out = String;

        fn encode(&self, msg: &String) -> WireResult<String> {
            Ok(msg.clone())
        }

        fn decode(&self, raw: &str) -> WireResult<Vec<String>> {
            Ok(vec![raw.to_string()])
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn connected_pair() -> (Turnstile<LineCodec>, Arc<Mutex<Vec<MockHandle>>>) {
        let handles: Arc<Mutex<Vec<MockHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let factory_handles = handles.clone();
        let connector = FnConnector::new(move || {
            let (transport, handle) = MockTransport::new("wss://mock.test");
            factory_handles.lock().push(handle);
            transport
        });
        let durable = DurableConnection::builder(connector, LineCodec)
            .with_config(DurableConfig::default().with_lock_timeout(Duration::from_millis(200)))
            .build();
        durable.connect();
        wait_until(|| durable.is_established()).await;

        let turnstile = Turnstile::new(
            durable,
            TurnstileConfig::default()
                .with_send_timeout(Duration::from_millis(100))
                .with_reply_timeout(Duration::from_millis(200)),
        );
        (turnstile, handles)
    }

    fn capture() -> (DoneFn<String>, Arc<Mutex<Vec<Option<String>>>>) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        (
            Box::new(move |reply| sink.lock().push(reply)),
            results,
        )
    }

    #[tokio::test]
    async fn test_reply_completes_request() {
        let (turnstile, handles) = connected_pair().await;
        let (done, results) = capture();

        assert!(turnstile.send("ping".into(), done).await);
        assert!(turnstile.is_busy());
        assert_eq!(handles.lock()[0].sent(), vec!["ping".to_string()]);

        assert!(turnstile.on_reply("pong".into()));
        assert!(!turnstile.is_busy());
        assert_eq!(*results.lock(), vec![Some("pong".to_string())]);
    }

    #[tokio::test]
    async fn test_second_request_queues_behind_inflight() {
        let (turnstile, handles) = connected_pair().await;
        let (done1, r1) = capture();
        let (done2, r2) = capture();

        assert!(turnstile.send("first".into(), done1).await);
        assert!(turnstile.send("second".into(), done2).await);

        // Only the first is on the wire; the second holds in the queue
        assert_eq!(handles.lock()[0].sent(), vec!["first".to_string()]);
        assert_eq!(turnstile.pending(), 1);

        assert!(turnstile.on_reply("ack-1".into()));
        assert_eq!(*r1.lock(), vec![Some("ack-1".to_string())]);

        // Settling the first dispatches the second
        wait_until(|| handles.lock()[0].sent().len() == 2).await;
        assert_eq!(
            handles.lock()[0].sent(),
            vec!["first".to_string(), "second".to_string()]
        );
        assert!(turnstile.is_busy());
        assert_eq!(turnstile.pending(), 0);

        assert!(turnstile.on_reply("ack-2".into()));
        assert_eq!(*r2.lock(), vec![Some("ack-2".to_string())]);
    }

    #[tokio::test]
    async fn test_queued_requests_dispatch_in_admission_order() {
        let (turnstile, handles) = connected_pair().await;
        let (done1, _r1) = capture();

        assert!(turnstile.send("first".into(), done1).await);
        for name in ["second", "third", "fourth"] {
            let (done, _r) = capture();
            assert!(turnstile.send(name.into(), done).await);
        }
        assert_eq!(turnstile.pending(), 3);

        // Reply only after each request has actually hit the wire
        for i in 1..=4 {
            wait_until(|| handles.lock()[0].sent().len() == i).await;
            assert!(turnstile.on_reply(format!("ack-{i}")));
        }

        assert_eq!(
            handles.lock()[0].sent(),
            vec![
                "first".to_string(),
                "second".to_string(),
                "third".to_string(),
                "fourth".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_queued_request_survives_reply_timeout() {
        let (turnstile, handles) = connected_pair().await;
        let (done1, r1) = capture();
        let (done2, _r2) = capture();

        assert!(turnstile.send("first".into(), done1).await);
        assert!(turnstile.send("second".into(), done2).await);

        // No reply: the first times out, the connection is recycled, and
        // the queued request goes out on the replacement
        wait_until(|| !r1.lock().is_empty()).await;
        assert_eq!(*r1.lock(), vec![None]);
        wait_until(|| handles.lock().len() == 2).await;
        wait_until(|| !handles.lock()[1].sent().is_empty()).await;
        assert_eq!(handles.lock()[1].sent(), vec!["second".to_string()]);
    }

    #[tokio::test]
    async fn test_completion_fires_before_next_dispatch() {
        let (turnstile, handles) = connected_pair().await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let log = order.clone();
        let done1: DoneFn<String> = Box::new(move |_| log.lock().push("first done"));
        let log = order.clone();
        let done2: DoneFn<String> = Box::new(move |_| log.lock().push("second done"));

        assert!(turnstile.send("first".into(), done1).await);
        assert!(turnstile.send("second".into(), done2).await);
        {
            let sent_log = order.clone();
            let handle = handles.lock()[0].clone();
            tokio::spawn(async move {
                loop {
                    if handle.sent().len() == 2 {
                        sent_log.lock().push("second sent");
                        return;
                    }
                    tokio::task::yield_now().await;
                }
            });
        }

        assert!(turnstile.on_reply("ack".into()));
        wait_until(|| order.lock().len() == 2).await;
        assert_eq!(order.lock()[0], "first done");
    }

    #[tokio::test]
    async fn test_reply_timeout_fails_and_reconnects() {
        let (turnstile, handles) = connected_pair().await;
        let (done, results) = capture();

        assert!(turnstile.send("ping".into(), done).await);
        wait_until(|| !results.lock().is_empty()).await;
        assert_eq!(*results.lock(), vec![None]);
        assert!(!turnstile.is_busy());
        // The stalled connection was replaced
        wait_until(|| handles.lock().len() == 2).await;
    }

    #[tokio::test]
    async fn test_late_reply_not_double_completed() {
        let (turnstile, _handles) = connected_pair().await;
        let (done, results) = capture();

        assert!(turnstile.send("ping".into(), done).await);
        wait_until(|| !results.lock().is_empty()).await;

        // Reply arrives after the timeout already completed the request
        assert!(!turnstile.on_reply("pong".into()));
        assert_eq!(*results.lock(), vec![None]);
    }

    #[tokio::test]
    async fn test_disconnect_fails_inflight_and_advances_queue() {
        let (turnstile, handles) = connected_pair().await;
        let (done1, r1) = capture();
        let (done2, _r2) = capture();

        assert!(turnstile.send("first".into(), done1).await);
        assert!(turnstile.send("second".into(), done2).await);
        turnstile.on_disconnect();

        assert_eq!(*r1.lock(), vec![None]);
        // The queued request is promoted and sent on the live connection
        wait_until(|| handles.lock()[0].sent().len() == 2).await;
        assert_eq!(handles.lock()[0].sent()[1], "second".to_string());
    }

    #[tokio::test]
    async fn test_send_without_connection_fails_fast() {
        let connector = FnConnector::new(|| {
            let (transport, handle) = MockTransport::new("wss://mock.test");
            handle.set_fail_connect(true);
            drop(handle);
            transport
        });
        let durable = DurableConnection::builder(connector, LineCodec)
            .with_config(DurableConfig::default().with_lock_timeout(Duration::from_millis(50)))
            .build();
        let turnstile = Turnstile::new(
            durable,
            TurnstileConfig::default().with_send_timeout(Duration::from_millis(50)),
        );

        let (done, results) = capture();
        assert!(!turnstile.send("ping".into(), done).await);
        assert_eq!(*results.lock(), vec![None]);
        assert!(!turnstile.is_busy());
    }

    #[tokio::test]
    async fn test_slot_frees_for_next_request() {
        let (turnstile, handles) = connected_pair().await;
        let count = Arc::new(AtomicU32::new(0));

        for i in 0..3 {
            let count = count.clone();
            let done: DoneFn<String> = Box::new(move |reply| {
                assert!(reply.is_some());
                count.fetch_add(1, Ordering::SeqCst);
            });
            assert!(turnstile.send(format!("req-{i}"), done).await);
            assert!(turnstile.on_reply(format!("rsp-{i}")));
        }

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(handles.lock()[0].sent().len(), 3);
    }
}
