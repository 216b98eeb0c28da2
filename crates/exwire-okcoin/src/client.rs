//! Subscription client
//!
//! A thinner binding than the full-channel one: no books, just correlated
//! subscribe/unsubscribe over a [`Gateway`] and a raw [`FeedMessage`] stream
//! for everything else. Each `product:stream` pair is its own gateway
//! channel, so subscriptions to different channels proceed concurrently
//! while a duplicate request on a busy channel fails fast.
//!
//! The exchange drops idle connections, so the client runs a `ping` cadence
//! on a [`PeriodicAction`] and resubscribes everything after a reconnect.

use crate::codec::OkCoinCodec;
use exwire_net::{
    ChannelMap, Connector, DurableConfig, DurableConnection, FnConnector, Gateway, PeriodicAction,
    WsTransport,
};
use exwire_types::{
    channel_key, FeedMessage, FeedRequest, Product, StreamKind, WireError, WireResult,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Default feed endpoint
pub const DEFAULT_WS_URL: &str = "wss://real.okcoin.com:8443/ws/v3";

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);

/// Client configuration
#[derive(Debug, Clone)]
pub struct OkCoinConfig {
    pub ws_url: String,
    pub durable: DurableConfig,
    /// Reply deadline for subscribe/unsubscribe requests
    pub reply_timeout: Duration,
    /// Idle-connection keepalive cadence
    pub ping_interval: Duration,
}

impl Default for OkCoinConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            durable: DurableConfig::default(),
            reply_timeout: Duration::from_secs(10),
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

impl OkCoinConfig {
    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }

    pub fn with_durable(mut self, durable: DurableConfig) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
}

/// Request/reply correlation for this protocol: every request occupies the
/// channel key it subscribes, and acks/errors name the channel they settle
pub struct OkCoinChannels;

impl ChannelMap<OkCoinCodec> for OkCoinChannels {
    fn request_channel(&self, msg: &FeedRequest) -> String {
        match msg {
            FeedRequest::Subscribe { products, streams }
            | FeedRequest::Unsubscribe { products, streams } => {
                match (products.first(), streams.first()) {
                    (Some(product), Some(stream)) => channel_key(product, *stream),
                    _ => String::new(),
                }
            }
            FeedRequest::Ping => "ping".to_string(),
        }
    }

    fn reply_channel(&self, msg: &FeedMessage) -> Option<String> {
        match msg {
            FeedMessage::SubscribeAck(ack) => ack.channels.first().cloned(),
            // The codec parks the offending channel in `reason`
            FeedMessage::Error(e) => e.reason.clone(),
            _ => None,
        }
    }
}

type OkGateway = Gateway<OkCoinCodec, OkCoinChannels>;

/// Market data client with correlated subscriptions
pub struct OkCoinClient {
    gateway: Arc<OkGateway>,
    reply_timeout: Duration,
    /// Confirmed subscriptions, replayed after each reconnect
    subscriptions: Arc<Mutex<HashSet<(Product, StreamKind)>>>,
    feed_rx: Mutex<Option<UnboundedReceiver<FeedMessage>>>,
    pinger: PeriodicAction,
}

impl OkCoinClient {
    /// Client dialing the configured WebSocket endpoint
    pub fn new(config: OkCoinConfig) -> Self {
        let url = config.ws_url.clone();
        Self::with_connector(config, FnConnector::new(move || WsTransport::new(url.clone())))
    }

    /// Client with a caller-supplied connector (tests, proxies)
    pub fn with_connector(config: OkCoinConfig, connector: impl Connector) -> Self {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();

        // The gateway wraps the connection it routes over, so the message
        // handler reaches it through a cell filled in after construction
        let gateway_cell: Arc<Mutex<Option<Arc<OkGateway>>>> = Arc::new(Mutex::new(None));

        let route_cell = Arc::clone(&gateway_cell);
        let conn = DurableConnection::builder(connector, OkCoinCodec)
            .with_config(config.durable)
            .on_message(move |msg, _is_last| route(&route_cell, &feed_tx, msg))
            .build();

        let gateway = Arc::new(
            Gateway::new(conn, OkCoinChannels).with_reply_timeout(config.reply_timeout),
        );
        *gateway_cell.lock() = Some(Arc::clone(&gateway));

        let subscriptions: Arc<Mutex<HashSet<(Product, StreamKind)>>> =
            Arc::new(Mutex::new(HashSet::new()));

        let resub_gateway = Arc::clone(&gateway);
        let resub_subs = Arc::clone(&subscriptions);
        gateway.connection().on_connected(move || {
            let wanted: Vec<_> = resub_subs.lock().iter().cloned().collect();
            if wanted.is_empty() {
                return;
            }
            info!(count = wanted.len(), "replaying subscriptions");
            let gateway = Arc::clone(&resub_gateway);
            tokio::spawn(async move {
                for (product, stream) in wanted {
                    let channel = channel_key(&product, stream);
                    let request = FeedRequest::Subscribe {
                        products: vec![product],
                        streams: vec![stream],
                    };
                    let sent = gateway
                        .send(
                            request,
                            Box::new(move |reply| {
                                if reply.is_none() {
                                    warn!(channel = %channel, "resubscribe unconfirmed");
                                }
                            }),
                        )
                        .await;
                    if !sent {
                        break;
                    }
                }
            });
        });

        let drain_cell = Arc::clone(&gateway_cell);
        gateway.connection().on_disconnected(move || {
            if let Some(gateway) = drain_cell.lock().as_ref() {
                gateway.on_disconnect();
            }
        });

        let ping_conn = gateway.connection().clone();
        let pinger = PeriodicAction::start("okcoin-ping", config.ping_interval, move || {
            let conn = ping_conn.clone();
            async move {
                if let Some(guard) = conn.try_lock() {
                    if let Err(e) = guard.writer().send(&FeedRequest::Ping).await {
                        debug!(error = %e, "keepalive ping failed");
                    }
                }
            }
        });

        Self {
            gateway,
            reply_timeout: config.reply_timeout,
            subscriptions,
            feed_rx: Mutex::new(Some(feed_rx)),
            pinger,
        }
    }

    /// Take the feed receiver. Yields `Some` exactly once.
    pub fn take_feed_receiver(&self) -> Option<UnboundedReceiver<FeedMessage>> {
        self.feed_rx.lock().take()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn connect(&self) {
        self.gateway.connection().connect();
    }

    pub async fn disconnect(&self) {
        self.gateway.connection().disconnect().await;
    }

    pub async fn dispose(&self) {
        self.pinger.stop().await;
        self.gateway.connection().dispose().await;
    }

    pub fn is_established(&self) -> bool {
        self.gateway.connection().is_established()
    }

    /// The underlying connection, for callers wiring extra plumbing
    pub fn connection(&self) -> &DurableConnection<OkCoinCodec> {
        self.gateway.connection()
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe one product/stream pair and wait for the exchange to
    /// confirm. Confirmed pairs are replayed automatically after reconnects.
    pub async fn subscribe(&self, product: Product, stream: StreamKind) -> WireResult<()> {
        let request = FeedRequest::Subscribe {
            products: vec![product.clone()],
            streams: vec![stream],
        };
        self.request(request, &product, stream).await?;
        self.subscriptions.lock().insert((product, stream));
        Ok(())
    }

    /// Unsubscribe one product/stream pair and wait for confirmation
    pub async fn unsubscribe(&self, product: Product, stream: StreamKind) -> WireResult<()> {
        let request = FeedRequest::Unsubscribe {
            products: vec![product.clone()],
            streams: vec![stream],
        };
        self.request(request, &product, stream).await?;
        self.subscriptions.lock().remove(&(product, stream));
        Ok(())
    }

    /// Confirmed subscriptions
    pub fn subscriptions(&self) -> Vec<(Product, StreamKind)> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    async fn request(
        &self,
        request: FeedRequest,
        product: &Product,
        stream: StreamKind,
    ) -> WireResult<()> {
        let channel = channel_key(product, stream);
        let (tx, rx) = oneshot::channel();

        let sent = self
            .gateway
            .send(
                request,
                Box::new(move |reply| {
                    let _ = tx.send(reply);
                }),
            )
            .await;
        if !sent {
            if !self.gateway.connection().connected() {
                return Err(WireError::NotConnected);
            }
            return Err(WireError::ChannelBusy { channel });
        }

        match rx.await {
            Ok(Some(FeedMessage::SubscribeAck(_))) => Ok(()),
            Ok(Some(FeedMessage::Error(e))) => Err(WireError::SubscriptionRejected {
                channel,
                reason: e.message,
            }),
            Ok(Some(other)) => Err(WireError::InvalidMessage {
                message: format!("unexpected reply: {other:?}"),
                raw: None,
            }),
            Ok(None) | Err(_) => Err(WireError::ReplyTimeout {
                channel,
                timeout: self.reply_timeout,
            }),
        }
    }
}

/// Gateway replies settle their requests; everything else goes to the feed
fn route(
    gateway: &Mutex<Option<Arc<OkGateway>>>,
    feed: &UnboundedSender<FeedMessage>,
    msg: FeedMessage,
) {
    let consumed = gateway
        .lock()
        .as_ref()
        .is_some_and(|gateway| gateway.on_message(&msg));
    if consumed {
        return;
    }
    match msg {
        FeedMessage::Heartbeat => trace!("pong"),
        other => {
            let _ = feed.send(other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exwire_net::{MockHandle, MockTransport};

    fn fast_config() -> OkCoinConfig {
        OkCoinConfig::default()
            .with_durable(
                DurableConfig::default()
                    .with_retry_backoff(Duration::from_millis(10))
                    .with_lock_timeout(Duration::from_millis(200)),
            )
            .with_reply_timeout(Duration::from_millis(300))
            .with_ping_interval(Duration::from_secs(600))
    }

    struct Harness {
        client: OkCoinClient,
        handles: Arc<Mutex<Vec<MockHandle>>>,
        feed: UnboundedReceiver<FeedMessage>,
    }

    async fn connected_harness() -> Harness {
        let handles: Arc<Mutex<Vec<MockHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let factory_handles = Arc::clone(&handles);
        let connector = FnConnector::new(move || {
            let (transport, handle) = MockTransport::new("wss://mock.feed");
            factory_handles.lock().push(handle);
            transport
        });
        let client = OkCoinClient::with_connector(fast_config(), connector);
        let feed = client.take_feed_receiver().unwrap();
        client.connect();
        wait_until(|| client.is_established()).await;
        Harness {
            client,
            handles,
            feed,
        }
    }

    async fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..500 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn last_handle(h: &Harness) -> MockHandle {
        h.handles.lock().last().unwrap().clone()
    }

    #[tokio::test]
    async fn test_subscribe_confirms_and_records() {
        let h = connected_harness().await;
        let handle = last_handle(&h);

        let client = &h.client;
        let subscribe = client.subscribe(Product::new("BTC-USD"), StreamKind::Book);
        tokio::pin!(subscribe);

        // Drive the future until the frame hits the wire, then confirm
        tokio::select! {
            _ = &mut subscribe => panic!("confirmed before ack"),
            _ = wait_until(|| !handle.sent().is_empty()) => {}
        }
        let sent = handle.take_sent();
        let frame: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(frame["op"], "subscribe");
        assert_eq!(frame["args"][0], "BTC-USD:book");

        handle.push_message(r#"{"event":"subscribed","channel":"BTC-USD:book"}"#);
        subscribe.await.unwrap();

        assert_eq!(
            client.subscriptions(),
            vec![(Product::new("BTC-USD"), StreamKind::Book)]
        );
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_rejected_subscription_not_recorded() {
        let h = connected_harness().await;
        let handle = last_handle(&h);

        let client = &h.client;
        let subscribe = client.subscribe(Product::new("XX-YY"), StreamKind::Book);
        tokio::pin!(subscribe);
        tokio::select! {
            _ = &mut subscribe => panic!("confirmed before reply"),
            _ = wait_until(|| !handle.sent().is_empty()) => {}
        }

        handle.push_message(
            r#"{"event":"error","message":"channel does not exist","channel":"XX-YY:book"}"#,
        );
        let err = subscribe.await.unwrap_err();
        assert!(matches!(err, WireError::SubscriptionRejected { .. }));
        assert!(client.subscriptions().is_empty());
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_fails_fast() {
        let h = connected_harness().await;
        let handle = last_handle(&h);

        let client = &h.client;
        let first = client.subscribe(Product::new("BTC-USD"), StreamKind::Book);
        tokio::pin!(first);
        tokio::select! {
            _ = &mut first => panic!("confirmed before ack"),
            _ = wait_until(|| !handle.sent().is_empty()) => {}
        }

        // Same channel, still inflight
        let err = client
            .subscribe(Product::new("BTC-USD"), StreamKind::Book)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::ChannelBusy { .. }));

        handle.push_message(r#"{"event":"subscribed","channel":"BTC-USD:book"}"#);
        first.await.unwrap();
        client.dispose().await;
    }

    #[tokio::test]
    async fn test_data_frames_reach_the_feed() {
        let mut h = connected_harness().await;
        let handle = last_handle(&h);

        handle.push_message(
            r#"{"channel":"BTC-USD:book","data":{"type":"open","product_id":"BTC-USD","sequence":1,"order_id":"a","price":"100","remaining_size":"1","side":"buy"}}"#,
        );

        let msg = tokio::time::timeout(Duration::from_secs(2), h.feed.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(msg, FeedMessage::Open(_)));
        h.client.dispose().await;
    }

    #[tokio::test]
    async fn test_reconnect_replays_confirmed_subscriptions() {
        let h = connected_harness().await;
        let handle = last_handle(&h);

        let client = &h.client;
        let subscribe = client.subscribe(Product::new("BTC-USD"), StreamKind::Book);
        tokio::pin!(subscribe);
        tokio::select! {
            _ = &mut subscribe => panic!("confirmed before ack"),
            _ = wait_until(|| !handle.sent().is_empty()) => {}
        }
        handle.push_message(r#"{"event":"subscribed","channel":"BTC-USD:book"}"#);
        subscribe.await.unwrap();

        // Drop the transport and let the connection heal itself
        handle.push_close();
        wait_until(|| h.handles.lock().len() >= 2).await;
        wait_until(|| client.is_established()).await;

        let second = last_handle(&h);
        wait_until(|| !second.sent().is_empty()).await;
        let frame: serde_json::Value =
            serde_json::from_str(&second.take_sent()[0]).unwrap();
        assert_eq!(frame["op"], "subscribe");
        assert_eq!(frame["args"][0], "BTC-USD:book");
        // Settle the replayed request so its reply timer never fires
        second.push_message(r#"{"event":"subscribed","channel":"BTC-USD:book"}"#);

        client.dispose().await;
    }

    #[tokio::test]
    async fn test_subscribe_while_disconnected() {
        let handles: Arc<Mutex<Vec<MockHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let factory_handles = Arc::clone(&handles);
        let connector = FnConnector::new(move || {
            let (transport, handle) = MockTransport::new("wss://mock.feed");
            factory_handles.lock().push(handle);
            transport
        });
        let client = OkCoinClient::with_connector(fast_config(), connector);

        let err = client
            .subscribe(Product::new("BTC-USD"), StreamKind::Book)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::NotConnected));
        client.dispose().await;
    }
}
