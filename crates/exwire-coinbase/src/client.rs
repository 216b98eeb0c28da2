//! Market data client
//!
//! Owns a [`DurableConnection`] speaking the full-channel protocol and one
//! [`OrderBookBuilder`] per subscribed product. Inbound messages route to the
//! right book; applied changes surface as [`Event`]s on a single channel.
//!
//! The full channel carries no snapshots, so books start empty and in the
//! `awaiting snapshot` state: the first incremental for a product trips a
//! sequence gap and emits [`Event::ResyncNeeded`]. The caller answers with a
//! REST snapshot via [`CoinbaseClient::resync`] (or [`apply_snapshot`]
//! directly), after which incrementals flow. Reconnects put every book back
//! into that state, since continuity is lost with the transport.
//!
//! [`apply_snapshot`]: CoinbaseClient::apply_snapshot

use crate::codec::CoinbaseCodec;
use crate::events::Event;
use dashmap::DashMap;
use exwire_book::{BookError, BookIncrement, LevelDelta, OrderBookBuilder};
use exwire_net::{
    Connector, DurableConfig, DurableConnection, FnConnector, MessageReader, WsTransport, Writer,
};
use exwire_rest::{RestClient, RestError};
use exwire_types::{
    FeedMessage, FeedRequest, PriceLevel, Product, StreamKind, WireError, WireResult,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, trace, warn};

/// Default feed endpoint
pub const DEFAULT_WS_URL: &str = "wss://ws-feed.exchange.coinbase.com";

/// Errors surfaced by the client's own operations (the feed itself reports
/// problems as [`Event`]s)
#[derive(Debug, thiserror::Error)]
pub enum CoinbaseError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Rest(#[from] RestError),
    #[error(transparent)]
    Book(#[from] BookError),
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct CoinbaseConfig {
    pub ws_url: String,
    pub products: Vec<Product>,
    pub streams: Vec<StreamKind>,
    pub durable: DurableConfig,
}

impl CoinbaseConfig {
    pub fn new(products: Vec<Product>) -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            products,
            streams: vec![StreamKind::Book],
            durable: DurableConfig::default(),
        }
    }

    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }

    pub fn with_streams(mut self, streams: Vec<StreamKind>) -> Self {
        self.streams = streams;
        self
    }

    pub fn with_durable(mut self, durable: DurableConfig) -> Self {
        self.durable = durable;
        self
    }
}

struct BookEntry {
    builder: OrderBookBuilder,
    /// Incrementals are dropped until a snapshot arrives
    awaiting_snapshot: bool,
}

impl BookEntry {
    fn new(product: Product) -> Self {
        Self {
            builder: OrderBookBuilder::new(product),
            awaiting_snapshot: false,
        }
    }
}

type Books = Arc<DashMap<Product, BookEntry>>;

/// Full-channel market data client
pub struct CoinbaseClient {
    conn: DurableConnection<CoinbaseCodec>,
    books: Books,
    events_tx: UnboundedSender<Event>,
    events_rx: Mutex<Option<UnboundedReceiver<Event>>>,
}

impl CoinbaseClient {
    /// Client dialing the configured WebSocket endpoint
    pub fn new(config: CoinbaseConfig) -> Self {
        let url = config.ws_url.clone();
        Self::with_connector(config, FnConnector::new(move || WsTransport::new(url.clone())))
    }

    /// Client with a caller-supplied connector (tests, proxies)
    pub fn with_connector(config: CoinbaseConfig, connector: impl Connector) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let books: Books = Arc::new(DashMap::new());

        let handshake_tx = events_tx.clone();
        let products = config.products.clone();
        let streams = config.streams.clone();

        let route_books = Arc::clone(&books);
        let route_tx = events_tx.clone();

        let conn = DurableConnection::builder(connector, CoinbaseCodec)
            .with_config(config.durable)
            .on_handshake(move |reader, writer| {
                subscribe_handshake(
                    reader,
                    writer,
                    products.clone(),
                    streams.clone(),
                    handshake_tx.clone(),
                )
            })
            .on_message(move |msg, _is_last| route(&route_books, &route_tx, msg))
            .build();

        let connected_books = Arc::clone(&books);
        let connected_tx = events_tx.clone();
        conn.on_connected(move || {
            // A fresh transport starts a fresh sequence stream; every book
            // must be reseeded before its incrementals can apply.
            for mut entry in connected_books.iter_mut() {
                entry.awaiting_snapshot = true;
                let _ = connected_tx.send(Event::ResyncNeeded {
                    product: entry.key().clone(),
                });
            }
            let _ = connected_tx.send(Event::Connected);
        });

        let disconnected_tx = events_tx.clone();
        conn.on_disconnected(move || {
            let _ = disconnected_tx.send(Event::Disconnected);
        });

        Self {
            conn,
            books,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Take the event receiver. Yields `Some` exactly once.
    pub fn take_event_receiver(&self) -> Option<UnboundedReceiver<Event>> {
        self.events_rx.lock().take()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn connect(&self) {
        self.conn.connect();
    }

    pub fn reconnect(&self) {
        self.conn.reconnect();
    }

    pub async fn disconnect(&self) {
        self.conn.disconnect().await;
    }

    pub async fn dispose(&self) {
        self.conn.dispose().await;
    }

    pub fn is_established(&self) -> bool {
        self.conn.is_established()
    }

    /// The underlying connection, for callers wiring extra plumbing
    pub fn connection(&self) -> &DurableConnection<CoinbaseCodec> {
        &self.conn
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe to additional streams on the live connection
    pub async fn subscribe(
        &self,
        products: Vec<Product>,
        streams: Vec<StreamKind>,
    ) -> WireResult<()> {
        let guard = self.conn.lock().await?;
        guard
            .writer()
            .send(&FeedRequest::Subscribe { products, streams })
            .await
    }

    /// Unsubscribe streams on the live connection
    pub async fn unsubscribe(
        &self,
        products: Vec<Product>,
        streams: Vec<StreamKind>,
    ) -> WireResult<()> {
        let guard = self.conn.lock().await?;
        guard
            .writer()
            .send(&FeedRequest::Unsubscribe { products, streams })
            .await
    }

    // ========================================================================
    // Books
    // ========================================================================

    /// Seed or reseed a product's book from a snapshot.
    ///
    /// Clears the awaiting-snapshot latch and emits the resulting deltas as
    /// an event in addition to returning them.
    pub fn apply_snapshot(
        &self,
        snapshot: &exwire_types::BookSnapshot,
    ) -> Result<Vec<LevelDelta>, BookError> {
        let mut entry = self
            .books
            .entry(snapshot.product.clone())
            .or_insert_with(|| BookEntry::new(snapshot.product.clone()));
        let deltas = entry.builder.on_snapshot(snapshot)?;
        entry.awaiting_snapshot = false;
        info!(product = %snapshot.product, seq = snapshot.seq, "book reseeded");
        if !deltas.is_empty() {
            let _ = self.events_tx.send(Event::BookDeltas {
                product: snapshot.product.clone(),
                deltas: deltas.clone(),
            });
        }
        Ok(deltas)
    }

    /// Fetch a fresh snapshot over REST and apply it.
    ///
    /// The standard answer to [`Event::ResyncNeeded`].
    pub async fn resync(
        &self,
        rest: &RestClient,
        product: &Product,
    ) -> Result<Vec<LevelDelta>, CoinbaseError> {
        let snapshot = rest.get_book_snapshot(product).await?;
        Ok(self.apply_snapshot(&snapshot)?)
    }

    /// Run a closure against a product's book, if one exists
    pub fn with_book<R>(
        &self,
        product: &Product,
        f: impl FnOnce(&OrderBookBuilder) -> R,
    ) -> Option<R> {
        self.books.get(product).map(|entry| f(&entry.builder))
    }

    pub fn best_bid(&self, product: &Product) -> Option<PriceLevel> {
        self.with_book(product, |book| book.best_bid()).flatten()
    }

    pub fn best_ask(&self, product: &Product) -> Option<PriceLevel> {
        self.with_book(product, |book| book.best_ask()).flatten()
    }

    /// Last applied sequence for a product's book
    pub fn book_sequence(&self, product: &Product) -> Option<u64> {
        self.with_book(product, |book| book.sequence()).flatten()
    }
}

/// Subscribe on the fresh transport and wait for the exchange to confirm.
/// Feed messages racing ahead of the ack stay buffered for the steady-state
/// handler; only the ack (or a rejection) is consumed here.
async fn subscribe_handshake(
    reader: MessageReader<FeedMessage>,
    writer: Writer<CoinbaseCodec>,
    products: Vec<Product>,
    streams: Vec<StreamKind>,
    events: UnboundedSender<Event>,
) -> WireResult<()> {
    writer
        .send(&FeedRequest::Subscribe { products, streams })
        .await?;

    loop {
        match reader.peek().await {
            Some(FeedMessage::SubscribeAck(ack)) => {
                reader.consume();
                debug!(channels = ack.channels.len(), "subscriptions confirmed");
                let _ = events.send(Event::Subscribed {
                    channels: ack.channels,
                });
                return Ok(());
            }
            Some(FeedMessage::Error(e)) => {
                reader.consume();
                return Err(WireError::SubscriptionRejected {
                    channel: "subscribe".to_string(),
                    reason: e.message,
                });
            }
            // Feed data ahead of the ack; leave it for the message handler
            Some(_) => reader.skip(),
            None => return Err(WireError::NotConnected),
        }
    }
}

/// Steady-state dispatch: one inbound message to books and events
fn route(books: &DashMap<Product, BookEntry>, events: &UnboundedSender<Event>, msg: FeedMessage) {
    match msg {
        FeedMessage::Snapshot(snapshot) => {
            // Not produced by this feed, but a codec may synthesize one
            let mut entry = books
                .entry(snapshot.product.clone())
                .or_insert_with(|| BookEntry::new(snapshot.product.clone()));
            match entry.builder.on_snapshot(&snapshot) {
                Ok(deltas) => {
                    entry.awaiting_snapshot = false;
                    if !deltas.is_empty() {
                        let _ = events.send(Event::BookDeltas {
                            product: snapshot.product.clone(),
                            deltas,
                        });
                    }
                }
                Err(e) => warn!(product = %snapshot.product, error = %e, "snapshot rejected"),
            }
        }
        FeedMessage::Received(m) => {
            let product = m.product.clone();
            apply_incremental(books, events, &product, BookIncrement::Received(&m));
        }
        FeedMessage::Open(m) => {
            let product = m.product.clone();
            apply_incremental(books, events, &product, BookIncrement::Open(&m));
        }
        FeedMessage::Match(m) => {
            let product = m.product.clone();
            apply_incremental(books, events, &product, BookIncrement::Match(&m));
        }
        FeedMessage::Done(m) => {
            let product = m.product.clone();
            apply_incremental(books, events, &product, BookIncrement::Done(&m));
        }
        FeedMessage::Change(m) => {
            let product = m.product.clone();
            apply_incremental(books, events, &product, BookIncrement::Change(&m));
        }
        FeedMessage::SubscribeAck(ack) => {
            let _ = events.send(Event::Subscribed {
                channels: ack.channels,
            });
        }
        FeedMessage::Error(e) => {
            warn!(message = %e.message, reason = ?e.reason, "feed error");
            let _ = events.send(Event::FeedError { message: e.message });
        }
        FeedMessage::Heartbeat => trace!("heartbeat"),
        FeedMessage::Unknown(kind) => debug!(kind = %kind, "unrecognized message"),
    }
}

fn apply_incremental(
    books: &DashMap<Product, BookEntry>,
    events: &UnboundedSender<Event>,
    product: &Product,
    update: BookIncrement<'_>,
) {
    let mut entry = books
        .entry(product.clone())
        .or_insert_with(|| BookEntry::new(product.clone()));

    if entry.awaiting_snapshot {
        return;
    }

    match entry.builder.on_incremental(update) {
        Ok(outcome) => {
            if !outcome.applied {
                return;
            }
            if !outcome.deltas.is_empty() {
                let _ = events.send(Event::BookDeltas {
                    product: product.clone(),
                    deltas: outcome.deltas,
                });
            }
            if let Some(fill) = outcome.trade {
                let _ = events.send(Event::Trade {
                    product: product.clone(),
                    fill,
                });
            }
        }
        Err(e) => {
            // Gap or corruption: freeze the book until a snapshot lands
            warn!(product = %product, error = %e, "book out of sync");
            entry.awaiting_snapshot = true;
            let _ = events.send(Event::ResyncNeeded {
                product: product.clone(),
            });
        }
    }
}
