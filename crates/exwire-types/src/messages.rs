//! Typed feed messages
//!
//! The closed set of messages the connectivity core routes. Exchange codecs
//! translate their wire formats into these types; the book engine and the
//! correlation layers only ever see this normalized form.

use crate::enums::{OrderKind, Side, StreamKind};
use crate::level::deserialize_opt_decimal;
use crate::product::Product;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Build the logical channel key for a product + stream pair.
///
/// Channel keys correlate requests with replies in the Gateway layer and
/// identify subscriptions ("BTC-USD:book", "ETH-USD:trades").
pub fn channel_key(product: &Product, kind: StreamKind) -> String {
    format!("{}:{}", product, kind.as_str())
}

/// One resting order inside a full book snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotOrder {
    /// Exchange-assigned order id
    pub order_id: String,
    /// Book side
    pub side: Side,
    /// Resting price
    pub price: Decimal,
    /// Remaining size
    pub size: Decimal,
}

/// Full point-in-time order book for a single product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshot {
    /// Product this snapshot belongs to
    pub product: Product,
    /// Exchange sequence number the snapshot was taken at
    pub seq: u64,
    /// All resting orders, both sides
    pub orders: Vec<SnapshotOrder>,
}

/// Order acknowledged by the exchange (no book effect)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReceived {
    pub product: Product,
    pub seq: u64,
    pub order_id: String,
    pub side: Side,
    pub kind: OrderKind,
    pub time: Option<DateTime<Utc>>,
}

/// Order opened on the book with a remaining size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderOpen {
    pub product: Product,
    pub seq: u64,
    pub order_id: String,
    pub side: Side,
    pub price: Decimal,
    pub remaining_size: Decimal,
    pub time: Option<DateTime<Utc>>,
}

/// Trade between a resting maker order and an incoming taker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMatch {
    pub product: Product,
    pub seq: u64,
    pub maker_order_id: String,
    pub taker_order_id: String,
    /// Side of the maker order
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub time: Option<DateTime<Utc>>,
}

/// Order left the book (filled or canceled)
///
/// `price`/`remaining_size` are absent for market orders, which never rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDone {
    pub product: Product,
    pub seq: u64,
    pub order_id: String,
    pub side: Side,
    #[serde(default, deserialize_with = "deserialize_opt_decimal")]
    pub price: Option<Decimal>,
    #[serde(default, deserialize_with = "deserialize_opt_decimal")]
    pub remaining_size: Option<Decimal>,
    pub reason: DoneReason,
    pub time: Option<DateTime<Utc>>,
}

/// Why an order left the book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoneReason {
    Filled,
    Canceled,
}

/// Order size reduced in place (self-trade prevention adjustment)
///
/// `price` is absent for market orders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderChange {
    pub product: Product,
    pub seq: u64,
    pub order_id: String,
    pub side: Side,
    #[serde(default, deserialize_with = "deserialize_opt_decimal")]
    pub price: Option<Decimal>,
    pub new_size: Decimal,
    pub old_size: Decimal,
    pub time: Option<DateTime<Utc>>,
}

/// Subscription acknowledged by the exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeAck {
    /// Channels the exchange confirmed
    pub channels: Vec<String>,
}

/// Application-level error reported by the exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedError {
    pub message: String,
    pub reason: Option<String>,
}

/// Closed sum type of every inbound feed message
///
/// Matched exhaustively at the dispatch seams; adding a variant forces every
/// dispatcher to handle it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeedMessage {
    Snapshot(BookSnapshot),
    Received(OrderReceived),
    Open(OrderOpen),
    Match(OrderMatch),
    Done(OrderDone),
    Change(OrderChange),
    SubscribeAck(SubscribeAck),
    Error(FeedError),
    Heartbeat,
    /// Parsed but unrecognized message kind; carried for diagnostics
    Unknown(String),
}

impl FeedMessage {
    /// Sequence number for book-stream messages, if any
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::Snapshot(m) => Some(m.seq),
            Self::Received(m) => Some(m.seq),
            Self::Open(m) => Some(m.seq),
            Self::Match(m) => Some(m.seq),
            Self::Done(m) => Some(m.seq),
            Self::Change(m) => Some(m.seq),
            _ => None,
        }
    }

    /// Product for product-scoped messages, if any
    pub fn product(&self) -> Option<&Product> {
        match self {
            Self::Snapshot(m) => Some(&m.product),
            Self::Received(m) => Some(&m.product),
            Self::Open(m) => Some(&m.product),
            Self::Match(m) => Some(&m.product),
            Self::Done(m) => Some(&m.product),
            Self::Change(m) => Some(&m.product),
            _ => None,
        }
    }
}

/// Outbound requests the core can send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedRequest {
    /// Subscribe to streams for a set of products
    Subscribe {
        products: Vec<Product>,
        streams: Vec<StreamKind>,
    },
    /// Unsubscribe from streams
    Unsubscribe {
        products: Vec<Product>,
        streams: Vec<StreamKind>,
    },
    /// Liveness probe
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_channel_key_format() {
        let product = Product::new("BTC-USD");
        assert_eq!(channel_key(&product, StreamKind::Book), "BTC-USD:book");
        assert_eq!(channel_key(&product, StreamKind::Trades), "BTC-USD:trades");
    }

    #[test]
    fn test_feed_message_seq() {
        let msg = FeedMessage::Open(OrderOpen {
            product: Product::new("BTC-USD"),
            seq: 42,
            order_id: "a".into(),
            side: Side::Buy,
            price: dec!(100),
            remaining_size: dec!(1),
            time: None,
        });
        assert_eq!(msg.seq(), Some(42));
        assert_eq!(msg.product().map(|p| p.as_str()), Some("BTC-USD"));

        assert_eq!(FeedMessage::Heartbeat.seq(), None);
    }

    #[test]
    fn test_done_optional_fields() {
        // Market orders report done without a price or remaining size
        let done = OrderDone {
            product: Product::new("BTC-USD"),
            seq: 7,
            order_id: "m".into(),
            side: Side::Sell,
            price: None,
            remaining_size: None,
            reason: DoneReason::Filled,
            time: None,
        };
        let json = serde_json::to_string(&done).unwrap();
        let parsed: OrderDone = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, done);
    }
}
