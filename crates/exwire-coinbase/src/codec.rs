//! Full-channel wire codec
//!
//! Translates the exchange's JSON feed (`received`/`open`/`match`/`done`/
//! `change` plus control messages) into the normalized [`FeedMessage`] set,
//! and renders [`FeedRequest`]s as subscribe/unsubscribe frames.
//!
//! Decimal fields arrive as strings and are parsed losslessly; `done` and
//! `change` omit price fields for market orders.

use chrono::{DateTime, Utc};
use exwire_net::Codec;
use exwire_types::level::{deserialize_decimal, deserialize_opt_decimal};
use exwire_types::{
    channel_key, BookSnapshot, FeedError, FeedMessage, FeedRequest, OrderChange, OrderDone,
    OrderKind, OrderMatch, OrderOpen, OrderReceived, Product, Side, StreamKind, SubscribeAck,
    WireError, WireResult,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire channel name for a stream
fn channel_name(kind: StreamKind) -> &'static str {
    match kind {
        StreamKind::Book => "full",
        StreamKind::Trades => "matches",
        StreamKind::Ticker => "ticker",
        StreamKind::Orders => "user",
    }
}

/// Stream for a wire channel name, if recognized
fn stream_kind(name: &str) -> Option<StreamKind> {
    match name {
        "full" => Some(StreamKind::Book),
        "matches" => Some(StreamKind::Trades),
        "ticker" => Some(StreamKind::Ticker),
        "user" => Some(StreamKind::Orders),
        _ => None,
    }
}

#[derive(Serialize)]
struct SubscribeFrame<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    product_ids: &'a [Product],
    channels: Vec<&'static str>,
}

#[derive(Deserialize)]
struct RawReceived {
    product_id: Product,
    sequence: u64,
    order_id: String,
    side: Side,
    order_type: OrderKind,
    time: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RawOpen {
    product_id: Product,
    sequence: u64,
    order_id: String,
    side: Side,
    #[serde(deserialize_with = "deserialize_decimal")]
    price: Decimal,
    #[serde(deserialize_with = "deserialize_decimal")]
    remaining_size: Decimal,
    time: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RawMatch {
    product_id: Product,
    sequence: u64,
    maker_order_id: String,
    taker_order_id: String,
    side: Side,
    #[serde(deserialize_with = "deserialize_decimal")]
    price: Decimal,
    #[serde(deserialize_with = "deserialize_decimal")]
    size: Decimal,
    time: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RawDone {
    product_id: Product,
    sequence: u64,
    order_id: String,
    side: Side,
    #[serde(default, deserialize_with = "deserialize_opt_decimal")]
    price: Option<Decimal>,
    #[serde(default, deserialize_with = "deserialize_opt_decimal")]
    remaining_size: Option<Decimal>,
    reason: exwire_types::DoneReason,
    time: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RawChange {
    product_id: Product,
    sequence: u64,
    order_id: String,
    side: Side,
    #[serde(default, deserialize_with = "deserialize_opt_decimal")]
    price: Option<Decimal>,
    #[serde(deserialize_with = "deserialize_decimal")]
    new_size: Decimal,
    #[serde(deserialize_with = "deserialize_decimal")]
    old_size: Decimal,
    time: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RawChannel {
    name: String,
    #[serde(default)]
    product_ids: Vec<Product>,
}

#[derive(Deserialize)]
struct RawSubscriptions {
    channels: Vec<RawChannel>,
}

#[derive(Deserialize)]
struct RawError {
    message: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Codec for the exchange's full-channel protocol
#[derive(Debug, Default, Clone, Copy)]
pub struct CoinbaseCodec;

impl CoinbaseCodec {
    fn invalid(raw: &str, detail: impl std::fmt::Display) -> WireError {
        WireError::InvalidMessage {
            message: detail.to_string(),
            raw: Some(raw.to_string()),
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(raw: &str, value: Value) -> WireResult<T> {
        serde_json::from_value(value).map_err(|e| Self::invalid(raw, e))
    }
}

impl Codec for CoinbaseCodec {
    type In = FeedMessage;
    type Out = FeedRequest;

    fn encode(&self, msg: &FeedRequest) -> WireResult<String> {
        let frame = match msg {
            FeedRequest::Subscribe { products, streams } => SubscribeFrame {
                kind: "subscribe",
                product_ids: products,
                channels: streams.iter().map(|s| channel_name(*s)).collect(),
            },
            FeedRequest::Unsubscribe { products, streams } => SubscribeFrame {
                kind: "unsubscribe",
                product_ids: products,
                channels: streams.iter().map(|s| channel_name(*s)).collect(),
            },
            FeedRequest::Ping => {
                return Ok(r#"{"type":"ping"}"#.to_string());
            }
        };
        serde_json::to_string(&frame)
            .map_err(|e| WireError::InvalidMessage {
                message: e.to_string(),
                raw: None,
            })
    }

    fn decode(&self, raw: &str) -> WireResult<Vec<FeedMessage>> {
        let value: Value = serde_json::from_str(raw).map_err(|e| Self::invalid(raw, e))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Self::invalid(raw, "missing type field"))?
            .to_string();

        let msg = match kind.as_str() {
            "received" => {
                let m: RawReceived = Self::parse(raw, value)?;
                FeedMessage::Received(OrderReceived {
                    product: m.product_id,
                    seq: m.sequence,
                    order_id: m.order_id,
                    side: m.side,
                    kind: m.order_type,
                    time: m.time,
                })
            }
            "open" => {
                let m: RawOpen = Self::parse(raw, value)?;
                FeedMessage::Open(OrderOpen {
                    product: m.product_id,
                    seq: m.sequence,
                    order_id: m.order_id,
                    side: m.side,
                    price: m.price,
                    remaining_size: m.remaining_size,
                    time: m.time,
                })
            }
            "match" => {
                let m: RawMatch = Self::parse(raw, value)?;
                FeedMessage::Match(OrderMatch {
                    product: m.product_id,
                    seq: m.sequence,
                    maker_order_id: m.maker_order_id,
                    taker_order_id: m.taker_order_id,
                    side: m.side,
                    price: m.price,
                    size: m.size,
                    time: m.time,
                })
            }
            "done" => {
                let m: RawDone = Self::parse(raw, value)?;
                FeedMessage::Done(OrderDone {
                    product: m.product_id,
                    seq: m.sequence,
                    order_id: m.order_id,
                    side: m.side,
                    price: m.price,
                    remaining_size: m.remaining_size,
                    reason: m.reason,
                    time: m.time,
                })
            }
            "change" => {
                let m: RawChange = Self::parse(raw, value)?;
                FeedMessage::Change(OrderChange {
                    product: m.product_id,
                    seq: m.sequence,
                    order_id: m.order_id,
                    side: m.side,
                    price: m.price,
                    new_size: m.new_size,
                    old_size: m.old_size,
                    time: m.time,
                })
            }
            "subscriptions" => {
                let m: RawSubscriptions = Self::parse(raw, value)?;
                let mut channels = Vec::new();
                for channel in m.channels {
                    match stream_kind(&channel.name) {
                        Some(kind) => channels.extend(
                            channel
                                .product_ids
                                .iter()
                                .map(|product| channel_key(product, kind)),
                        ),
                        None => channels.push(channel.name),
                    }
                }
                FeedMessage::SubscribeAck(SubscribeAck { channels })
            }
            "error" => {
                let m: RawError = Self::parse(raw, value)?;
                FeedMessage::Error(FeedError {
                    message: m.message,
                    reason: m.reason,
                })
            }
            "heartbeat" => FeedMessage::Heartbeat,
            other => FeedMessage::Unknown(other.to_string()),
        };

        Ok(vec![msg])
    }
}

/// Parse a REST-sourced snapshot payload, kept here with the rest of the
/// wire translation. The feed itself never carries snapshots.
pub fn decode_snapshot(raw: &str, product: Product) -> WireResult<BookSnapshot> {
    let raw_book: exwire_rest::RawOrderBook =
        serde_json::from_str(raw).map_err(|e| CoinbaseCodec::invalid(raw, e))?;
    Ok(raw_book.into_snapshot(product))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn codec() -> CoinbaseCodec {
        CoinbaseCodec
    }

    #[test]
    fn test_encode_subscribe() {
        let request = FeedRequest::Subscribe {
            products: vec![Product::new("BTC-USD"), Product::new("ETH-USD")],
            streams: vec![StreamKind::Book, StreamKind::Trades],
        };
        let encoded = codec().encode(&request).unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["product_ids"][0], "BTC-USD");
        assert_eq!(value["channels"][0], "full");
        assert_eq!(value["channels"][1], "matches");
    }

    #[test]
    fn test_decode_open() {
        let raw = r#"{
            "type": "open",
            "time": "2024-08-19T11:30:06.564Z",
            "product_id": "BTC-USD",
            "sequence": 10,
            "order_id": "d50ec984-77a8-460a-b958-66f114b0de9b",
            "price": "200.2",
            "remaining_size": "1.00",
            "side": "sell"
        }"#;
        let msgs = codec().decode(raw).unwrap();
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            FeedMessage::Open(open) => {
                assert_eq!(open.product.as_str(), "BTC-USD");
                assert_eq!(open.seq, 10);
                assert_eq!(open.price, dec!(200.2));
                assert_eq!(open.remaining_size, dec!(1.00));
                assert_eq!(open.side, Side::Sell);
                assert!(open.time.is_some());
            }
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_done_market_order_without_price() {
        let raw = r#"{
            "type": "done",
            "product_id": "BTC-USD",
            "sequence": 11,
            "order_id": "abc",
            "reason": "filled",
            "side": "buy"
        }"#;
        let msgs = codec().decode(raw).unwrap();
        match &msgs[0] {
            FeedMessage::Done(done) => {
                assert_eq!(done.price, None);
                assert_eq!(done.remaining_size, None);
                assert_eq!(done.reason, exwire_types::DoneReason::Filled);
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_match() {
        let raw = r#"{
            "type": "match",
            "trade_id": 10,
            "sequence": 50,
            "maker_order_id": "maker",
            "taker_order_id": "taker",
            "time": "2024-08-19T11:30:06.564Z",
            "product_id": "BTC-USD",
            "size": "5.23512",
            "price": "400.23",
            "side": "sell"
        }"#;
        let msgs = codec().decode(raw).unwrap();
        match &msgs[0] {
            FeedMessage::Match(m) => {
                assert_eq!(m.maker_order_id, "maker");
                assert_eq!(m.size, dec!(5.23512));
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_subscriptions_ack_builds_channel_keys() {
        let raw = r#"{
            "type": "subscriptions",
            "channels": [
                {"name": "full", "product_ids": ["BTC-USD", "ETH-USD"]},
                {"name": "matches", "product_ids": ["BTC-USD"]}
            ]
        }"#;
        let msgs = codec().decode(raw).unwrap();
        match &msgs[0] {
            FeedMessage::SubscribeAck(ack) => {
                assert_eq!(
                    ack.channels,
                    vec!["BTC-USD:book", "ETH-USD:book", "BTC-USD:trades"]
                );
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_type_is_carried() {
        let msgs = codec().decode(r#"{"type":"status","products":[]}"#).unwrap();
        assert_eq!(msgs[0], FeedMessage::Unknown("status".to_string()));
    }

    #[test]
    fn test_decode_malformed_frame_errors() {
        assert!(codec().decode("not json").is_err());
        assert!(codec().decode(r#"{"no_type": true}"#).is_err());
        // Right type, missing required fields
        assert!(codec().decode(r#"{"type":"open"}"#).is_err());
    }

    #[test]
    fn test_decode_rest_snapshot() {
        let raw = r#"{
            "sequence": 7,
            "bids": [["100.0", "1.0", "a"]],
            "asks": [["101.0", "2.0", "b"]]
        }"#;
        let snapshot = decode_snapshot(raw, Product::new("BTC-USD")).unwrap();
        assert_eq!(snapshot.seq, 7);
        assert_eq!(snapshot.orders.len(), 2);
    }
}
