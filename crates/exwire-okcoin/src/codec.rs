//! Channel-envelope wire codec
//!
//! This exchange frames its feed differently from the full channel: control
//! replies are `event` objects carrying the channel they settle, and data
//! frames wrap the typed payload in a `{"channel": ..., "data": ...}`
//! envelope. Liveness is a literal `ping`/`pong` text exchange.
//!
//! Subscribe acks and errors both carry their channel so the gateway can
//! correlate them; the channel rides in [`FeedError::reason`] for errors.

use chrono::{DateTime, Utc};
use exwire_net::Codec;
use exwire_types::level::{deserialize_decimal, deserialize_opt_decimal};
use exwire_types::{
    channel_key, DoneReason, FeedError, FeedMessage, FeedRequest, OrderChange, OrderDone,
    OrderKind, OrderMatch, OrderOpen, OrderReceived, Product, Side, StreamKind, SubscribeAck,
    WireError, WireResult,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize)]
struct OpFrame<'a> {
    op: &'a str,
    args: Vec<String>,
}

#[derive(Deserialize)]
struct EventFrame {
    event: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct DataFrame {
    #[allow(dead_code)]
    channel: String,
    data: Value,
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
    reason: DoneReason,
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

/// Channel keys this client subscribes with, one per product/stream pair
pub fn subscription_args(products: &[Product], streams: &[StreamKind]) -> Vec<String> {
    let mut args = Vec::with_capacity(products.len() * streams.len());
    for product in products {
        for stream in streams {
            args.push(channel_key(product, *stream));
        }
    }
    args
}

/// Codec for the channel-envelope protocol
#[derive(Debug, Default, Clone, Copy)]
pub struct OkCoinCodec;

impl OkCoinCodec {
    fn invalid(raw: &str, detail: impl std::fmt::Display) -> WireError {
        WireError::InvalidMessage {
            message: detail.to_string(),
            raw: Some(raw.to_string()),
        }
    }

    fn decode_data(raw: &str, data: Value) -> WireResult<FeedMessage> {
        let kind = data
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Self::invalid(raw, "data frame missing type"))?
            .to_string();

        fn parse<T: serde::de::DeserializeOwned>(raw: &str, value: Value) -> WireResult<T> {
            serde_json::from_value(value).map_err(|e| OkCoinCodec::invalid(raw, e))
        }

        Ok(match kind.as_str() {
            "received" => {
                let m: RawReceived = parse(raw, data)?;
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
                let m: RawOpen = parse(raw, data)?;
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
                let m: RawMatch = parse(raw, data)?;
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
                let m: RawDone = parse(raw, data)?;
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
                let m: RawChange = parse(raw, data)?;
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
            other => FeedMessage::Unknown(other.to_string()),
        })
    }
}

impl Codec for OkCoinCodec {
    type In = FeedMessage;
    type Out = FeedRequest;

    fn encode(&self, msg: &FeedRequest) -> WireResult<String> {
        let frame = match msg {
            FeedRequest::Subscribe { products, streams } => OpFrame {
                op: "subscribe",
                args: subscription_args(products, streams),
            },
            FeedRequest::Unsubscribe { products, streams } => OpFrame {
                op: "unsubscribe",
                args: subscription_args(products, streams),
            },
            FeedRequest::Ping => return Ok("ping".to_string()),
        };
        serde_json::to_string(&frame).map_err(|e| WireError::InvalidMessage {
            message: e.to_string(),
            raw: None,
        })
    }

    fn decode(&self, raw: &str) -> WireResult<Vec<FeedMessage>> {
        if raw == "pong" {
            return Ok(vec![FeedMessage::Heartbeat]);
        }

        let value: Value = serde_json::from_str(raw).map_err(|e| Self::invalid(raw, e))?;

        if value.get("event").is_some() {
            let frame: EventFrame =
                serde_json::from_value(value).map_err(|e| Self::invalid(raw, e))?;
            return Ok(match frame.event.as_str() {
                // Both acks settle the channel they name; the gateway only
                // ever has one kind of request inflight per channel
                "subscribed" | "unsubscribed" => {
                    vec![FeedMessage::SubscribeAck(SubscribeAck {
                        channels: frame.channel.into_iter().collect(),
                    })]
                }
                "error" => vec![FeedMessage::Error(FeedError {
                    message: frame.message.unwrap_or_else(|| "unspecified error".into()),
                    reason: frame.channel,
                })],
                other => vec![FeedMessage::Unknown(other.to_string())],
            });
        }

        if value.get("channel").is_some() {
            let frame: DataFrame =
                serde_json::from_value(value).map_err(|e| Self::invalid(raw, e))?;
            return Ok(vec![Self::decode_data(raw, frame.data)?]);
        }

        Err(Self::invalid(raw, "frame is neither event nor data"))
    }
}
