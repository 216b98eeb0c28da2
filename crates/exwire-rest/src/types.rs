//! Wire types for the REST endpoints

use exwire_types::{BookSnapshot, Product, Side, SnapshotOrder};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Server time response
#[derive(Debug, Clone, Deserialize)]
pub struct ServerTime {
    pub iso: String,
    pub epoch: f64,
}

/// Tradable product metadata
#[derive(Debug, Clone, Deserialize)]
pub struct ProductInfo {
    pub id: Product,
    pub base_currency: String,
    pub quote_currency: String,
    pub base_min_size: Decimal,
    pub base_max_size: Decimal,
    pub quote_increment: Decimal,
    #[serde(default)]
    pub status: Option<String>,
}

/// Product ticker
#[derive(Debug, Clone, Deserialize)]
pub struct Ticker {
    pub trade_id: u64,
    pub price: Decimal,
    pub size: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub volume: Decimal,
    pub time: String,
}

/// One historic trade
#[derive(Debug, Clone, Deserialize)]
pub struct Trade {
    pub trade_id: u64,
    pub price: Decimal,
    pub size: Decimal,
    pub side: Side,
    pub time: String,
}

/// Account balance (private)
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub id: String,
    pub currency: String,
    pub balance: Decimal,
    pub available: Decimal,
    pub hold: Decimal,
}

/// Raw order-level book response: entries are `[price, size, order_id]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOrderBook {
    pub sequence: u64,
    pub bids: Vec<(Decimal, Decimal, String)>,
    pub asks: Vec<(Decimal, Decimal, String)>,
}

impl RawOrderBook {
    /// Flatten into the normalized snapshot the book engine consumes
    pub fn into_snapshot(self, product: Product) -> BookSnapshot {
        let mut orders = Vec::with_capacity(self.bids.len() + self.asks.len());
        for (price, size, order_id) in self.bids {
            orders.push(SnapshotOrder {
                order_id,
                side: Side::Buy,
                price,
                size,
            });
        }
        for (price, size, order_id) in self.asks {
            orders.push(SnapshotOrder {
                order_id,
                side: Side::Sell,
                price,
                size,
            });
        }
        BookSnapshot {
            product,
            seq: self.sequence,
            orders,
        }
    }
}
