//! Side, StreamKind and OrderKind enums

use serde::{Deserialize, Serialize};

/// Order/trade side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy order (bid)
    Buy,
    /// Sell order (ask)
    Sell,
}

impl Side {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Returns the side name as used in API messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

/// Logical message streams a client can subscribe to
///
/// Exchange codecs map these exhaustively onto wire channel names, so a new
/// stream is a breaking change by design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Full order-by-order book feed (snapshot + incrementals)
    Book,
    /// Executed trades
    Trades,
    /// Best bid/offer and last-price updates
    Ticker,
    /// Private order lifecycle updates
    Orders,
}

impl StreamKind {
    /// Returns the stream name as used in channel keys and API messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Book => "book",
            Self::Trades => "trades",
            Self::Ticker => "ticker",
            Self::Orders => "orders",
        }
    }

    /// Returns true if this stream requires authentication
    pub fn is_private(&self) -> bool {
        matches!(self, Self::Orders)
    }
}

/// Order kinds distinguished by the book feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    /// Limit order - may rest on the book
    Limit,
    /// Market order - never rests on the book
    Market,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_side_serde() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"buy\"");
        let parsed: Side = serde_json::from_str("\"sell\"").unwrap();
        assert_eq!(parsed, Side::Sell);
    }

    #[test]
    fn test_stream_kind_names() {
        assert_eq!(StreamKind::Book.as_str(), "book");
        assert_eq!(StreamKind::Trades.as_str(), "trades");
        assert!(StreamKind::Orders.is_private());
        assert!(!StreamKind::Book.is_private());
    }
}
