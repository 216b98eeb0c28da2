//! Client event stream
//!
//! Everything the client observes is funneled into one unbounded channel so
//! consumers get a single ordered view: connection lifecycle, confirmed
//! subscriptions, book deltas, trades, and resync demands.

use exwire_book::{LevelDelta, TradeFill};
use exwire_types::Product;

/// One client event
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Transport established and handshake complete
    Connected,
    /// Live transport torn down; sequence continuity is lost
    Disconnected,
    /// Exchange confirmed subscriptions, as `product:stream` keys
    Subscribed { channels: Vec<String> },
    /// Price-level changes from one applied book message
    BookDeltas {
        product: Product,
        deltas: Vec<LevelDelta>,
    },
    /// A trade printed on the feed
    Trade { product: Product, fill: TradeFill },
    /// The book for this product needs a fresh snapshot before further
    /// incrementals can apply (sequence gap, corruption, or reconnect)
    ResyncNeeded { product: Product },
    /// Application-level error reported by the exchange
    FeedError { message: String },
}
