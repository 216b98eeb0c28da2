//! Order book builder with per-order level membership
//!
//! The builder keeps two sorted price maps (bids descending via `Reverse`,
//! asks ascending) plus an order-id index for O(1) location lookup, the same
//! hybrid layout used for order-level books elsewhere in the workspace.
//!
//! Every mutation is validate-then-mutate: if any check fails the book is
//! left byte-for-byte unchanged and the sequence number does not advance.

use exwire_types::{
    BookSnapshot, OrderChange, OrderDone, OrderMatch, OrderOpen, OrderReceived, PriceLevel,
    Product, Side,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

/// Sequence sentinel below any valid exchange sequence number
const SEQ_SENTINEL: i64 = -1;

/// Errors from applying snapshots or incrementals
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookError {
    /// Snapshot is older than the book state
    #[error("Stale snapshot: seq {got} < last applied {last}")]
    StaleSnapshot { last: u64, got: u64 },

    /// A sequence number was skipped; the caller must re-snapshot
    #[error("Sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    /// An order id was opened twice
    #[error("Duplicate order id: {order_id}")]
    DuplicateOrder { order_id: String },

    /// A match referenced a maker order that is not resting at the level
    #[error("Unknown maker order {order_id} at price {price}")]
    UnknownOrder { order_id: String, price: Decimal },

    /// A size reduction exceeds the level's total
    #[error("Size {requested} exceeds level total {available} at price {price}")]
    SizeExceeded {
        price: Decimal,
        requested: Decimal,
        available: Decimal,
    },

    /// The last order at a level reported a remaining size that disagrees
    /// with the level's total
    #[error("Inconsistent done for {order_id}: reported {reported}, level total {level_total}")]
    InconsistentDone {
        order_id: String,
        reported: Decimal,
        level_total: Decimal,
    },

    /// A message carried a negative size
    #[error("Negative size {size} for order {order_id}")]
    NegativeSize { order_id: String, size: Decimal },
}

/// A single price-level change emitted by the builder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelDelta {
    pub side: Side,
    pub price: Decimal,
    /// Positive for added size, negative for removed size
    pub size_delta: Decimal,
}

/// Trade produced by an order-match incremental
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeFill {
    /// Side of the maker order
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

/// Result of applying one incremental
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApplyOutcome {
    /// Minimal price-level deltas for this message
    pub deltas: Vec<LevelDelta>,
    /// Trade record, present for order-match messages
    pub trade: Option<TradeFill>,
    /// False when the message was stale and ignored
    pub applied: bool,
}

impl ApplyOutcome {
    fn applied(deltas: Vec<LevelDelta>, trade: Option<TradeFill>) -> Self {
        Self {
            deltas,
            trade,
            applied: true,
        }
    }

    fn empty() -> Self {
        Self {
            deltas: Vec::new(),
            trade: None,
            applied: true,
        }
    }

    fn stale() -> Self {
        Self::default()
    }
}

/// Diagnostic counters (see `stats()`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookStats {
    /// `order-done` messages whose order was absent from the recorded level.
    /// Expected for orders that never rested (market orders, immediate
    /// fills); a climbing rate against resting orders indicates corruption.
    pub done_without_order: u64,
    /// Incrementals ignored because their sequence was already applied
    pub stale_ignored: u64,
}

/// One incremental book message, borrowed from the feed
#[derive(Debug, Clone, Copy)]
pub enum BookIncrement<'a> {
    Received(&'a OrderReceived),
    Open(&'a OrderOpen),
    Match(&'a OrderMatch),
    Done(&'a OrderDone),
    Change(&'a OrderChange),
}

impl BookIncrement<'_> {
    /// Exchange sequence number of this message
    pub fn seq(&self) -> u64 {
        match self {
            Self::Received(m) => m.seq,
            Self::Open(m) => m.seq,
            Self::Match(m) => m.seq,
            Self::Done(m) => m.seq,
            Self::Change(m) => m.seq,
        }
    }
}

/// Aggregate state of one price level
#[derive(Debug, Clone, PartialEq, Eq)]
struct LevelState {
    total_size: Decimal,
    order_ids: HashSet<String>,
}

impl LevelState {
    fn new() -> Self {
        Self {
            total_size: Decimal::ZERO,
            order_ids: HashSet::new(),
        }
    }
}

/// Where an order rests, for O(1) lookup by id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OrderLocation {
    price: Decimal,
    side: Side,
}

/// Reconstructs a full order book from snapshots plus incrementals
///
/// One instance per traded product. A full snapshot resets the book; each
/// incremental either applies atomically, is ignored as stale, or reports a
/// sequence gap that obliges the caller to fetch a fresh snapshot.
#[derive(Debug)]
pub struct OrderBookBuilder {
    product: Product,
    /// Bid levels, highest price first
    bids: BTreeMap<Reverse<Decimal>, LevelState>,
    /// Ask levels, lowest price first
    asks: BTreeMap<Decimal, LevelState>,
    /// order_id -> (price, side)
    order_index: HashMap<String, OrderLocation>,
    /// Last applied sequence; SEQ_SENTINEL before the first snapshot
    seq: i64,
    stats: BookStats,
}

impl OrderBookBuilder {
    /// Create an empty builder for a product
    pub fn new(product: Product) -> Self {
        Self {
            product,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            order_index: HashMap::new(),
            seq: SEQ_SENTINEL,
            stats: BookStats::default(),
        }
    }

    /// The product this book tracks
    pub fn product(&self) -> &Product {
        &self.product
    }

    /// Last applied sequence number, if any message has been applied
    pub fn sequence(&self) -> Option<u64> {
        (self.seq >= 0).then_some(self.seq as u64)
    }

    /// Diagnostic counters
    pub fn stats(&self) -> BookStats {
        self.stats
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    /// Replace the book with a full snapshot, returning the minimal deltas
    /// that transform the previous view into the new one.
    ///
    /// The snapshot's sequence must be >= the last applied sequence.
    pub fn on_snapshot(&mut self, snapshot: &BookSnapshot) -> Result<Vec<LevelDelta>, BookError> {
        let snap_seq = snapshot.seq as i64;
        if snap_seq < self.seq {
            return Err(BookError::StaleSnapshot {
                last: self.seq as u64,
                got: snapshot.seq,
            });
        }

        // Aggregate raw orders into per-price levels before touching state
        let mut bids: BTreeMap<Reverse<Decimal>, LevelState> = BTreeMap::new();
        let mut asks: BTreeMap<Decimal, LevelState> = BTreeMap::new();
        let mut index: HashMap<String, OrderLocation> = HashMap::new();

        for order in &snapshot.orders {
            if order.size < Decimal::ZERO {
                return Err(BookError::NegativeSize {
                    order_id: order.order_id.clone(),
                    size: order.size,
                });
            }
            if index.contains_key(&order.order_id) {
                return Err(BookError::DuplicateOrder {
                    order_id: order.order_id.clone(),
                });
            }
            let level = match order.side {
                Side::Buy => bids.entry(Reverse(order.price)).or_insert_with(LevelState::new),
                Side::Sell => asks.entry(order.price).or_insert_with(LevelState::new),
            };
            level.total_size += order.size;
            level.order_ids.insert(order.order_id.clone());
            index.insert(
                order.order_id.clone(),
                OrderLocation {
                    price: order.price,
                    side: order.side,
                },
            );
        }

        let mut deltas = Vec::new();
        merge_diff(&self.bids, &bids, Side::Buy, |k| k.0, &mut deltas);
        merge_diff(&self.asks, &asks, Side::Sell, |k| k, &mut deltas);

        self.bids = bids;
        self.asks = asks;
        self.order_index = index;
        self.seq = snap_seq;

        Ok(deltas)
    }

    // ========================================================================
    // Incrementals
    // ========================================================================

    /// Apply one incremental message.
    ///
    /// - `seq <= last applied`: stale, ignored, `applied == false`.
    /// - `seq > last applied + 1`: gap; the book is unchanged and the caller
    ///   must re-snapshot.
    /// - otherwise the message is applied atomically.
    pub fn on_incremental(&mut self, update: BookIncrement<'_>) -> Result<ApplyOutcome, BookError> {
        let seq = update.seq() as i64;
        if seq <= self.seq {
            self.stats.stale_ignored += 1;
            return Ok(ApplyOutcome::stale());
        }
        if seq > self.seq + 1 {
            return Err(BookError::SequenceGap {
                expected: (self.seq + 1) as u64,
                got: seq as u64,
            });
        }

        let outcome = match update {
            // Informational only: the order is not on the book yet
            BookIncrement::Received(_) => ApplyOutcome::empty(),
            BookIncrement::Open(m) => self.apply_open(m)?,
            BookIncrement::Match(m) => self.apply_match(m)?,
            BookIncrement::Done(m) => self.apply_done(m)?,
            BookIncrement::Change(m) => self.apply_change(m)?,
        };

        self.seq = seq;
        Ok(outcome)
    }

    fn apply_open(&mut self, m: &OrderOpen) -> Result<ApplyOutcome, BookError> {
        if m.remaining_size < Decimal::ZERO {
            return Err(BookError::NegativeSize {
                order_id: m.order_id.clone(),
                size: m.remaining_size,
            });
        }
        if self.order_index.contains_key(&m.order_id) {
            return Err(BookError::DuplicateOrder {
                order_id: m.order_id.clone(),
            });
        }

        let level = self.level_entry(m.side, m.price);
        level.total_size += m.remaining_size;
        level.order_ids.insert(m.order_id.clone());
        self.order_index.insert(
            m.order_id.clone(),
            OrderLocation {
                price: m.price,
                side: m.side,
            },
        );

        Ok(ApplyOutcome::applied(
            vec![LevelDelta {
                side: m.side,
                price: m.price,
                size_delta: m.remaining_size,
            }],
            None,
        ))
    }

    fn apply_match(&mut self, m: &OrderMatch) -> Result<ApplyOutcome, BookError> {
        if m.size < Decimal::ZERO {
            return Err(BookError::NegativeSize {
                order_id: m.maker_order_id.clone(),
                size: m.size,
            });
        }
        {
            let level = self
                .level(m.side, m.price)
                .filter(|l| l.order_ids.contains(&m.maker_order_id))
                .ok_or_else(|| BookError::UnknownOrder {
                    order_id: m.maker_order_id.clone(),
                    price: m.price,
                })?;
            if m.size > level.total_size {
                return Err(BookError::SizeExceeded {
                    price: m.price,
                    requested: m.size,
                    available: level.total_size,
                });
            }
        }

        // Validation passed; the level is known to exist
        if let Some(level) = self.level_mut(m.side, m.price) {
            level.total_size -= m.size;
        }

        Ok(ApplyOutcome::applied(
            vec![LevelDelta {
                side: m.side,
                price: m.price,
                size_delta: -m.size,
            }],
            Some(TradeFill {
                side: m.side,
                price: m.price,
                size: m.size,
            }),
        ))
    }

    fn apply_done(&mut self, m: &OrderDone) -> Result<ApplyOutcome, BookError> {
        // Market orders never rest; they report done without a price
        let Some(price) = m.price else {
            return Ok(ApplyOutcome::empty());
        };
        let remaining = m.remaining_size.unwrap_or(Decimal::ZERO);
        if remaining < Decimal::ZERO {
            return Err(BookError::NegativeSize {
                order_id: m.order_id.clone(),
                size: remaining,
            });
        }

        let (last_order, level_total) = match self.level(m.side, price) {
            Some(level) if level.order_ids.contains(&m.order_id) => {
                (level.order_ids.len() == 1, level.total_size)
            }
            // Never rested on the book (immediate fill) or already removed;
            // the exchange documents this as a silent no-op.
            _ => {
                self.stats.done_without_order += 1;
                return Ok(ApplyOutcome::empty());
            }
        };

        let delta = if last_order {
            if remaining != level_total {
                return Err(BookError::InconsistentDone {
                    order_id: m.order_id.clone(),
                    reported: remaining,
                    level_total,
                });
            }
            self.remove_level(m.side, price);
            self.order_index.remove(&m.order_id);
            level_total
        } else {
            if remaining > level_total {
                return Err(BookError::SizeExceeded {
                    price,
                    requested: remaining,
                    available: level_total,
                });
            }
            if let Some(level) = self.level_mut(m.side, price) {
                level.total_size -= remaining;
                level.order_ids.remove(&m.order_id);
            }
            self.order_index.remove(&m.order_id);
            remaining
        };

        let deltas = if delta.is_zero() {
            Vec::new()
        } else {
            vec![LevelDelta {
                side: m.side,
                price,
                size_delta: -delta,
            }]
        };
        Ok(ApplyOutcome::applied(deltas, None))
    }

    fn apply_change(&mut self, m: &OrderChange) -> Result<ApplyOutcome, BookError> {
        // Market orders and untracked order ids are ignored
        let Some(price) = m.price else {
            return Ok(ApplyOutcome::empty());
        };
        if m.new_size < Decimal::ZERO {
            return Err(BookError::NegativeSize {
                order_id: m.order_id.clone(),
                size: m.new_size,
            });
        }

        let adjustment = m.new_size - m.old_size;
        {
            let Some(level) = self
                .level(m.side, price)
                .filter(|l| l.order_ids.contains(&m.order_id))
            else {
                return Ok(ApplyOutcome::empty());
            };
            if adjustment < Decimal::ZERO && -adjustment > level.total_size {
                return Err(BookError::SizeExceeded {
                    price,
                    requested: -adjustment,
                    available: level.total_size,
                });
            }
        }

        if adjustment.is_zero() {
            return Ok(ApplyOutcome::empty());
        }
        if let Some(level) = self.level_mut(m.side, price) {
            level.total_size += adjustment;
        }

        Ok(ApplyOutcome::applied(
            vec![LevelDelta {
                side: m.side,
                price,
                size_delta: adjustment,
            }],
            None,
        ))
    }

    // ========================================================================
    // Level access
    // ========================================================================

    fn level(&self, side: Side, price: Decimal) -> Option<&LevelState> {
        match side {
            Side::Buy => self.bids.get(&Reverse(price)),
            Side::Sell => self.asks.get(&price),
        }
    }

    fn level_mut(&mut self, side: Side, price: Decimal) -> Option<&mut LevelState> {
        match side {
            Side::Buy => self.bids.get_mut(&Reverse(price)),
            Side::Sell => self.asks.get_mut(&price),
        }
    }

    fn level_entry(&mut self, side: Side, price: Decimal) -> &mut LevelState {
        match side {
            Side::Buy => self.bids.entry(Reverse(price)).or_insert_with(LevelState::new),
            Side::Sell => self.asks.entry(price).or_insert_with(LevelState::new),
        }
    }

    fn remove_level(&mut self, side: Side, price: Decimal) {
        match side {
            Side::Buy => {
                self.bids.remove(&Reverse(price));
            }
            Side::Sell => {
                self.asks.remove(&price);
            }
        }
    }

    // ========================================================================
    // Views
    // ========================================================================

    /// Best bid as an aggregated level
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids
            .iter()
            .next()
            .map(|(k, v)| PriceLevel::new(k.0, v.total_size))
    }

    /// Best ask as an aggregated level
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks
            .iter()
            .next()
            .map(|(k, v)| PriceLevel::new(*k, v.total_size))
    }

    /// Bid-ask spread
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_ask(), self.best_bid()) {
            (Some(ask), Some(bid)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    /// Mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_ask(), self.best_bid()) {
            (Some(ask), Some(bid)) => Some((ask.price + bid.price) / Decimal::TWO),
            _ => None,
        }
    }

    /// Aggregated bid levels, highest price first
    pub fn bid_levels(&self) -> Vec<PriceLevel> {
        self.bids
            .iter()
            .map(|(k, v)| PriceLevel::new(k.0, v.total_size))
            .collect()
    }

    /// Aggregated ask levels, lowest price first
    pub fn ask_levels(&self) -> Vec<PriceLevel> {
        self.asks
            .iter()
            .map(|(k, v)| PriceLevel::new(*k, v.total_size))
            .collect()
    }

    /// Number of bid levels
    pub fn bid_level_count(&self) -> usize {
        self.bids.len()
    }

    /// Number of ask levels
    pub fn ask_level_count(&self) -> usize {
        self.asks.len()
    }

    /// Total number of tracked orders
    pub fn order_count(&self) -> usize {
        self.order_index.len()
    }

    /// Check if an order is currently resting on the book
    pub fn has_order(&self, order_id: &str) -> bool {
        self.order_index.contains_key(order_id)
    }

    /// True if no orders rest on either side
    pub fn is_empty(&self) -> bool {
        self.order_index.is_empty()
    }
}

/// Symmetric merge over two price-sorted maps, emitting the minimal deltas
/// transforming `old` into `new`.
///
/// Advances whichever iterator holds the smaller key: removal for prices only
/// in `old`, addition for prices only in `new`, a size delta for prices in
/// both whose totals differ. Both iterators are exhausted by the trailing
/// single-sided arms.
fn merge_diff<K, F>(
    old: &BTreeMap<K, LevelState>,
    new: &BTreeMap<K, LevelState>,
    side: Side,
    price_of: F,
    out: &mut Vec<LevelDelta>,
) where
    K: Ord + Copy,
    F: Fn(K) -> Decimal,
{
    let mut a = old.iter().peekable();
    let mut b = new.iter().peekable();

    loop {
        match (a.peek(), b.peek()) {
            (None, None) => break,
            (Some((k, lv)), None) => {
                out.push(LevelDelta {
                    side,
                    price: price_of(**k),
                    size_delta: -lv.total_size,
                });
                a.next();
            }
            (None, Some((k, lv))) => {
                out.push(LevelDelta {
                    side,
                    price: price_of(**k),
                    size_delta: lv.total_size,
                });
                b.next();
            }
            (Some((ka, la)), Some((kb, lb))) => {
                if ka < kb {
                    out.push(LevelDelta {
                        side,
                        price: price_of(**ka),
                        size_delta: -la.total_size,
                    });
                    a.next();
                } else if kb < ka {
                    out.push(LevelDelta {
                        side,
                        price: price_of(**kb),
                        size_delta: lb.total_size,
                    });
                    b.next();
                } else {
                    if la.total_size != lb.total_size {
                        out.push(LevelDelta {
                            side,
                            price: price_of(**ka),
                            size_delta: lb.total_size - la.total_size,
                        });
                    }
                    a.next();
                    b.next();
                }
            }
        }
    }
}
