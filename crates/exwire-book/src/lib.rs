//! Incremental order book reconstruction
//!
//! This crate rebuilds a consistent full order book from sequence-numbered
//! full snapshots plus incremental diffs (order open / match / done /
//! change), tracking per-price-level order membership and emitting the
//! minimal price-level deltas for each applied message.
//!
//! The engine is a pure state machine: no I/O, no async. One
//! [`OrderBookBuilder`] instance lives per traded product.
//!
//! # Example
//!
//! ```
//! use exwire_book::{BookIncrement, OrderBookBuilder};
//! use exwire_types::{BookSnapshot, OrderOpen, Product, Side, SnapshotOrder};
//! use rust_decimal_macros::dec;
//!
//! let mut book = OrderBookBuilder::new(Product::new("BTC-USD"));
//! book.on_snapshot(&BookSnapshot {
//!     product: Product::new("BTC-USD"),
//!     seq: 5,
//!     orders: vec![SnapshotOrder {
//!         order_id: "a".into(),
//!         side: Side::Buy,
//!         price: dec!(100),
//!         size: dec!(1),
//!     }],
//! })
//! .unwrap();
//!
//! let outcome = book
//!     .on_incremental(BookIncrement::Open(&OrderOpen {
//!         product: Product::new("BTC-USD"),
//!         seq: 6,
//!         order_id: "c".into(),
//!         side: Side::Buy,
//!         price: dec!(100),
//!         remaining_size: dec!(0.5),
//!         time: None,
//!     }))
//!     .unwrap();
//! assert_eq!(outcome.deltas.len(), 1);
//! ```

mod builder;

pub use builder::{
    ApplyOutcome, BookError, BookIncrement, BookStats, LevelDelta, OrderBookBuilder, TradeFill,
};
