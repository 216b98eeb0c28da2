//! Coinbase Exchange binding
//!
//! Supplies the exchange-specific pieces on top of `exwire-net`: the
//! full-channel [`CoinbaseCodec`] and a [`CoinbaseClient`] that keeps
//! per-product order books in sync and publishes [`Event`]s.
//!
//! # Example
//!
//! ```no_run
//! use exwire_coinbase::{CoinbaseClient, CoinbaseConfig, Event};
//! use exwire_rest::RestClient;
//! use exwire_types::Product;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = CoinbaseClient::new(CoinbaseConfig::new(vec![Product::new("BTC-USD")]));
//!     let mut events = client.take_event_receiver().unwrap();
//!     let rest = RestClient::new();
//!
//!     client.connect();
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             Event::ResyncNeeded { product } => {
//!                 let _ = client.resync(&rest, &product).await;
//!             }
//!             Event::BookDeltas { product, .. } => {
//!                 if let Some(bid) = client.best_bid(&product) {
//!                     println!("{product} best bid {} x {}", bid.price, bid.size);
//!                 }
//!             }
//!             _ => {}
//!         }
//!     }
//! }
//! ```

pub mod client;
pub mod codec;
pub mod events;

pub use client::{CoinbaseClient, CoinbaseConfig, CoinbaseError, DEFAULT_WS_URL};
pub use codec::{decode_snapshot, CoinbaseCodec};
pub use events::Event;
