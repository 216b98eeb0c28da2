//! OkCoin binding
//!
//! The channel-envelope protocol: subscriptions are correlated per
//! `product:stream` channel through a gateway, feed data arrives untyped by
//! the connection and is handed to the caller as [`FeedMessage`]s. Pair it
//! with `exwire-book` to maintain books from the raw stream.
//!
//! # Example
//!
//! ```no_run
//! use exwire_okcoin::{OkCoinClient, OkCoinConfig};
//! use exwire_types::{Product, StreamKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = OkCoinClient::new(OkCoinConfig::default());
//!     let mut feed = client.take_feed_receiver().unwrap();
//!
//!     client.connect();
//!     client
//!         .subscribe(Product::new("BTC-USD"), StreamKind::Book)
//!         .await?;
//!
//!     while let Some(msg) = feed.recv().await {
//!         println!("{msg:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;

pub use client::{OkCoinChannels, OkCoinClient, OkCoinConfig, DEFAULT_WS_URL};
pub use codec::{subscription_args, OkCoinCodec};
