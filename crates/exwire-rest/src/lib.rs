//! REST client for the exchange's HTTP API
//!
//! The connectivity layer is WebSocket-first; this crate covers what HTTP is
//! still needed for, chiefly the order-level book snapshot that seeds and
//! resyncs the book engine, plus product metadata and authenticated account
//! reads.
//!
//! # Example
//!
//! ```no_run
//! use exwire_rest::RestClient;
//! use exwire_types::Product;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = RestClient::new();
//!     let snapshot = client.get_book_snapshot(&Product::new("BTC-USD")).await?;
//!     println!("snapshot at seq {}", snapshot.seq);
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod types;

pub use auth::Credentials;
pub use client::{ClientConfig, RestClient, DEFAULT_BASE_URL};
pub use error::{RestError, RestResult};
pub use types::{Account, ProductInfo, RawOrderBook, ServerTime, Ticker, Trade};
