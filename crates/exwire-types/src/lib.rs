//! Shared types for the exwire connectivity stack
//!
//! This crate provides the core type definitions used across the exwire
//! workspace. It has minimal dependencies and can be used independently.
//!
//! # Key Types
//!
//! - [`Product`] - Trading pair identifiers (e.g., "BTC-USD")
//! - [`PriceLevel`] - Orderbook price level with decimal precision
//! - [`Side`], [`StreamKind`], [`OrderKind`] - Market enums
//! - [`FeedMessage`] - Parsed inbound feed message
//! - [`WireError`] - Error types shared by the connectivity layers
//! - [`TokenBucket`], [`RateLimitConfig`] - Client-side rate limiting

pub mod enums;
pub mod error;
pub mod level;
pub mod messages;
pub mod product;
pub mod rate_limit;

// Re-export commonly used types
pub use enums::*;
pub use error::*;
pub use level::*;
pub use messages::*;
pub use product::*;
pub use rate_limit::*;

// Re-export rust_decimal for users
pub use rust_decimal::Decimal;
