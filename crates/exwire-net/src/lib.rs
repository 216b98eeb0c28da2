//! Exchange connectivity core
//!
//! Everything exchange-agnostic about keeping a market-data connection
//! alive and correlated lives here:
//!
//! - [`transport`]: WebSocket transport behind a trait, split into send and
//!   receive halves, with a scripted mock for tests
//! - [`codec`]: the [`Codec`]/[`Connector`] seams exchange bindings implement
//! - [`durable`]: [`DurableConnection`], a self-healing connection whose
//!   lifecycle runs serialized on a [`Scheduler`]
//! - [`reader`]: handshake-phase message buffering with peek/skip/consume
//! - [`scheduled_queue`] / [`scheduler`]: time-ordered work queue and the
//!   serialized executor built on it
//! - [`turnstile`] / [`gateway`]: request/reply correlation, single-inflight
//!   and per-channel respectively
//! - [`rate_limiter`] / [`periodic`]: pacing and fixed-cadence upkeep
//!
//! Exchange bindings (`exwire-coinbase`, `exwire-okcoin`) supply a codec, a
//! connector, and a handshake; the rest is shared.

pub mod callbacks;
pub mod codec;
pub mod durable;
pub mod gateway;
pub mod periodic;
pub mod rate_limiter;
pub mod reader;
pub mod scheduled_queue;
pub mod scheduler;
pub mod transport;
pub mod turnstile;

pub use callbacks::CallbackSet;
pub use codec::{Codec, Connector, FnConnector};
pub use durable::{
    ConnectionGuard, ConnectionState, DurableConfig, DurableConnection,
    DurableConnectionBuilder, Writer,
};
pub use gateway::{ChannelMap, Gateway};
pub use periodic::PeriodicAction;
pub use rate_limiter::RateLimiter;
pub use reader::MessageReader;
pub use scheduled_queue::ScheduledQueue;
pub use scheduler::Scheduler;
pub use transport::{
    MockHandle, MockTransport, Transport, TransportError, TransportSink, TransportStream,
    WsTransport,
};
pub use turnstile::{DoneFn, Turnstile, TurnstileConfig};

/// Re-exported error types, for convenience at the call sites
pub use exwire_types::{WireError, WireResult};
