//! Error types shared by the connectivity layers

use std::time::Duration;
use thiserror::Error;

/// Main error type for wire-level operations
#[derive(Error, Debug)]
pub enum WireError {
    // === Connection Errors ===
    /// Failed to establish a transport connection
    #[error("Failed to connect to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// Connection attempt timed out
    #[error("Connection timeout after {timeout:?} to {url}")]
    ConnectionTimeout { url: String, timeout: Duration },

    /// Transport-level failure on an established connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation requires a live connection
    #[error("Not connected")]
    NotConnected,

    // === Protocol Errors ===
    /// Failed to parse an inbound message
    #[error("Invalid message: {message}")]
    InvalidMessage {
        message: String,
        raw: Option<String>,
    },

    /// Exchange rejected a subscribe/unsubscribe request
    #[error("Subscription rejected for {channel}: {reason}")]
    SubscriptionRejected { channel: String, reason: String },

    /// Handshake did not complete within the allotted time
    #[error("Handshake timeout after {timeout:?}")]
    HandshakeTimeout { timeout: Duration },

    // === Correlation Errors ===
    /// A request was abandoned because no reply arrived in time
    #[error("Reply timeout after {timeout:?} on channel {channel}")]
    ReplyTimeout { channel: String, timeout: Duration },

    /// The logical channel already has an outstanding request
    #[error("Channel busy: {channel}")]
    ChannelBusy { channel: String },

    // === Internal Errors ===
    /// The component is shutting down
    #[error("Shutdown in progress")]
    ShuttingDown,

    /// Invalid state for the requested operation
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },
}

impl WireError {
    /// Returns true if this error is recovered by reconnecting
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::ConnectionFailed { .. } | Self::ReplyTimeout { .. }
        )
    }

    /// Returns true if this error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. }
                | Self::ConnectionTimeout { .. }
                | Self::Transport(_)
                | Self::ReplyTimeout { .. }
                | Self::NotConnected
        )
    }
}

/// Result type alias for wire-level operations
pub type WireResult<T> = Result<T, WireError>;
