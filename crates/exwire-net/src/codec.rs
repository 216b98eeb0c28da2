//! Codec and connector seams
//!
//! A [`Codec`] translates between an exchange's wire text and the typed
//! messages the core routes; a [`Connector`] produces connected transports.
//! Exchange bindings implement both, the core stays exchange-agnostic.

use crate::transport::Transport;
use async_trait::async_trait;
use exwire_types::{WireError, WireResult};

/// Wire translation for one exchange protocol
pub trait Codec: Send + Sync + 'static {
    /// Typed inbound message. Cloneable so the handshake can peek buffered
    /// messages without consuming them.
    type In: Clone + Send + 'static;
    /// Typed outbound request
    type Out: Send + Sync + 'static;

    /// Encode an outbound request as wire text
    fn encode(&self, msg: &Self::Out) -> WireResult<String>;

    /// Decode one wire frame into zero or more inbound messages
    ///
    /// A frame that carries nothing the client routes (exchange chatter)
    /// decodes to an empty vec; a malformed frame is an error.
    fn decode(&self, raw: &str) -> WireResult<Vec<Self::In>>;
}

/// Factory for connected transports
///
/// Called for every connection attempt, including reconnects, so per-attempt
/// concerns (rate limiting the dial, rotating endpoints) live here.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> WireResult<Box<dyn Transport>>;
}

/// Connector that dials a fixed endpoint with a transport factory
pub struct FnConnector<F> {
    factory: F,
}

impl<F, T> FnConnector<F>
where
    F: Fn() -> T + Send + Sync + 'static,
    T: Transport + 'static,
{
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl<F, T> Connector for FnConnector<F>
where
    F: Fn() -> T + Send + Sync + 'static,
    T: Transport + 'static,
{
    async fn connect(&self) -> WireResult<Box<dyn Transport>> {
        let mut transport = (self.factory)();
        let url = transport.endpoint().to_string();
        transport.connect().await.map_err(|e| {
            WireError::ConnectionFailed {
                url,
                reason: e.to_string(),
            }
        })?;
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fn_connector_dials_factory_transport() {
        let handles = Arc::new(Mutex::new(Vec::new()));
        let factory_handles = handles.clone();
        let connector = FnConnector::new(move || {
            let (transport, handle) = MockTransport::new("wss://mock.test");
            factory_handles.lock().push(handle);
            transport
        });

        let transport = connector.connect().await.unwrap();
        assert_eq!(transport.endpoint(), "wss://mock.test");
        assert_eq!(handles.lock().len(), 1);
        assert!(handles.lock()[0].is_connected());
    }

    #[tokio::test]
    async fn test_fn_connector_propagates_failure() {
        let connector = FnConnector::new(|| {
            let (transport, handle) = MockTransport::new("wss://mock.test");
            handle.set_fail_connect(true);
            transport
        });

        let err = connector.connect().await.unwrap_err();
        assert!(matches!(err, WireError::ConnectionFailed { .. }));
        assert!(err.is_retryable());
    }
}
