//! Transport abstraction over WebSocket connections
//!
//! A [`Transport`] is connected once and then split into independent send
//! and receive halves, so the receive task can own the stream while writers
//! share the sink. [`MockTransport`] scripts both directions for tests
//! without network access.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, instrument};

/// Transport layer errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed by the peer
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Timed out
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Not connected
    #[error("not connected")]
    NotConnected,

    /// Protocol error
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Send half of a split transport
#[async_trait]
pub trait TransportSink: Send {
    /// Send a text message
    async fn send(&mut self, message: &str) -> Result<(), TransportError>;

    /// Close the connection gracefully
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Receive half of a split transport
#[async_trait]
pub trait TransportStream: Send {
    /// Receive a text message
    ///
    /// Returns `None` if the connection was closed gracefully.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;
}

/// A connectable duplex transport
///
/// Implementations connect lazily and are split exactly once; the halves
/// live on separate tasks afterwards.
#[async_trait]
pub trait Transport: Send {
    /// Connect to the endpoint
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Split a connected transport into its send and receive halves
    fn split(
        self: Box<Self>,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), TransportError>;

    /// Endpoint URL
    fn endpoint(&self) -> &str;
}

impl std::fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

// ============================================================================
// WebSocket transport
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Real WebSocket transport using tokio-tungstenite
pub struct WsTransport {
    url: String,
    stream: Option<WsStream>,
    connect_timeout: Duration,
    send_timeout: Duration,
    idle_timeout: Duration,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: None,
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
        }
    }

    /// Set the connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-message send timeout
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set the idle read timeout; a silent feed past this is treated as a
    /// dead connection
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for WsTransport {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn connect(&mut self) -> Result<(), TransportError> {
        debug!("Connecting to WebSocket");

        let (ws_stream, _response) = timeout(self.connect_timeout, connect_async(&self.url))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        self.stream = Some(ws_stream);
        debug!("WebSocket connected");
        Ok(())
    }

    fn split(
        self: Box<Self>,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), TransportError> {
        let stream = self.stream.ok_or(TransportError::NotConnected)?;
        let (sink, stream) = stream.split();
        Ok((
            Box::new(WsSink {
                sink,
                send_timeout: self.send_timeout,
            }),
            Box::new(WsRecv {
                stream,
                idle_timeout: self.idle_timeout,
            }),
        ))
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
    send_timeout: Duration,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        timeout(
            self.send_timeout,
            self.sink.send(Message::Text(message.to_string())),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.send_timeout))?
        .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

struct WsRecv {
    stream: SplitStream<WsStream>,
    idle_timeout: Duration,
}

#[async_trait]
impl TransportStream for WsRecv {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            let frame = timeout(self.idle_timeout, self.stream.next())
                .await
                .map_err(|_| TransportError::Timeout(self.idle_timeout))?;

            match frame {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => {
                    return String::from_utf8(data)
                        .map(Some)
                        .map_err(|e| TransportError::Protocol(e.to_string()));
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Control frames are not messages; keep reading
                Some(Ok(Message::Ping(_)))
                | Some(Ok(Message::Pong(_)))
                | Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
                None => return Err(TransportError::ConnectionClosed),
            }
        }
    }
}

// ============================================================================
// Mock transport
// ============================================================================

type ScriptedFrame = Result<Option<String>, TransportError>;

struct MockShared {
    sent: parking_lot::Mutex<Vec<String>>,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_send: AtomicBool,
    connect_count: parking_lot::Mutex<u32>,
}

/// Mock transport for tests: scripted inbound frames, captured sends
///
/// The paired [`MockHandle`] feeds frames and inspects traffic while the
/// transport is owned by the connection under test.
pub struct MockTransport {
    url: String,
    shared: Arc<MockShared>,
    rx: Option<mpsc::UnboundedReceiver<ScriptedFrame>>,
}

/// Test-side controller for a [`MockTransport`]
#[derive(Clone)]
pub struct MockHandle {
    shared: Arc<MockShared>,
    tx: mpsc::UnboundedSender<ScriptedFrame>,
}

impl MockTransport {
    /// Create a mock transport and its controlling handle
    pub fn new(url: impl Into<String>) -> (Self, MockHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared {
            sent: parking_lot::Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            connect_count: parking_lot::Mutex::new(0),
        });
        (
            Self {
                url: url.into(),
                shared: shared.clone(),
                rx: Some(rx),
            },
            MockHandle { shared, tx },
        )
    }
}

impl MockHandle {
    /// Feed an inbound message
    pub fn push_message(&self, msg: impl Into<String>) {
        let _ = self.tx.send(Ok(Some(msg.into())));
    }

    /// Feed a graceful close
    pub fn push_close(&self) {
        let _ = self.tx.send(Ok(None));
    }

    /// Feed a receive error
    pub fn push_error(&self, error: TransportError) {
        let _ = self.tx.send(Err(error));
    }

    /// Messages captured from the send half
    pub fn sent(&self) -> Vec<String> {
        self.shared.sent.lock().clone()
    }

    /// Take and clear captured messages
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut self.shared.sent.lock())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> u32 {
        *self.shared.connect_count.lock()
    }

    /// Make the next connect attempt fail
    pub fn set_fail_connect(&self, fail: bool) {
        self.shared.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make sends fail
    pub fn set_fail_send(&self, fail: bool) {
        self.shared.fail_send.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        *self.shared.connect_count.lock() += 1;
        if self.shared.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "mock connection failure".into(),
            ));
        }
        self.shared.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn split(
        self: Box<Self>,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), TransportError> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let rx = self.rx.ok_or(TransportError::NotConnected)?;
        Ok((
            Box::new(MockSink {
                shared: self.shared,
            }),
            Box::new(MockRecv { rx }),
        ))
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

struct MockSink {
    shared: Arc<MockShared>,
}

#[async_trait]
impl TransportSink for MockSink {
    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        if self.shared.fail_send.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("mock send failure".into()));
        }
        self.shared.sent.lock().push(message.to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.shared.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MockRecv {
    rx: mpsc::UnboundedReceiver<ScriptedFrame>,
}

#[async_trait]
impl TransportStream for MockRecv {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        match self.rx.recv().await {
            Some(frame) => frame,
            // Handle dropped: behave like a peer close
            None => Ok(None),
        }
    }
}
