//! Self-healing connection with serialized lifecycle management
//!
//! A [`DurableConnection`] owns one live transport at a time and keeps it
//! alive across failures. All lifecycle transitions run through a single
//! manager action on a [`Scheduler`], so establish/teardown never race.
//!
//! Locking protocol: the async connection mutex is always acquired before
//! the state mutex, and the state mutex is only held for short reads and
//! writes. Callers that need the connection (`lock`) queue behind the
//! manager, so they observe only settled states.
//!
//! Failure paths all converge on the same reconnect request: a write error,
//! a receive error, a peer close, or a reply timeout upstream. Stale
//! notifications from an already-replaced connection are discarded by an
//! epoch check.

use crate::callbacks::CallbackSet;
use crate::codec::{Codec, Connector};
use crate::reader::MessageReader;
use crate::scheduler::Scheduler;
use crate::transport::TransportSink;
use exwire_types::{WireError, WireResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Lifecycle state of a durable connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport, none wanted
    Disconnected,
    /// A transport is wanted; the manager is establishing one
    Connecting,
    /// A live transport is attached
    Connected,
    /// Teardown requested; the manager is disposing the transport
    Disconnecting,
    /// The live transport is being replaced
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunables for the connection lifecycle
#[derive(Debug, Clone)]
pub struct DurableConfig {
    /// Delay before retrying a failed connection attempt
    pub retry_backoff: Duration,
    /// Per-message write timeout
    pub send_timeout: Duration,
    /// Budget for the post-connect handshake
    pub handshake_timeout: Duration,
    /// Default budget for [`DurableConnection::lock`]
    pub lock_timeout: Duration,
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_secs(1),
            send_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(10),
        }
    }
}

impl DurableConfig {
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

/// Handshake hook: runs on the fresh connection before messages flow to the
/// message handler. Messages arriving meanwhile are buffered in the reader.
pub type HandshakeFn<C> = Arc<
    dyn Fn(MessageReader<<C as Codec>::In>, Writer<C>) -> BoxFuture<'static, WireResult<()>>
        + Send
        + Sync,
>;

/// Steady-state message handler: `(message, is_last)` where `is_last` is
/// false only while the handshake backlog is draining.
pub type MessageFn<C> = Arc<dyn Fn(<C as Codec>::In, bool) + Send + Sync>;

/// Send half of a live connection
///
/// Cheap to clone; a clone outliving its connection fails sends with a
/// transport error and its reconnect requests are ignored as stale.
pub struct Writer<C: Codec> {
    sink: Arc<AsyncMutex<Box<dyn TransportSink>>>,
    codec: Arc<C>,
    send_timeout: Duration,
    durable: Weak<Inner<C>>,
    epoch: u64,
}

impl<C: Codec> Clone for Writer<C> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            codec: Arc::clone(&self.codec),
            send_timeout: self.send_timeout,
            durable: Weak::clone(&self.durable),
            epoch: self.epoch,
        }
    }
}

impl<C: Codec> Writer<C> {
    /// Encode and send one request
    pub async fn send(&self, msg: &C::Out) -> WireResult<()> {
        let text = self.codec.encode(msg)?;
        self.send_raw(&text).await
    }

    /// Send pre-encoded wire text
    pub async fn send_raw(&self, text: &str) -> WireResult<()> {
        let mut sink = self.sink.lock().await;
        match timeout(self.send_timeout, sink.send(text)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                drop(sink);
                self.flag_broken();
                Err(WireError::Transport(e.to_string()))
            }
            Err(_) => {
                drop(sink);
                self.flag_broken();
                Err(WireError::Transport(format!(
                    "send timed out after {:?}",
                    self.send_timeout
                )))
            }
        }
    }

    fn flag_broken(&self) {
        if let Some(inner) = self.durable.upgrade() {
            inner.io_error(self.epoch, "write failed");
        }
    }
}

struct Live<C: Codec> {
    writer: Writer<C>,
    reader: MessageReader<C::In>,
    recv_task: JoinHandle<()>,
    epoch: u64,
}

struct Inner<C: Codec> {
    connector: Box<dyn Connector>,
    codec: Arc<C>,
    config: DurableConfig,
    scheduler: Arc<Scheduler>,
    state: Mutex<ConnectionState>,
    state_notify: Notify,
    conn: Arc<AsyncMutex<Option<Live<C>>>>,
    /// Incremented per established transport; stale I/O reports are dropped
    epoch: AtomicU64,
    on_handshake: HandshakeFn<C>,
    on_message: MessageFn<C>,
    connected_callbacks: CallbackSet<()>,
    disconnected_callbacks: CallbackSet<()>,
}

impl<C: Codec> Inner<C> {
    fn schedule_manage(self: &Arc<Self>, delay: Duration) {
        let inner = Arc::clone(self);
        self.scheduler
            .schedule_after(delay, move |_more_ready| inner.manage());
    }

    /// One lifecycle step. Runs only on the scheduler, so at most one step
    /// is in flight at a time.
    async fn manage(self: Arc<Self>) {
        let mut conn = self.conn.clone().lock_owned().await;
        let snapshot = *self.state.lock();

        match snapshot {
            ConnectionState::Disconnected | ConnectionState::Connected => {}
            ConnectionState::Disconnecting => {
                let had_live = conn.is_some();
                Self::dispose_live(&mut conn).await;
                let settled = {
                    let mut state = self.state.lock();
                    if *state == ConnectionState::Disconnecting {
                        *state = ConnectionState::Disconnected;
                        true
                    } else {
                        false
                    }
                };
                self.state_notify.notify_waiters();
                if had_live {
                    self.disconnected_callbacks.emit(&());
                }
                if !settled {
                    // connect() superseded the teardown
                    self.schedule_manage(Duration::ZERO);
                }
            }
            ConnectionState::Reconnecting => {
                let had_live = conn.is_some();
                Self::dispose_live(&mut conn).await;
                {
                    let mut state = self.state.lock();
                    if *state == ConnectionState::Reconnecting {
                        *state = ConnectionState::Connecting;
                    }
                }
                self.state_notify.notify_waiters();
                if had_live {
                    self.disconnected_callbacks.emit(&());
                }
                self.schedule_manage(Duration::ZERO);
            }
            ConnectionState::Connecting => {
                if conn.is_none() {
                    match self.establish().await {
                        Ok(live) => *conn = Some(live),
                        Err(e) => {
                            warn!(error = %e, "connection attempt failed");
                            drop(conn);
                            let still_wanted =
                                *self.state.lock() == ConnectionState::Connecting;
                            let delay = if still_wanted {
                                self.config.retry_backoff
                            } else {
                                Duration::ZERO
                            };
                            self.schedule_manage(delay);
                            return;
                        }
                    }
                }
                let promoted = {
                    let mut state = self.state.lock();
                    if *state == ConnectionState::Connecting {
                        *state = ConnectionState::Connected;
                        true
                    } else {
                        false
                    }
                };
                self.state_notify.notify_waiters();
                if promoted {
                    info!("connection established");
                    self.connected_callbacks.emit(&());
                } else {
                    // state changed mid-handshake; let the next step settle it
                    self.schedule_manage(Duration::ZERO);
                }
            }
        }
    }

    async fn establish(self: &Arc<Self>) -> WireResult<Live<C>> {
        let transport = self.connector.connect().await?;
        let endpoint = transport.endpoint().to_string();
        let (sink, mut stream) = transport
            .split()
            .map_err(|e| WireError::Transport(e.to_string()))?;

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let reader: MessageReader<C::In> = MessageReader::new();
        let sink = Arc::new(AsyncMutex::new(sink));
        let writer = Writer {
            sink: Arc::clone(&sink),
            codec: Arc::clone(&self.codec),
            send_timeout: self.config.send_timeout,
            durable: Arc::downgrade(self),
            epoch,
        };

        let recv_inner = Arc::downgrade(self);
        let recv_reader = reader.clone();
        let recv_codec = Arc::clone(&self.codec);
        let recv_task = tokio::spawn(async move {
            loop {
                match stream.recv().await {
                    Ok(Some(raw)) => match recv_codec.decode(&raw) {
                        Ok(msgs) => {
                            for msg in msgs {
                                if !recv_reader.push(msg) {
                                    return;
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping undecodable frame"),
                    },
                    Ok(None) => {
                        if let Some(inner) = recv_inner.upgrade() {
                            inner.io_error(epoch, "peer closed");
                        }
                        return;
                    }
                    Err(e) => {
                        if let Some(inner) = recv_inner.upgrade() {
                            inner.io_error(epoch, &e.to_string());
                        }
                        return;
                    }
                }
            }
        });

        let handshake = (self.on_handshake)(reader.clone(), writer.clone());
        let handshake_result = match timeout(self.config.handshake_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(WireError::HandshakeTimeout {
                timeout: self.config.handshake_timeout,
            }),
        };
        if let Err(e) = handshake_result {
            recv_task.abort();
            reader.close();
            let _ = timeout(Duration::from_secs(1), async {
                sink.lock().await.close().await
            })
            .await;
            return Err(e);
        }

        let on_message = Arc::clone(&self.on_message);
        reader.attach_sink(Box::new(move |msg, is_last| on_message(msg, is_last)));
        debug!(endpoint = %endpoint, epoch, "handshake complete");

        Ok(Live {
            writer,
            reader,
            recv_task,
            epoch,
        })
    }

    async fn dispose_live(conn: &mut Option<Live<C>>) {
        if let Some(live) = conn.take() {
            live.recv_task.abort();
            live.reader.close();
            let sink = live.writer.sink;
            let _ = timeout(Duration::from_secs(1), async {
                sink.lock().await.close().await
            })
            .await;
            debug!(epoch = live.epoch, "connection disposed");
        }
    }

    /// I/O failure report from a receive task or writer. Ignored unless it
    /// came from the current transport.
    fn io_error(self: &Arc<Self>, epoch: u64, reason: &str) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(epoch, reason, "ignoring stale connection error");
            return;
        }
        warn!(reason, "connection error, scheduling reconnect");
        self.request_reconnect();
    }

    fn request_reconnect(self: &Arc<Self>) {
        let transition = {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Connected | ConnectionState::Connecting => {
                    *state = ConnectionState::Reconnecting;
                    true
                }
                _ => false,
            }
        };
        if transition {
            self.state_notify.notify_waiters();
            self.schedule_manage(Duration::ZERO);
        }
    }
}

/// Exclusive access to a live connection's writer
pub struct ConnectionGuard<C: Codec> {
    _guard: OwnedMutexGuard<Option<Live<C>>>,
    writer: Writer<C>,
}

impl<C: Codec> ConnectionGuard<C> {
    pub fn writer(&self) -> &Writer<C> {
        &self.writer
    }
}

impl<C: Codec> std::fmt::Debug for ConnectionGuard<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard").finish_non_exhaustive()
    }
}

/// A connection that survives transport failures
///
/// Built via [`DurableConnectionBuilder`]. Clones share the connection.
pub struct DurableConnection<C: Codec> {
    inner: Arc<Inner<C>>,
}

impl<C: Codec> Clone for DurableConnection<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Codec> DurableConnection<C> {
    pub fn builder(connector: impl Connector, codec: C) -> DurableConnectionBuilder<C> {
        DurableConnectionBuilder {
            connector: Box::new(connector),
            codec,
            config: DurableConfig::default(),
            on_handshake: None,
            on_message: None,
        }
    }

    /// Request the connected state. Returns immediately; establishment runs
    /// on the manager.
    pub fn connect(&self) {
        let transition = {
            let mut state = self.inner.state.lock();
            match *state {
                ConnectionState::Disconnected => {
                    *state = ConnectionState::Connecting;
                    true
                }
                // Teardown in progress: dispose first, then reconnect
                ConnectionState::Disconnecting => {
                    *state = ConnectionState::Reconnecting;
                    true
                }
                _ => false,
            }
        };
        if transition {
            self.inner.state_notify.notify_waiters();
            self.inner.schedule_manage(Duration::ZERO);
        }
    }

    /// Replace the live transport. No-op unless connected or connecting.
    pub fn reconnect(&self) {
        self.inner.request_reconnect();
    }

    /// Request the disconnected state and wait for teardown to finish.
    pub async fn disconnect(&self) {
        let transition = {
            let mut state = self.inner.state.lock();
            match *state {
                ConnectionState::Disconnected | ConnectionState::Disconnecting => false,
                _ => {
                    *state = ConnectionState::Disconnecting;
                    true
                }
            }
        };
        if transition {
            self.inner.state_notify.notify_waiters();
            self.inner.schedule_manage(Duration::ZERO);
        }
        loop {
            let notified = self.inner.state_notify.notified();
            if *self.inner.state.lock() == ConnectionState::Disconnected {
                return;
            }
            notified.await;
        }
    }

    /// Disconnect and stop the lifecycle manager for good.
    pub async fn dispose(&self) {
        self.disconnect().await;
        self.inner.scheduler.dispose().await;
        // Wake unbounded lock waiters so they observe the disposal
        self.inner.state_notify.notify_waiters();
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// True while the connection is wanted (connecting, connected, or
    /// replacing its transport).
    pub fn connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Reconnecting
        )
    }

    /// True only with a live, handshaken transport attached.
    pub fn is_established(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Register a callback fired after each successful (re)connect.
    pub fn on_connected(&self, f: impl Fn() + Send + Sync + 'static) {
        self.inner.connected_callbacks.add(move |_| f());
    }

    /// Register a callback fired after each teardown of a live transport.
    pub fn on_disconnected(&self, f: impl Fn() + Send + Sync + 'static) {
        self.inner.disconnected_callbacks.add(move |_| f());
    }

    /// Wait for an established connection and lock it for writing.
    pub async fn lock(&self) -> WireResult<ConnectionGuard<C>> {
        self.lock_timeout(self.inner.config.lock_timeout).await
    }

    /// Lock the connection only if it is established right now.
    pub fn try_lock(&self) -> Option<ConnectionGuard<C>> {
        let guard = self.inner.conn.clone().try_lock_owned().ok()?;
        if *self.inner.state.lock() != ConnectionState::Connected {
            return None;
        }
        let writer = guard.as_ref()?.writer.clone();
        Some(ConnectionGuard {
            _guard: guard,
            writer,
        })
    }

    /// [`lock`](Self::lock) with an explicit deadline.
    pub async fn lock_timeout(&self, budget: Duration) -> WireResult<ConnectionGuard<C>> {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let notified = self.inner.state_notify.notified();
            {
                let guard =
                    match tokio::time::timeout_at(deadline, self.inner.conn.clone().lock_owned())
                        .await
                    {
                        Ok(guard) => guard,
                        Err(_) => return Err(WireError::NotConnected),
                    };
                if *self.inner.state.lock() == ConnectionState::Connected {
                    if let Some(live) = guard.as_ref() {
                        let writer = live.writer.clone();
                        return Ok(ConnectionGuard {
                            _guard: guard,
                            writer,
                        });
                    }
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(WireError::NotConnected);
            }
        }
    }

    /// [`lock`](Self::lock) with no deadline.
    ///
    /// Waits as long as it takes for an established connection, including
    /// across reconnects and before the first `connect`. Fails only once
    /// the connection is disposed.
    pub async fn lock_unbounded(&self) -> WireResult<ConnectionGuard<C>> {
        loop {
            let notified = self.inner.state_notify.notified();
            {
                let guard = self.inner.conn.clone().lock_owned().await;
                if *self.inner.state.lock() == ConnectionState::Connected {
                    if let Some(live) = guard.as_ref() {
                        let writer = live.writer.clone();
                        return Ok(ConnectionGuard {
                            _guard: guard,
                            writer,
                        });
                    }
                }
            }
            if self.inner.scheduler.is_disposed() {
                return Err(WireError::NotConnected);
            }
            notified.await;
        }
    }
}

/// Builder for [`DurableConnection`]
pub struct DurableConnectionBuilder<C: Codec> {
    connector: Box<dyn Connector>,
    codec: C,
    config: DurableConfig,
    on_handshake: Option<HandshakeFn<C>>,
    on_message: Option<MessageFn<C>>,
}

impl<C: Codec> DurableConnectionBuilder<C> {
    pub fn with_config(mut self, config: DurableConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the handshake run on every fresh transport.
    pub fn on_handshake<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(MessageReader<C::In>, Writer<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WireResult<()>> + Send + 'static,
    {
        self.on_handshake = Some(Arc::new(move |reader, writer| f(reader, writer).boxed()));
        self
    }

    /// Set the steady-state message handler.
    pub fn on_message(mut self, f: impl Fn(C::In, bool) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> DurableConnection<C> {
        let on_handshake: HandshakeFn<C> = self
            .on_handshake
            .unwrap_or_else(|| Arc::new(|_reader, _writer| futures::future::ok(()).boxed()));
        let on_message: MessageFn<C> =
            self.on_message.unwrap_or_else(|| Arc::new(|_msg, _is_last| {}));

        DurableConnection {
            inner: Arc::new(Inner {
                connector: self.connector,
                codec: Arc::new(self.codec),
                config: self.config,
                scheduler: Scheduler::new("connection"),
                state: Mutex::new(ConnectionState::Disconnected),
                state_notify: Notify::new(),
                conn: Arc::new(AsyncMutex::new(None)),
                epoch: AtomicU64::new(0),
                on_handshake,
                on_message,
                connected_callbacks: CallbackSet::new("connected"),
                disconnected_callbacks: CallbackSet::new("disconnected"),
            }),
        }
    }
}
