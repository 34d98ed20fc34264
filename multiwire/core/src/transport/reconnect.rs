//! Reconnecting Client
//!
//! A [`Client`] that survives connection loss. It wraps fresh underlying
//! clients made by a [`ClientConnector`] and keeps unsent messages in a
//! bounded replay buffer until the next connection comes up.
//!
//! # States
//!
//! ```text
//!                connect(addr)
//!  Disconnected ─────────────▶ Connecting ──ok──▶ Active
//!                                  │                │ channel_inactive
//!                                  │ err            ▼ (reconnect now)
//!                                  └──────▶ AwaitingRetry ──delay──▶ Connecting
//!
//!  any state ──close──▶ Stopped
//! ```
//!
//! # Durability
//!
//! - `request` delegates to the live client while the buffer is empty.
//! - Otherwise, or when the live client rejects the message, it is buffered.
//! - A write that fails after acceptance comes back through its write
//!   listener and is buffered again, ahead of anything submitted after it.
//! - On activation the buffer drains in submission order before the
//!   application's own `channel_active` runs.
//!
//! When the buffer is full the new message is rejected with
//! [`SendError::BufferFull`]; buffered messages are kept.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Sleep;

use crate::pipeline::{ChannelContext, HandlerResult, ProtocolHandler, WriteFailure, WriteListener};
use crate::protocol::{Protocol, ProtocolRegistry};
use crate::transport::config::TransportConfig;
use crate::transport::tcp::TcpClient;
use crate::transport::traits::{Client, Connection, RequestStatus, SendError, TransportError};
use crate::transport::transfer::UdpEnvelope;
use crate::transport::udp::UdpClient;

/// Makes connected clients for a [`ReconnectClient`]
#[async_trait]
pub trait ClientConnector<M: Send + 'static>: Send + Sync + 'static {
    /// Create a client driven by `handler` and connect it to `addr`
    ///
    /// # Errors
    ///
    /// Returns the connect error; the reconnecting client retries it.
    async fn connect(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn ProtocolHandler<M>>,
    ) -> Result<Arc<dyn Client<M>>, TransportError>;
}

enum Command {
    ScheduleRetry,
    ReconnectNow,
    Stop,
}

struct Pending<M> {
    /// Submission order, kept across re-buffering
    seq: u64,
    message: M,
    listener: Option<WriteListener<M>>,
}

struct Inner<M: Send + 'static> {
    connector: Arc<dyn ClientConnector<M>>,
    handler: Arc<dyn ProtocolHandler<M>>,
    delay: Duration,
    capacity: usize,
    client: Mutex<Option<Arc<dyn Client<M>>>>,
    address: Mutex<Option<SocketAddr>>,
    buffer: Mutex<VecDeque<Pending<M>>>,
    next_seq: AtomicU64,
    stopped: AtomicBool,
    commands: mpsc::UnboundedSender<Command>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    attempt_lock: tokio::sync::Mutex<()>,
}

/// Client that reconnects after a fixed delay and replays unsent messages
pub struct ReconnectClient<M: Send + 'static> {
    inner: Arc<Inner<M>>,
}

impl<M: Send + 'static> fmt::Debug for ReconnectClient<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectClient")
            .field("address", &*self.inner.address.lock())
            .field("active", &self.is_active())
            .field("stopped", &self.is_stopped())
            .field("buffered", &self.buffered())
            .finish()
    }
}

impl ReconnectClient<Box<dyn Protocol>> {
    /// Reconnecting TCP client speaking framed protocol packets
    pub fn tcp(
        config: TransportConfig,
        registry: Arc<ProtocolRegistry>,
        handler: Arc<dyn ProtocolHandler<Box<dyn Protocol>>>,
    ) -> Self {
        let connector = Arc::new(TcpConnector::new(config.clone(), registry));
        Self::new(&config, connector, handler)
    }
}

impl<M: Send + 'static> ReconnectClient<M> {
    /// Wrap `handler` and create clients through `connector`
    ///
    /// Delay and replay capacity come from `config`.
    pub fn new(
        config: &TransportConfig,
        connector: Arc<dyn ClientConnector<M>>,
        handler: Arc<dyn ProtocolHandler<M>>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|weak: &Weak<Inner<M>>| Inner {
            connector,
            handler: Arc::new(ReconnectHandler {
                inner: weak.clone(),
                delegate: handler,
            }),
            delay: config.reconnect_delay(),
            capacity: config.replay_buffer_capacity,
            client: Mutex::new(None),
            address: Mutex::new(None),
            buffer: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            commands,
            command_rx: Mutex::new(Some(command_rx)),
            supervisor: Mutex::new(None),
            attempt_lock: tokio::sync::Mutex::new(()),
        });
        Self { inner }
    }

    /// Messages waiting in the replay buffer
    pub fn buffered(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    /// Last address passed to `connect`
    pub fn address(&self) -> Option<SocketAddr> {
        *self.inner.address.lock()
    }
}

impl<M: Send + 'static> Inner<M> {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn live_client(&self) -> Option<Arc<dyn Client<M>>> {
        self.client.lock().clone()
    }

    fn is_active(&self) -> bool {
        self.live_client().is_some_and(|client| client.is_active())
    }

    fn command(&self, command: Command) {
        // Fails only once the supervisor has stopped
        let _ = self.commands.send(command);
    }

    fn ensure_supervisor(self: &Arc<Self>) {
        let Some(commands) = self.command_rx.lock().take() else {
            return;
        };
        let task = tokio::spawn(supervise(Arc::downgrade(self), commands, self.delay));
        *self.supervisor.lock() = Some(task);
    }

    /// Connect once and install the client on success
    async fn attempt(self: &Arc<Self>, addr: SocketAddr) -> Result<(), TransportError> {
        let _guard = self.attempt_lock.lock().await;
        if self.is_stopped() {
            return Err(TransportError::InvalidState("client is closed".to_string()));
        }
        if self.is_active() {
            tracing::debug!(%addr, "Already active, skipping connect attempt");
            return Ok(());
        }

        let client = self.connector.connect(addr, Arc::clone(&self.handler)).await?;
        if self.is_stopped() {
            client.close().await;
            return Err(TransportError::InvalidState("client is closed".to_string()));
        }

        let previous = self.client.lock().replace(Arc::clone(&client));
        if let Some(previous) = previous {
            previous.close().await;
        }
        tracing::info!(%addr, "Reconnecting client connected");

        // Requests made between activation and install were buffered
        self.drain(|message, listener| {
            client
                .request_with_listener(message, listener)
                .map(|_| ())
                .map_err(SendError::into_inner)
        });
        Ok(())
    }

    /// Send the whole buffer in order through `send`
    ///
    /// Stops at the first rejection and keeps the rest.
    fn drain<F>(self: &Arc<Self>, send: F)
    where
        F: Fn(M, WriteListener<M>) -> Result<(), M>,
    {
        let mut buffer = self.buffer.lock();
        let mut sent = 0usize;
        while let Some(Pending {
            seq,
            message,
            listener,
        }) = buffer.pop_front()
        {
            let slot = self.listener_slot(seq);
            match send(message, slot.wrap(listener)) {
                Ok(()) => sent += 1,
                Err(message) => {
                    // The wrapped listener was dropped along with the rejected send
                    buffer.push_front(Pending {
                        seq,
                        message,
                        listener: slot.recover(),
                    });
                    break;
                }
            }
        }
        if sent > 0 {
            tracing::debug!(sent, remaining = buffer.len(), "Replayed buffered messages");
        }
    }

    fn listener_slot(self: &Arc<Self>, seq: u64) -> ListenerSlot<M> {
        ListenerSlot {
            inner: Arc::downgrade(self),
            seq,
            kept: Arc::new(Mutex::new(None)),
        }
    }

    fn push_locked(
        &self,
        buffer: &mut VecDeque<Pending<M>>,
        pending: Pending<M>,
    ) -> Result<RequestStatus, SendError<M>> {
        if buffer.len() >= self.capacity {
            tracing::warn!(capacity = self.capacity, "Replay buffer full, rejecting message");
            return Err(SendError::BufferFull(pending.message));
        }
        buffer.push_back(pending);
        Ok(RequestStatus::Buffered)
    }

    /// A write failed after acceptance; keep the message for the next connection
    ///
    /// The message goes back in submission order, so it replays before
    /// anything that was requested after it.
    fn rebuffer(&self, seq: u64, failure: WriteFailure<M>, listener: Option<WriteListener<M>>) {
        let mut buffer = self.buffer.lock();
        if buffer.len() < self.capacity {
            tracing::debug!(error = %failure.error, "Write failed, buffering for replay");
            let at = buffer.partition_point(|pending| pending.seq < seq);
            buffer.insert(
                at,
                Pending {
                    seq,
                    message: failure.message,
                    listener,
                },
            );
            return;
        }
        drop(buffer);

        tracing::warn!(
            capacity = self.capacity,
            error = %failure.error,
            "Replay buffer full, dropping failed write"
        );
        if let Some(listener) = listener {
            listener(Err(WriteFailure {
                message: failure.message,
                error: TransportError::ReplayBufferFull {
                    capacity: self.capacity,
                },
            }));
        }
    }

    fn request(
        self: &Arc<Self>,
        message: M,
        listener: Option<WriteListener<M>>,
    ) -> Result<RequestStatus, SendError<M>> {
        if self.is_stopped() {
            return Err(SendError::Inactive(message));
        }

        let mut buffer = self.buffer.lock();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut pending = Pending {
            seq,
            message,
            listener,
        };
        if buffer.is_empty() {
            if let Some(client) = self.live_client() {
                let slot = self.listener_slot(seq);
                match client.request_with_listener(pending.message, slot.wrap(pending.listener)) {
                    Ok(status) => return Ok(status),
                    Err(rejected) => {
                        pending = Pending {
                            seq,
                            message: rejected.into_inner(),
                            listener: slot.recover(),
                        };
                    }
                }
            }
        }
        self.push_locked(&mut buffer, pending)
    }
}

/// Write listener that re-buffers failed writes
///
/// The caller's own listener is parked in `kept` so it can be recovered when
/// the send is rejected outright and the wrapper is dropped uncalled.
struct ListenerSlot<M: Send + 'static> {
    inner: Weak<Inner<M>>,
    seq: u64,
    kept: Arc<Mutex<Option<WriteListener<M>>>>,
}

impl<M: Send + 'static> ListenerSlot<M> {
    fn wrap(&self, user: Option<WriteListener<M>>) -> WriteListener<M> {
        *self.kept.lock() = user;
        let inner = self.inner.clone();
        let seq = self.seq;
        let kept = Arc::clone(&self.kept);
        Box::new(move |result: Result<(), WriteFailure<M>>| {
            let user = kept.lock().take();
            match result {
                Ok(()) => {
                    if let Some(user) = user {
                        user(Ok(()));
                    }
                }
                Err(failure) => match inner.upgrade() {
                    Some(inner) if !inner.is_stopped() => inner.rebuffer(seq, failure, user),
                    _ => {
                        if let Some(user) = user {
                            user(Err(failure));
                        }
                    }
                },
            }
        })
    }

    fn recover(&self) -> Option<WriteListener<M>> {
        self.kept.lock().take()
    }
}

async fn supervise<M: Send + 'static>(
    inner: Weak<Inner<M>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    delay: Duration,
) {
    let mut retry: Option<Pin<Box<Sleep>>> = None;

    loop {
        let fire = tokio::select! {
            command = commands.recv() => match command {
                None | Some(Command::Stop) => break,
                Some(Command::ScheduleRetry) => {
                    if retry.is_none() {
                        retry = Some(Box::pin(tokio::time::sleep(delay)));
                    }
                    false
                }
                Some(Command::ReconnectNow) => {
                    retry = None;
                    true
                }
            },
            () = async {
                match retry.as_mut() {
                    Some(sleep) => sleep.await,
                    None => std::future::pending().await,
                }
            } => {
                retry = None;
                true
            }
        };
        if !fire {
            continue;
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        let Some(addr) = *inner.address.lock() else {
            continue;
        };
        if inner.is_stopped() {
            break;
        }
        if let Err(e) = inner.attempt(addr).await {
            if inner.is_stopped() {
                break;
            }
            tracing::warn!(
                %addr,
                error = %e,
                delay_ms = delay.as_millis() as u64,
                "Reconnect failed, retrying"
            );
            inner.command(Command::ScheduleRetry);
        }
    }
    tracing::debug!("Reconnect supervisor stopped");
}

#[async_trait]
impl<M: Send + 'static> Connection for ReconnectClient<M> {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.live_client().and_then(|client| client.local_addr())
    }

    fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    async fn close(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.command(Command::Stop);

        let supervisor = self.inner.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                tracing::warn!(error = %e, "Reconnect supervisor failed");
            }
        }

        let client = self.inner.client.lock().take();
        if let Some(client) = client {
            client.close().await;
        }

        let dropped: Vec<_> = self.inner.buffer.lock().drain(..).collect();
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "Discarding buffered messages on close");
        }
        for pending in dropped {
            if let Some(listener) = pending.listener {
                listener(Err(WriteFailure {
                    message: pending.message,
                    error: TransportError::ConnectionClosed,
                }));
            }
        }
        tracing::debug!("Reconnecting client closed");
    }
}

#[async_trait]
impl<M: Send + 'static> Client<M> for ReconnectClient<M> {
    async fn connect(&self, addr: SocketAddr) -> Result<(), TransportError> {
        if self.is_stopped() {
            return Err(TransportError::InvalidState("client is closed".to_string()));
        }
        *self.inner.address.lock() = Some(addr);
        self.inner.ensure_supervisor();

        match self.inner.attempt(addr).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if !self.is_stopped() {
                    tracing::warn!(%addr, error = %e, "Connect failed, scheduling retry");
                    self.inner.command(Command::ScheduleRetry);
                }
                Err(e)
            }
        }
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.live_client().and_then(|client| client.remote_addr())
    }

    fn request(&self, message: M) -> Result<RequestStatus, SendError<M>> {
        self.inner.request(message, None)
    }

    fn request_with_listener(
        &self,
        message: M,
        listener: WriteListener<M>,
    ) -> Result<RequestStatus, SendError<M>> {
        self.inner.request(message, Some(listener))
    }
}

// =============================================================================
// Decorated Handler
// =============================================================================

/// Application handler plus buffer replay and reconnect triggers
struct ReconnectHandler<M: Send + 'static> {
    inner: Weak<Inner<M>>,
    delegate: Arc<dyn ProtocolHandler<M>>,
}

impl<M: Send + 'static> ProtocolHandler<M> for ReconnectHandler<M> {
    fn handle(&self, ctx: &ChannelContext<M>, message: M) -> HandlerResult {
        self.delegate.handle(ctx, message)
    }

    fn channel_active(&self, ctx: &ChannelContext<M>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.drain(|message, listener| {
                ctx.send_with_listener(message, listener)
                    .map_err(SendError::into_inner)
            });
        }
        self.delegate.channel_active(ctx);
    }

    fn channel_inactive(&self, ctx: &ChannelContext<M>) {
        self.delegate.channel_inactive(ctx);
        if let Some(inner) = self.inner.upgrade() {
            if !inner.is_stopped() {
                tracing::debug!(conn_id = %ctx.id(), "Connection lost, reconnecting");
                inner.command(Command::ReconnectNow);
            }
        }
    }

    fn handle_exception(&self, ctx: &ChannelContext<M>, cause: &TransportError) {
        self.delegate.handle_exception(ctx, cause);
    }

    fn rate_limit_reject(&self, ctx: &ChannelContext<M>, message: M) {
        self.delegate.rate_limit_reject(ctx, message);
    }

    fn global_rate_limit_reject(&self, ctx: &ChannelContext<M>) {
        self.delegate.global_rate_limit_reject(ctx);
    }

    fn read_idle(&self, ctx: &ChannelContext<M>) {
        self.delegate.read_idle(ctx);
    }

    fn write_idle(&self, ctx: &ChannelContext<M>) {
        self.delegate.write_idle(ctx);
    }

    fn read_write_idle(&self, ctx: &ChannelContext<M>) {
        self.delegate.read_write_idle(ctx);
    }
}

// =============================================================================
// Connectors
// =============================================================================

/// Connects [`TcpClient`]s speaking framed protocol packets
#[derive(Clone, Debug)]
pub struct TcpConnector {
    config: TransportConfig,
    registry: Arc<ProtocolRegistry>,
}

impl TcpConnector {
    /// Connector sharing one registry across attempts
    pub fn new(config: TransportConfig, registry: Arc<ProtocolRegistry>) -> Self {
        Self { config, registry }
    }
}

#[async_trait]
impl ClientConnector<Box<dyn Protocol>> for TcpConnector {
    async fn connect(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn ProtocolHandler<Box<dyn Protocol>>>,
    ) -> Result<Arc<dyn Client<Box<dyn Protocol>>>, TransportError> {
        let client = TcpClient::socket(self.config.clone(), Arc::clone(&self.registry), handler);
        client.connect(addr).await?;
        Ok(Arc::new(client))
    }
}

/// Connects [`UdpClient`]s speaking enveloped protocol packets
#[derive(Clone, Debug)]
pub struct UdpConnector {
    config: TransportConfig,
    registry: Arc<ProtocolRegistry>,
}

impl UdpConnector {
    /// Connector sharing one registry across attempts
    pub fn new(config: TransportConfig, registry: Arc<ProtocolRegistry>) -> Self {
        Self { config, registry }
    }
}

#[async_trait]
impl ClientConnector<UdpEnvelope> for UdpConnector {
    async fn connect(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn ProtocolHandler<UdpEnvelope>>,
    ) -> Result<Arc<dyn Client<UdpEnvelope>>, TransportError> {
        let client = UdpClient::socket(self.config.clone(), Arc::clone(&self.registry), handler);
        client.connect(addr).await?;
        Ok(Arc::new(client))
    }
}
