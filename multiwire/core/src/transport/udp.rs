//! UDP Transport
//!
//! Datagram carrier. A socket has no per-peer connections, so the whole
//! socket is one channel: every datagram, from any sender, goes through the
//! same [`ChannelContext`] and the sender address travels inside the
//! [`UdpEnvelope`]. Replies are addressed by the envelope, not the context.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::pipeline::{ChannelContext, Outbound, Pipeline, ProtocolHandler, WriteListener};
use crate::protocol::{Protocol, ProtocolRegistry};
use crate::transport::config::TransportConfig;
use crate::transport::idle::{IdleTimer, IdleTracker};
use crate::transport::traits::{
    Client, Connection, ConnectionInfo, RequestStatus, SendError, Server, TransportError,
};
use crate::transport::transfer::{Datagram, TransportProtocolTransfer, UdpEnvelope, UdpTransfer};
use crate::transport::{udp_pipeline, ChannelSettings};

/// Largest UDP payload
const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Transfers that speak datagrams
pub trait DatagramTransfer:
    TransportProtocolTransfer<Inbound = Datagram, Outbound = Datagram>
{
}

impl<T> DatagramTransfer for T where
    T: TransportProtocolTransfer<Inbound = Datagram, Outbound = Datagram>
{
}

// =============================================================================
// Shared Endpoint
// =============================================================================

struct Running<M> {
    ctx: ChannelContext<M>,
    task: JoinHandle<()>,
}

/// Socket plus its channel task, shared by client and server
struct Endpoint<T: DatagramTransfer> {
    pipeline: Pipeline<T>,
    config: TransportConfig,
    running: Mutex<Option<Running<T::Message>>>,
    stopped: AtomicBool,
}

impl<T: DatagramTransfer> Endpoint<T> {
    fn new(config: TransportConfig, pipeline: Pipeline<T>) -> Self {
        Self {
            pipeline,
            config,
            running: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    fn ctx(&self) -> Option<ChannelContext<T::Message>> {
        self.running.lock().as_ref().map(|r| r.ctx.clone())
    }

    fn is_active(&self) -> bool {
        self.ctx().is_some_and(|ctx| ctx.is_active())
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Bind `addr` within the connect timeout and start the channel task
    async fn start(
        &self,
        addr: SocketAddr,
        peer: Option<SocketAddr>,
    ) -> Result<SocketAddr, TransportError> {
        if self.is_stopped() {
            return Err(TransportError::InvalidState("endpoint is closed".to_string()));
        }
        if self.running.lock().is_some() {
            return Err(TransportError::InvalidState("socket is already bound".to_string()));
        }

        let timeout = self.config.connect_timeout();
        let socket = match tokio::time::timeout(timeout, UdpSocket::bind(addr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(match peer {
                    Some(addr) => TransportError::ConnectTimeout { addr, timeout },
                    None => TransportError::BindTimeout { addr, timeout },
                })
            }
        };
        let local_addr = socket.local_addr()?;

        let (ctx, outbound) = ChannelContext::new(ConnectionInfo::new(Some(local_addr), peer));
        ctx.set_active(true);
        let task = tokio::spawn(run_socket(
            Arc::new(socket),
            ctx.clone(),
            outbound,
            self.pipeline.clone(),
            ChannelSettings::from_config(&self.config),
        ));

        let raced = {
            let mut slot = self.running.lock();
            if slot.is_some() || self.is_stopped() {
                Some(Running { ctx, task })
            } else {
                *slot = Some(Running { ctx, task });
                None
            }
        };
        if let Some(running) = raced {
            Self::stop(running).await;
            return Err(TransportError::InvalidState(
                "socket was bound or closed concurrently".to_string(),
            ));
        }
        Ok(local_addr)
    }

    async fn stop(running: Running<T::Message>) {
        running.ctx.close();
        if let Err(e) = running.task.await {
            tracing::warn!(conn_id = %running.ctx.id(), error = %e, "Datagram task failed");
        }
    }

    async fn close(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let running = self.running.lock().take();
        if let Some(running) = running {
            Self::stop(running).await;
        }
    }
}

async fn run_socket<T: DatagramTransfer>(
    socket: Arc<UdpSocket>,
    ctx: ChannelContext<T::Message>,
    outbound: mpsc::UnboundedReceiver<Outbound<T::Message>>,
    pipeline: Pipeline<T>,
    settings: ChannelSettings,
) {
    let tracker = IdleTracker::shared();
    let (fault_tx, mut fault_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel();
    let writer = tokio::spawn(send_loop(
        Arc::clone(&socket),
        outbound,
        ctx.info().clone(),
        Arc::clone(pipeline.transfer()),
        Arc::clone(&tracker),
        fault_tx,
        stop_rx,
    ));

    pipeline.fire_active(&ctx);

    let mut idle = IdleTimer::new(settings.idle, Arc::clone(&tracker));
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            () = ctx.close_requested() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, peer)) => {
                    tracker.record_read();
                    let datagram = Datagram {
                        payload: Bytes::copy_from_slice(&buf[..n]),
                        peer,
                    };
                    pipeline.fire_read(&ctx, datagram);
                }
                Err(e) => {
                    // ICMP unreachable surfaces here on some platforms; the socket is still usable
                    tracing::debug!(conn_id = %ctx.id(), error = %e, "Datagram receive error");
                    pipeline.fire_exception(&ctx, &TransportError::Io(e));
                }
            },
            Some(fault) = fault_rx.recv() => pipeline.fire_exception(&ctx, &fault),
            events = idle.due() => {
                for event in events {
                    pipeline.fire_idle(&ctx, event);
                }
            }
        }
    }

    ctx.set_active(false);
    let _ = stop_tx.send(());
    match writer.await {
        Ok(mut leftover) => {
            leftover.close();
            while let Ok(outbound) = leftover.try_recv() {
                outbound.fail(TransportError::ConnectionClosed);
            }
        }
        Err(e) => tracing::warn!(conn_id = %ctx.id(), error = %e, "Datagram writer failed"),
    }
    pipeline.fire_inactive(&ctx);
}

async fn send_loop<T: DatagramTransfer>(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::UnboundedReceiver<Outbound<T::Message>>,
    info: ConnectionInfo,
    transfer: Arc<T>,
    tracker: Arc<IdleTracker>,
    faults: mpsc::UnboundedSender<TransportError>,
    mut stop: oneshot::Receiver<()>,
) -> mpsc::UnboundedReceiver<Outbound<T::Message>> {
    loop {
        let outbound = tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
            _ = &mut stop => break,
        };
        let datagrams = match transfer.encode(&info, outbound.message()) {
            Ok(datagrams) => datagrams,
            Err(e) => {
                outbound.fail(TransportError::SendFailed(e.to_string()));
                let _ = faults.send(e);
                continue;
            }
        };

        let mut failure = None;
        for datagram in &datagrams {
            if let Err(e) = socket.send_to(&datagram.payload, datagram.peer).await {
                failure = Some(e);
                break;
            }
        }

        match failure {
            None => {
                tracker.record_write();
                outbound.complete();
            }
            Some(e) => {
                tracing::debug!(conn_id = %info.id, error = %e, "Datagram send failed");
                outbound.fail(TransportError::SendFailed(e.to_string()));
                let _ = faults.send(TransportError::Io(e));
            }
        }
    }
    rx
}

// =============================================================================
// Server
// =============================================================================

/// Bound datagram socket answering any sender
pub struct UdpServer<T: DatagramTransfer = UdpTransfer> {
    endpoint: Endpoint<T>,
}

impl UdpServer<UdpTransfer> {
    /// Server speaking enveloped protocol packets
    pub fn socket(
        config: TransportConfig,
        registry: Arc<ProtocolRegistry>,
        handler: Arc<dyn ProtocolHandler<UdpEnvelope>>,
    ) -> Self {
        let pipeline = udp_pipeline(&config, registry, handler);
        Self::new(config, pipeline)
    }
}

impl<T: DatagramTransfer> UdpServer<T> {
    /// Server over any datagram transfer
    pub fn new(config: TransportConfig, pipeline: Pipeline<T>) -> Self {
        Self {
            endpoint: Endpoint::new(config, pipeline),
        }
    }

    /// The socket's channel, for sends outside callbacks
    pub fn channel(&self) -> Option<ChannelContext<T::Message>> {
        self.endpoint.ctx()
    }
}

#[async_trait]
impl<T: DatagramTransfer> Connection for UdpServer<T> {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.ctx().and_then(|ctx| ctx.local_addr())
    }

    fn is_active(&self) -> bool {
        self.endpoint.is_active()
    }

    fn is_stopped(&self) -> bool {
        self.endpoint.is_stopped()
    }

    async fn close(&self) {
        self.endpoint.close().await;
        tracing::debug!("UDP server closed");
    }
}

#[async_trait]
impl<T: DatagramTransfer> Server for UdpServer<T> {
    async fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        let local_addr = self.endpoint.start(addr, None).await?;
        tracing::info!(%local_addr, "UDP server listening");
        Ok(local_addr)
    }
}

// =============================================================================
// Client
// =============================================================================

/// Ephemeral datagram socket talking to one remote address
///
/// `connect` binds a local socket of the remote's address family; UDP has no
/// handshake, so it succeeds as soon as the socket exists.
pub struct UdpClient<T: DatagramTransfer = UdpTransfer> {
    endpoint: Endpoint<T>,
}

impl UdpClient<UdpTransfer> {
    /// Client speaking enveloped protocol packets
    pub fn socket(
        config: TransportConfig,
        registry: Arc<ProtocolRegistry>,
        handler: Arc<dyn ProtocolHandler<UdpEnvelope>>,
    ) -> Self {
        let pipeline = udp_pipeline(&config, registry, handler);
        Self::new(config, pipeline)
    }

    /// Send `protocol` to the connected remote
    ///
    /// # Errors
    ///
    /// Returns the message when the client is not connected.
    pub fn send(
        &self,
        protocol: Box<dyn Protocol>,
    ) -> Result<RequestStatus, SendError<Box<dyn Protocol>>> {
        match self.remote_addr() {
            Some(peer) => self
                .request(UdpEnvelope::new(protocol, peer))
                .map_err(|e| SendError::Inactive(e.into_inner().protocol)),
            None => Err(SendError::Inactive(protocol)),
        }
    }
}

impl<T: DatagramTransfer> UdpClient<T> {
    /// Client over any datagram transfer
    pub fn new(config: TransportConfig, pipeline: Pipeline<T>) -> Self {
        Self {
            endpoint: Endpoint::new(config, pipeline),
        }
    }
}

#[async_trait]
impl<T: DatagramTransfer> Connection for UdpClient<T> {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.ctx().and_then(|ctx| ctx.local_addr())
    }

    fn is_active(&self) -> bool {
        self.endpoint.is_active()
    }

    fn is_stopped(&self) -> bool {
        self.endpoint.is_stopped()
    }

    async fn close(&self) {
        self.endpoint.close().await;
        tracing::debug!("UDP client closed");
    }
}

#[async_trait]
impl<T: DatagramTransfer> Client<T::Message> for UdpClient<T> {
    async fn connect(&self, addr: SocketAddr) -> Result<(), TransportError> {
        if self.is_active() {
            return Ok(());
        }
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let local_addr = self.endpoint.start(local, Some(addr)).await?;
        tracing::debug!(%local_addr, remote = %addr, "UDP client ready");
        Ok(())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.endpoint.ctx().and_then(|ctx| ctx.peer_addr())
    }

    fn request(&self, message: T::Message) -> Result<RequestStatus, SendError<T::Message>> {
        match self.endpoint.ctx() {
            Some(ctx) => ctx.send(message).map(|()| RequestStatus::Queued),
            None => Err(SendError::Inactive(message)),
        }
    }

    fn request_with_listener(
        &self,
        message: T::Message,
        listener: WriteListener<T::Message>,
    ) -> Result<RequestStatus, SendError<T::Message>> {
        match self.endpoint.ctx() {
            Some(ctx) => ctx
                .send_with_listener(message, listener)
                .map(|()| RequestStatus::Queued),
            None => Err(SendError::Inactive(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::HandlerResult;
    use crate::protocol::{ProtocolError, ProtocolReader, ProtocolType, ProtocolWriter};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedSender;

    #[derive(Debug, Default)]
    struct Echo {
        seq: u32,
    }

    impl Protocol for Echo {
        fn protocol_id(&self) -> u32 {
            Self::ID
        }

        fn read(&mut self, reader: &mut ProtocolReader) -> Result<(), ProtocolError> {
            self.seq = reader.read_u32()?;
            Ok(())
        }

        fn write(&self, writer: &mut ProtocolWriter) {
            writer.write_u32(self.seq);
        }
    }

    impl ProtocolType for Echo {
        const ID: u32 = 71;
    }

    /// Replies to every envelope with seq + 1
    struct Replier;

    impl ProtocolHandler<UdpEnvelope> for Replier {
        fn handle(
            &self,
            ctx: &ChannelContext<UdpEnvelope>,
            message: UdpEnvelope,
        ) -> HandlerResult {
            let seq = message
                .protocol
                .downcast_ref::<Echo>()
                .map_or(0, |echo| echo.seq);
            let _ = ctx.send(message.reply(Box::new(Echo { seq: seq + 1 })));
            Ok(())
        }
    }

    struct Collect(UnboundedSender<(u32, SocketAddr)>);

    impl ProtocolHandler<UdpEnvelope> for Collect {
        fn handle(
            &self,
            _ctx: &ChannelContext<UdpEnvelope>,
            message: UdpEnvelope,
        ) -> HandlerResult {
            if let Some(echo) = message.protocol.downcast_ref::<Echo>() {
                let _ = self.0.send((echo.seq, message.peer));
            }
            Ok(())
        }
    }

    fn registry() -> Arc<ProtocolRegistry> {
        ProtocolRegistry::new()
            .with_type::<Echo>()
            .unwrap()
            .into_shared()
    }

    #[tokio::test]
    async fn test_reply_reaches_sender() {
        let server = UdpServer::socket(
            TransportConfig::for_testing(),
            registry(),
            Arc::new(Replier),
        );
        let server_addr = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = UdpClient::socket(
            TransportConfig::for_testing(),
            registry(),
            Arc::new(Collect(tx)),
        );
        client.connect(server_addr).await.unwrap();
        assert_eq!(client.remote_addr(), Some(server_addr));

        client.send(Box::new(Echo { seq: 41 })).unwrap();

        let (seq, from) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seq, 42);
        assert_eq!(from, server_addr);

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn test_send_before_connect_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = UdpClient::socket(
            TransportConfig::for_testing(),
            registry(),
            Arc::new(Collect(tx)),
        );
        assert!(matches!(
            client.send(Box::new(Echo::default())),
            Err(SendError::Inactive(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let server = UdpServer::socket(
            TransportConfig::for_testing(),
            registry(),
            Arc::new(Replier),
        );
        server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(server.is_active());

        server.close().await;
        server.close().await;
        assert!(!server.is_active());
        assert!(server.is_stopped());
        assert!(matches!(
            server.bind("127.0.0.1:0".parse().unwrap()).await,
            Err(TransportError::InvalidState(_))
        ));
    }
}
