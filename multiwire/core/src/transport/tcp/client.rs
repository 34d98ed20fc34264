//! TCP Client Transport
//!
//! One outbound stream connection driven through a [`Pipeline`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use super::connection::{PendingStream, StreamTransfer};
use crate::pipeline::{ChannelContext, Pipeline, ProtocolHandler, WriteListener};
use crate::protocol::{Protocol, ProtocolRegistry};
use crate::transport::config::TransportConfig;
use crate::transport::traits::{Client, Connection, RequestStatus, SendError, TransportError};
use crate::transport::transfer::SocketTransfer;
use crate::transport::{socket_pipeline, ChannelSettings};

struct LiveStream<M> {
    ctx: ChannelContext<M>,
    task: JoinHandle<()>,
}

/// Client side of a TCP carrier
pub struct TcpClient<T: StreamTransfer> {
    pipeline: Pipeline<T>,
    config: TransportConfig,
    live: Mutex<Option<LiveStream<T::Message>>>,
    stopped: AtomicBool,
}

impl TcpClient<SocketTransfer> {
    /// Client speaking framed protocol packets
    pub fn socket(
        config: TransportConfig,
        registry: Arc<ProtocolRegistry>,
        handler: Arc<dyn ProtocolHandler<Box<dyn Protocol>>>,
    ) -> Self {
        let pipeline = socket_pipeline(&config, registry, handler);
        Self::new(config, pipeline)
    }
}

impl<T: StreamTransfer> TcpClient<T> {
    /// Client over any packet-bytes transfer
    pub fn new(config: TransportConfig, pipeline: Pipeline<T>) -> Self {
        Self {
            pipeline,
            config,
            live: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    fn current_ctx(&self) -> Option<ChannelContext<T::Message>> {
        self.live.lock().as_ref().map(|live| live.ctx.clone())
    }

    async fn shutdown_live(live: LiveStream<T::Message>) {
        live.ctx.close();
        if let Err(e) = live.task.await {
            tracing::warn!(conn_id = %live.ctx.id(), error = %e, "Connection task failed");
        }
    }
}

#[async_trait]
impl<T: StreamTransfer> Connection for TcpClient<T> {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.current_ctx().and_then(|ctx| ctx.local_addr())
    }

    fn is_active(&self) -> bool {
        self.current_ctx().is_some_and(|ctx| ctx.is_active())
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let live = self.live.lock().take();
        if let Some(live) = live {
            Self::shutdown_live(live).await;
        }
        tracing::debug!("TCP client closed");
    }
}

#[async_trait]
impl<T: StreamTransfer> Client<T::Message> for TcpClient<T> {
    async fn connect(&self, addr: SocketAddr) -> Result<(), TransportError> {
        if self.is_stopped() {
            return Err(TransportError::InvalidState("client is closed".to_string()));
        }
        if self.is_active() {
            tracing::debug!(%addr, "Already connected, ignoring connect");
            return Ok(());
        }

        let timeout = self.config.connect_timeout();
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::ConnectionFailed(format!(
                    "failed to connect to {addr}: {e}"
                )))
            }
            Err(_) => return Err(TransportError::ConnectTimeout { addr, timeout }),
        };

        let pending = PendingStream::new(
            stream,
            self.pipeline.clone(),
            ChannelSettings::from_config(&self.config),
        )?;
        let ctx = pending.ctx().clone();
        let task = pending.spawn(|| {});
        tracing::debug!(conn_id = %ctx.id(), %addr, "TCP client connected");

        let previous = self.live.lock().replace(LiveStream { ctx, task });
        if let Some(previous) = previous {
            previous.ctx.close();
        }

        // close() may have run while we were connecting
        if self.is_stopped() {
            let live = self.live.lock().take();
            if let Some(live) = live {
                Self::shutdown_live(live).await;
            }
            return Err(TransportError::InvalidState("client is closed".to_string()));
        }
        Ok(())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.current_ctx().and_then(|ctx| ctx.peer_addr())
    }

    fn request(&self, message: T::Message) -> Result<RequestStatus, SendError<T::Message>> {
        match self.current_ctx() {
            Some(ctx) => ctx.send(message).map(|()| RequestStatus::Queued),
            None => Err(SendError::Inactive(message)),
        }
    }

    fn request_with_listener(
        &self,
        message: T::Message,
        listener: WriteListener<T::Message>,
    ) -> Result<RequestStatus, SendError<T::Message>> {
        match self.current_ctx() {
            Some(ctx) => ctx
                .send_with_listener(message, listener)
                .map(|()| RequestStatus::Queued),
            None => Err(SendError::Inactive(message)),
        }
    }
}
