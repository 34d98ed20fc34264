//! TCP Server Transport
//!
//! Owns the listener and every accepted connection. Each accepted stream is
//! driven by its own connection task; the server keeps a handle per
//! connection so it can address, broadcast to and finally close all of them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::connection::{PendingStream, StreamTransfer};
use crate::pipeline::{ChannelContext, Pipeline, ProtocolHandler};
use crate::protocol::{Protocol, ProtocolRegistry};
use crate::transport::config::TransportConfig;
use crate::transport::traits::{Connection, ConnectionId, SendError, Server, TransportError};
use crate::transport::transfer::SocketTransfer;
use crate::transport::{socket_pipeline, ChannelSettings};

struct Accepted<M> {
    ctx: ChannelContext<M>,
    task: Option<JoinHandle<()>>,
}

type Channels<M> = Arc<DashMap<ConnectionId, Accepted<M>>>;

struct Acceptor {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Server side of a TCP carrier
pub struct TcpServer<T: StreamTransfer> {
    pipeline: Pipeline<T>,
    config: TransportConfig,
    channels: Channels<T::Message>,
    acceptor: Mutex<Option<Acceptor>>,
    stopped: AtomicBool,
}

impl TcpServer<SocketTransfer> {
    /// Server speaking framed protocol packets
    pub fn socket(
        config: TransportConfig,
        registry: Arc<ProtocolRegistry>,
        handler: Arc<dyn ProtocolHandler<Box<dyn Protocol>>>,
    ) -> Self {
        let pipeline = socket_pipeline(&config, registry, handler);
        Self::new(config, pipeline)
    }
}

impl<T: StreamTransfer> TcpServer<T> {
    /// Server over any packet-bytes transfer
    pub fn new(config: TransportConfig, pipeline: Pipeline<T>) -> Self {
        Self {
            pipeline,
            config,
            channels: Arc::new(DashMap::new()),
            acceptor: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Ids of live accepted connections
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.channels.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Context of one accepted connection
    pub fn channel(&self, id: &ConnectionId) -> Option<ChannelContext<T::Message>> {
        self.channels.get(id).map(|entry| entry.ctx.clone())
    }

    /// Queue `message` on one accepted connection
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Inactive`] when the connection is unknown or gone.
    pub fn send_to(
        &self,
        id: &ConnectionId,
        message: T::Message,
    ) -> Result<(), SendError<T::Message>> {
        match self.channel(id) {
            Some(ctx) => ctx.send(message),
            None => Err(SendError::Inactive(message)),
        }
    }

    /// Queue a fresh message from `make` on every accepted connection
    ///
    /// Returns how many connections accepted it.
    pub fn broadcast<F>(&self, make: F) -> usize
    where
        F: Fn() -> T::Message,
    {
        let targets: Vec<_> = self.channels.iter().map(|entry| entry.ctx.clone()).collect();
        targets
            .into_iter()
            .filter(|ctx| match ctx.send(make()) {
                Ok(()) => true,
                Err(_) => {
                    tracing::debug!(conn_id = %ctx.id(), "Broadcast skipped inactive connection");
                    false
                }
            })
            .count()
    }
}

async fn accept_loop<T: StreamTransfer>(
    listener: TcpListener,
    pipeline: Pipeline<T>,
    settings: ChannelSettings,
    max_connections: usize,
    channels: Channels<T::Message>,
    shutdown: Arc<Notify>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            () = shutdown.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    continue;
                }
            },
        };

        if channels.len() >= max_connections {
            tracing::warn!(%peer, max_connections, "Connection limit reached, dropping connection");
            continue;
        }

        let pending = match PendingStream::new(stream, pipeline.clone(), settings) {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "Failed to set up accepted connection");
                continue;
            }
        };

        let ctx = pending.ctx().clone();
        let id = ctx.id().clone();
        channels.insert(id.clone(), Accepted { ctx, task: None });

        let on_exit = {
            let channels = Arc::clone(&channels);
            let id = id.clone();
            move || {
                channels.remove(&id);
            }
        };
        let task = pending.spawn(on_exit);
        if let Some(mut entry) = channels.get_mut(&id) {
            entry.task = Some(task);
        }
        tracing::debug!(conn_id = %id, %peer, "Accepted connection");
    }
}

#[async_trait]
impl<T: StreamTransfer> Connection for TcpServer<T> {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.lock().as_ref().map(|a| a.local_addr)
    }

    fn is_active(&self) -> bool {
        !self.is_stopped() && self.acceptor.lock().is_some()
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let acceptor = self.acceptor.lock().take();
        if let Some(acceptor) = acceptor {
            acceptor.shutdown.notify_one();
            if let Err(e) = acceptor.task.await {
                tracing::warn!(error = %e, "Accept task failed");
            }
        }

        let mut tasks = Vec::new();
        for id in self.connections() {
            let Some((_, accepted)) = self.channels.remove(&id) else {
                continue;
            };
            accepted.ctx.close();
            if let Some(task) = accepted.task {
                tasks.push(async move { (id, task.await) });
            }
        }
        for (id, result) in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::warn!(conn_id = %id, error = %e, "Connection task failed");
            }
        }
        tracing::debug!("TCP server closed");
    }
}

#[async_trait]
impl<T: StreamTransfer> Server for TcpServer<T> {
    async fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        if self.is_stopped() {
            return Err(TransportError::InvalidState("server is closed".to_string()));
        }
        if self.acceptor.lock().is_some() {
            return Err(TransportError::InvalidState("server is already bound".to_string()));
        }

        let timeout = self.config.connect_timeout();
        let listener = match tokio::time::timeout(timeout, TcpListener::bind(addr)).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::BindTimeout { addr, timeout }),
        };
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(accept_loop(
            listener,
            self.pipeline.clone(),
            ChannelSettings::from_config(&self.config),
            self.config.max_connections,
            Arc::clone(&self.channels),
            Arc::clone(&shutdown),
        ));

        let acceptor = Acceptor {
            local_addr,
            shutdown,
            task,
        };
        let raced = {
            let mut slot = self.acceptor.lock();
            if slot.is_some() || self.is_stopped() {
                Some(acceptor)
            } else {
                *slot = Some(acceptor);
                None
            }
        };
        if let Some(acceptor) = raced {
            acceptor.shutdown.notify_one();
            let _ = acceptor.task.await;
            return Err(TransportError::InvalidState(
                "server was bound or closed concurrently".to_string(),
            ));
        }

        tracing::info!(%local_addr, "TCP server listening");
        Ok(local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::HandlerResult;

    struct Ignore;

    impl ProtocolHandler<Box<dyn Protocol>> for Ignore {
        fn handle(
            &self,
            _ctx: &ChannelContext<Box<dyn Protocol>>,
            _message: Box<dyn Protocol>,
        ) -> HandlerResult {
            Ok(())
        }
    }

    fn server(config: TransportConfig) -> TcpServer<SocketTransfer> {
        TcpServer::socket(config, ProtocolRegistry::new().into_shared(), Arc::new(Ignore))
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = server(TransportConfig::for_testing());
        let addr = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        assert!(server.is_active());
        assert!(server.connections().is_empty());

        server.close().await;
        assert!(!server.is_active());
    }

    #[tokio::test]
    async fn test_double_bind_rejected() {
        let server = server(TransportConfig::for_testing());
        server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(matches!(
            server.bind("127.0.0.1:0".parse().unwrap()).await,
            Err(TransportError::InvalidState(_))
        ));
        server.close().await;
    }

    #[tokio::test]
    async fn test_bind_in_use_is_io_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let server = server(TransportConfig::for_testing());
        let err = server.bind(taken.local_addr().unwrap()).await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)), "{err}");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let server = server(TransportConfig::for_testing());
        server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        server.close().await;
        server.close().await;
        assert!(server.is_stopped());
    }

    #[tokio::test]
    async fn test_max_connections_drops_extra_peers() {
        let server = server(TransportConfig::for_testing().with_max_connections(1));
        let addr = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let _first = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while server.connections().is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let mut second = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            tokio::io::AsyncReadExt::read(&mut second, &mut buf),
        )
        .await
        .unwrap();
        // Dropped by the server: EOF or reset
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(server.connections().len(), 1);

        server.close().await;
        assert!(server.connections().is_empty());
    }
}
