//! Echo Server
//!
//! Answers every [`Ping`] with a [`Pong`] on the carrier it arrived on.
//!
//! ```text
//!   ping client ──Ping{seq}──▶ ┌──────────────┐
//!                              │ EchoHandler  │
//!   ping client ◀─Pong{seq}─── └──────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use multiwire_core::pipeline::{ChannelContext, HandlerResult, ProtocolHandler};
use multiwire_core::{
    Connection, Protocol, ProtocolRegistry, Server, TcpServer, TransportConfig, TransportError,
    UdpEnvelope, UdpServer,
};

use crate::protocols::{Ping, Pong};

/// Stream carrier echo
struct EchoHandler;

impl ProtocolHandler<Box<dyn Protocol>> for EchoHandler {
    fn handle(
        &self,
        ctx: &ChannelContext<Box<dyn Protocol>>,
        message: Box<dyn Protocol>,
    ) -> HandlerResult {
        let Some(ping) = message.downcast_ref::<Ping>() else {
            debug!(conn_id = %ctx.id(), ?message, "Ignoring non-ping message");
            return Ok(());
        };
        if ctx.send(Box::new(Pong::answer(ping))).is_err() {
            warn!(conn_id = %ctx.id(), seq = ping.seq, "Connection gone before pong");
        }
        Ok(())
    }

    fn channel_active(&self, ctx: &ChannelContext<Box<dyn Protocol>>) {
        info!(conn_id = %ctx.id(), peer = ?ctx.peer_addr(), "Client connected");
    }

    fn channel_inactive(&self, ctx: &ChannelContext<Box<dyn Protocol>>) {
        info!(conn_id = %ctx.id(), "Client disconnected");
    }

    fn handle_exception(&self, ctx: &ChannelContext<Box<dyn Protocol>>, cause: &TransportError) {
        warn!(conn_id = %ctx.id(), error = %cause, "Transport error");
    }

    fn global_rate_limit_reject(&self, ctx: &ChannelContext<Box<dyn Protocol>>) {
        warn!(conn_id = %ctx.id(), "Global rate limit hit");
    }
}

/// Datagram carrier echo; replies go back to each sender
struct DatagramEchoHandler;

impl ProtocolHandler<UdpEnvelope> for DatagramEchoHandler {
    fn handle(&self, ctx: &ChannelContext<UdpEnvelope>, envelope: UdpEnvelope) -> HandlerResult {
        let Some(ping) = envelope.protocol.downcast_ref::<Ping>() else {
            debug!(peer = %envelope.peer, "Ignoring non-ping datagram");
            return Ok(());
        };
        let reply = envelope.reply(Box::new(Pong::answer(ping)));
        if ctx.send(reply).is_err() {
            warn!(peer = %envelope.peer, seq = ping.seq, "Socket closed before pong");
        }
        Ok(())
    }

    fn handle_exception(&self, _ctx: &ChannelContext<UdpEnvelope>, cause: &TransportError) {
        warn!(error = %cause, "Datagram error");
    }
}

/// Carrier a server listens on
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Carrier {
    Tcp,
    Udp,
}

/// Bind `addr` and echo until `shutdown` resolves
pub async fn serve<F>(
    addr: SocketAddr,
    carrier: Carrier,
    config: TransportConfig,
    registry: Arc<ProtocolRegistry>,
    shutdown: F,
) -> Result<()>
where
    F: std::future::Future<Output = ()>,
{
    let server: Box<dyn Server> = match carrier {
        Carrier::Tcp => Box::new(TcpServer::socket(config, registry, Arc::new(EchoHandler))),
        Carrier::Udp => Box::new(UdpServer::socket(
            config,
            registry,
            Arc::new(DatagramEchoHandler),
        )),
    };

    let bound = server
        .bind(addr)
        .await
        .with_context(|| format!("Failed to bind {carrier:?} on {addr}"))?;
    info!(%bound, ?carrier, "Echo server listening");

    shutdown.await;
    info!("Shutting down echo server");
    server.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols;
    use multiwire_core::pipeline::WriteListener;
    use multiwire_core::{Client, ConnectionInfo};

    #[test]
    fn test_echo_answers_ping() {
        let (ctx, mut rx) = ChannelContext::new(ConnectionInfo::new(None, None));
        // Contexts only accept writes while a connection task drives them
        assert!(EchoHandler.handle(&ctx, Box::new(Ping::now(1))).is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tcp_echo_round_trip() {
        let registry = protocols::registry().unwrap().into_shared();
        let config = TransportConfig::for_testing();
        let server =
            TcpServer::socket(config.clone(), Arc::clone(&registry), Arc::new(EchoHandler));
        let addr = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        struct Collect(tokio::sync::mpsc::UnboundedSender<u64>);
        impl ProtocolHandler<Box<dyn Protocol>> for Collect {
            fn handle(
                &self,
                _ctx: &ChannelContext<Box<dyn Protocol>>,
                message: Box<dyn Protocol>,
            ) -> HandlerResult {
                if let Some(pong) = message.downcast_ref::<Pong>() {
                    let _ = self.0.send(pong.seq);
                }
                Ok(())
            }
        }

        let client = multiwire_core::TcpClient::socket(config, registry, Arc::new(Collect(tx)));
        client.connect(addr).await.unwrap();
        let listener: WriteListener<Box<dyn Protocol>> = Box::new(|result| assert!(result.is_ok()));
        client
            .request_with_listener(Box::new(Ping::now(42)), listener)
            .unwrap();

        let seq = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(seq, Some(42));

        client.close().await;
        server.close().await;
    }
}
