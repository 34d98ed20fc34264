//! Ping Client
//!
//! Sends numbered [`Ping`]s through a reconnecting client and reports each
//! [`Pong`]'s round trip. Pings sent while the server is unreachable are
//! buffered and replayed once it comes back.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{info, warn};

use multiwire_core::pipeline::{ChannelContext, HandlerResult, ProtocolHandler};
use multiwire_core::transport::UdpConnector;
use multiwire_core::{
    Client, Connection, Protocol, ProtocolRegistry, ReconnectClient, RequestStatus,
    TransportConfig, UdpEnvelope,
};

use crate::protocols::{Ping, Pong};
use crate::server::Carrier;

/// Outcome of a ping run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PingStats {
    pub sent: u64,
    pub received: u64,
}

impl PingStats {
    pub fn lost(&self) -> u64 {
        self.sent.saturating_sub(self.received)
    }
}

struct PongCollector(mpsc::UnboundedSender<Pong>);

impl PongCollector {
    fn offer(&self, message: &dyn Protocol) {
        if let Some(pong) = message.downcast_ref::<Pong>() {
            let _ = self.0.send(pong.clone());
        }
    }
}

impl ProtocolHandler<Box<dyn Protocol>> for PongCollector {
    fn handle(
        &self,
        _ctx: &ChannelContext<Box<dyn Protocol>>,
        message: Box<dyn Protocol>,
    ) -> HandlerResult {
        self.offer(&*message);
        Ok(())
    }

    fn channel_active(&self, ctx: &ChannelContext<Box<dyn Protocol>>) {
        info!(conn_id = %ctx.id(), "Connected");
    }

    fn channel_inactive(&self, ctx: &ChannelContext<Box<dyn Protocol>>) {
        warn!(conn_id = %ctx.id(), "Connection lost");
    }
}

impl ProtocolHandler<UdpEnvelope> for PongCollector {
    fn handle(&self, _ctx: &ChannelContext<UdpEnvelope>, envelope: UdpEnvelope) -> HandlerResult {
        self.offer(&*envelope.protocol);
        Ok(())
    }
}

/// Ping `addr` `count` times, one ping per `interval`
pub async fn ping(
    addr: SocketAddr,
    carrier: Carrier,
    count: u64,
    interval: Duration,
    config: TransportConfig,
    registry: Arc<ProtocolRegistry>,
) -> Result<PingStats> {
    let (tx, rx) = mpsc::unbounded_channel();
    let collector = Arc::new(PongCollector(tx));

    match carrier {
        Carrier::Tcp => {
            let client = ReconnectClient::tcp(config, registry, collector);
            let wrap = |ping: Ping| -> Box<dyn Protocol> { Box::new(ping) };
            run(&client, addr, count, interval, rx, wrap).await
        }
        Carrier::Udp => {
            let connector = Arc::new(UdpConnector::new(config.clone(), registry));
            let client = ReconnectClient::new(&config, connector, collector);
            let wrap = |ping: Ping| UdpEnvelope::new(Box::new(ping), addr);
            run(&client, addr, count, interval, rx, wrap).await
        }
    }
}

async fn run<M, F>(
    client: &ReconnectClient<M>,
    addr: SocketAddr,
    count: u64,
    interval: Duration,
    mut pongs: mpsc::UnboundedReceiver<Pong>,
    wrap: F,
) -> Result<PingStats>
where
    M: Send + 'static,
    F: Fn(Ping) -> M,
{
    if let Err(e) = client.connect(addr).await {
        warn!(%addr, error = %e, "Server unreachable, pings will be buffered");
    }

    let mut stats = PingStats::default();
    let wait = interval.max(Duration::from_millis(500));
    for seq in 1..=count {
        match client.request(wrap(Ping::now(seq))) {
            Ok(RequestStatus::Queued) => stats.sent += 1,
            Ok(RequestStatus::Buffered) => {
                stats.sent += 1;
                info!(seq, buffered = client.buffered(), "Ping buffered until reconnect");
            }
            Err(e) => warn!(seq, error = %e, "Ping dropped"),
        }

        let deadline = tokio::time::Instant::now() + wait;
        while let Ok(Some(pong)) = tokio::time::timeout_at(deadline, pongs.recv()).await {
            stats.received += 1;
            info!(seq = pong.seq, rtt_ms = pong.rtt().as_millis() as u64, "Pong");
        }
    }

    client.close().await;
    info!(
        sent = stats.sent,
        received = stats.received,
        lost = stats.lost(),
        "Ping finished"
    );
    Ok(stats)
}
