//! Transport Layer
//!
//! Carriers that move registered protocol messages between peers:
//! - [`tcp`]: framed stream connections
//! - [`udp`]: one datagram per packet
//! - WebSocket and HTTP through their [`transfer`] adapters
//!
//! # Design Philosophy
//!
//! A carrier only moves units. Turning units into messages belongs to a
//! [`TransportProtocolTransfer`](transfer::TransportProtocolTransfer), and
//! deciding what a message means belongs to the application's
//! [`ProtocolHandler`](crate::pipeline::ProtocolHandler). The same handler
//! runs unchanged over every carrier.

pub mod config;
pub mod frame;
pub mod idle;
pub mod rate_limit;
pub mod reconnect;
pub mod tcp;
pub mod traits;
pub mod transfer;
pub mod udp;

use std::sync::Arc;

pub use config::TransportConfig;
pub use frame::{FrameDecoder, MAX_FRAME_SIZE};
pub use idle::{IdleConfig, IdleEvent};
pub use rate_limit::{RateLimitMetrics, RateLimitResult, TransportRateLimiter};
pub use reconnect::{ClientConnector, ReconnectClient, TcpConnector, UdpConnector};
pub use tcp::{TcpClient, TcpServer};
pub use traits::{
    Client, Connection, ConnectionId, ConnectionInfo, RequestStatus, SendError, Server,
    TransportError,
};
pub use udp::{UdpClient, UdpServer};

use crate::pipeline::{Pipeline, ProtocolHandler};
use crate::protocol::{Protocol, ProtocolRegistry};
use transfer::{SocketTransfer, UdpEnvelope, UdpTransfer};

/// Per-connection settings handed to connection tasks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ChannelSettings {
    pub(crate) max_frame_size: usize,
    pub(crate) idle: IdleConfig,
}

impl ChannelSettings {
    pub(crate) fn from_config(config: &TransportConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
            idle: config.idle(),
        }
    }
}

/// Packet transfer honoring the `compression` setting
#[must_use]
pub fn socket_transfer(config: &TransportConfig, registry: Arc<ProtocolRegistry>) -> SocketTransfer {
    let transfer = SocketTransfer::new(registry);
    if !config.compression {
        return transfer;
    }

    #[cfg(feature = "compression")]
    {
        transfer.with_compression(zstd::DEFAULT_COMPRESSION_LEVEL)
    }
    #[cfg(not(feature = "compression"))]
    {
        tracing::warn!("Compression requested but the `compression` feature is disabled");
        transfer
    }
}

/// Pipeline for stream carriers speaking framed packets
pub fn socket_pipeline(
    config: &TransportConfig,
    registry: Arc<ProtocolRegistry>,
    handler: Arc<dyn ProtocolHandler<Box<dyn Protocol>>>,
) -> Pipeline<SocketTransfer> {
    let limiter = Arc::new(TransportRateLimiter::new(config.global_rate_limit, &registry));
    Pipeline::new(
        Arc::new(socket_transfer(config, registry)),
        handler,
        limiter,
    )
}

/// Pipeline for datagram carriers
pub fn udp_pipeline(
    config: &TransportConfig,
    registry: Arc<ProtocolRegistry>,
    handler: Arc<dyn ProtocolHandler<UdpEnvelope>>,
) -> Pipeline<UdpTransfer> {
    let limiter = Arc::new(TransportRateLimiter::new(config.global_rate_limit, &registry));
    Pipeline::new(
        Arc::new(UdpTransfer::from_socket(socket_transfer(config, registry))),
        handler,
        limiter,
    )
}
