//! multiwire Core - Carrier-Agnostic Protocol Transport
//!
//! One protocol model, one handler pipeline, several carriers. Application
//! messages are registered [`Protocol`] types; the same
//! [`ProtocolHandler`] receives them whether they arrived over TCP, UDP,
//! WebSocket or HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Application                            │
//! │        ProtocolHandler        SessionRegistry                │
//! └───────────────▲───────────────────────┬──────────────────────┘
//!                 │ messages              │ request()
//! ┌───────────────┴───────────────────────▼──────────────────────┐
//! │  Pipeline: rate limiter (global, per type) ─▶ dispatch       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  TransportProtocolTransfer: unit ⇄ messages via registry     │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Carriers: TcpClient/Server  UdpClient/Server                │
//! │            ReconnectClient (any Client)                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ProtocolRegistry`]: id to constructor and throttle interval
//! - [`ProtocolHandler`]: application callbacks
//! - [`TcpServer`] / [`TcpClient`]: framed stream carrier
//! - [`UdpServer`] / [`UdpClient`]: datagram carrier
//! - [`ReconnectClient`]: a client that reconnects and replays
//! - [`SessionRegistry`]: lazily built per-connection state
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use multiwire_core::{ProtocolRegistry, TcpServer, TransportConfig, Server};
//!
//! let registry = ProtocolRegistry::new().with_type::<Ping>()?.into_shared();
//! let server = TcpServer::socket(TransportConfig::default(), registry, Arc::new(EchoHandler));
//! let addr = server.bind("0.0.0.0:7000".parse()?).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::{load_config, ConfigError, ConfigSource, LoadedConfig};
pub use pipeline::{ChannelContext, HandlerResult, Pipeline, ProtocolHandler, WriteFailure};
pub use protocol::{
    Dispatch, Protocol, ProtocolError, ProtocolReader, ProtocolRegistry, ProtocolType,
    ProtocolWriter,
};
pub use session::{SessionCleanupHandler, SessionRegistry};
pub use transport::transfer::{TransportProtocolTransfer, UdpEnvelope};
pub use transport::{
    Client, Connection, ConnectionId, ConnectionInfo, ReconnectClient, RequestStatus, SendError,
    Server, TcpClient, TcpServer, TransportConfig, TransportError, UdpClient, UdpServer,
};
