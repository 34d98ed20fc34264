//! Transport Protocol Transfer
//!
//! The seam that lets one set of registered protocol types run over any
//! carrier. A transfer turns one carrier unit into zero or more messages and
//! one message into zero or more carrier units.
//!
//! | Transfer              | Inbound unit            | Message           | Outbound unit           |
//! |-----------------------|-------------------------|-------------------|-------------------------|
//! | [`SocketTransfer`]    | packet `Bytes`          | `Box<dyn Protocol>` | packet `Bytes`        |
//! | [`UdpTransfer`]       | [`Datagram`]            | [`UdpEnvelope`]   | [`Datagram`]            |
//! | `WebSocketTransfer`   | WebSocket `Message`     | `Box<dyn Protocol>` | WebSocket `Message`   |
//! | [`HttpServerTransfer`]| [`HttpRequestUnit`]     | `Box<dyn Protocol>` | [`HttpResponseUnit`]  |
//! | [`HttpClientTransfer`]| [`HttpResponseUnit`]    | `Box<dyn Protocol>` | [`HttpRequestUnit`]   |

pub mod http;
pub mod socket;
pub mod udp;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use http::{HttpClientTransfer, HttpRequestUnit, HttpResponseUnit, HttpServerTransfer};
pub use socket::SocketTransfer;
pub use udp::{Datagram, UdpEnvelope, UdpTransfer};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransfer;

use crate::protocol::Dispatch;
use crate::transport::traits::{ConnectionInfo, TransportError};

/// Carrier-specific encode/decode bridge
pub trait TransportProtocolTransfer: Send + Sync + 'static {
    /// Unit delivered by the carrier
    type Inbound: Send + 'static;
    /// Domain message handed to the pipeline
    type Message: Dispatch;
    /// Unit written to the carrier
    type Outbound: Send + 'static;

    /// Turn one inbound unit into messages
    ///
    /// # Errors
    ///
    /// Any error discards the whole unit; the connection stays open.
    fn decode(
        &self,
        conn: &ConnectionInfo,
        unit: Self::Inbound,
    ) -> Result<Vec<Self::Message>, TransportError>;

    /// Turn one message into outbound units
    ///
    /// # Errors
    ///
    /// Returns an error when the message cannot be represented on this carrier.
    fn encode(
        &self,
        conn: &ConnectionInfo,
        message: &Self::Message,
    ) -> Result<Vec<Self::Outbound>, TransportError>;

    /// Drop any per-connection state once the connection is gone
    fn release(&self, conn: &ConnectionInfo) {
        let _ = conn;
    }
}
