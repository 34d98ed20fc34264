//! Datagram transfer.
//!
//! One datagram carries one packet. The sender's address travels with the
//! decoded message so a reply can be addressed back to it.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use super::{SocketTransfer, TransportProtocolTransfer};
use crate::protocol::{Dispatch, Protocol, ProtocolRegistry};
use crate::transport::traits::{ConnectionInfo, TransportError};

/// Raw datagram and its remote address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    /// Datagram body
    pub payload: Bytes,
    /// Sender (inbound) or recipient (outbound)
    pub peer: SocketAddr,
}

/// A protocol message paired with the remote address it came from or goes to
pub struct UdpEnvelope {
    /// The message
    pub protocol: Box<dyn Protocol>,
    /// Remote address
    pub peer: SocketAddr,
}

impl UdpEnvelope {
    /// Address `protocol` to `peer`
    #[must_use]
    pub fn new(protocol: Box<dyn Protocol>, peer: SocketAddr) -> Self {
        Self { protocol, peer }
    }

    /// Build a reply to the sender of this envelope
    #[must_use]
    pub fn reply(&self, protocol: Box<dyn Protocol>) -> Self {
        Self {
            protocol,
            peer: self.peer,
        }
    }
}

impl fmt::Debug for UdpEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpEnvelope")
            .field("protocol", &self.protocol)
            .field("peer", &self.peer)
            .finish()
    }
}

impl Dispatch for UdpEnvelope {
    fn protocol_id(&self) -> u32 {
        self.protocol.protocol_id()
    }
}

/// Datagram in, enveloped protocol out
#[derive(Clone, Debug)]
pub struct UdpTransfer {
    packets: SocketTransfer,
}

impl UdpTransfer {
    /// Create a transfer over a frozen registry
    #[must_use]
    pub fn new(registry: Arc<ProtocolRegistry>) -> Self {
        Self::from_socket(SocketTransfer::new(registry))
    }

    /// Reuse a configured packet transfer (e.g. with compression)
    #[must_use]
    pub fn from_socket(packets: SocketTransfer) -> Self {
        Self { packets }
    }
}

impl TransportProtocolTransfer for UdpTransfer {
    type Inbound = Datagram;
    type Message = UdpEnvelope;
    type Outbound = Datagram;

    fn decode(
        &self,
        _conn: &ConnectionInfo,
        unit: Datagram,
    ) -> Result<Vec<UdpEnvelope>, TransportError> {
        let protocol = self.packets.decode_packet(unit.payload)?;
        Ok(vec![UdpEnvelope::new(protocol, unit.peer)])
    }

    fn encode(
        &self,
        _conn: &ConnectionInfo,
        message: &UdpEnvelope,
    ) -> Result<Vec<Datagram>, TransportError> {
        Ok(vec![Datagram {
            payload: self.packets.encode_packet(message.protocol.as_ref())?,
            peer: message.peer,
        }])
    }
}
