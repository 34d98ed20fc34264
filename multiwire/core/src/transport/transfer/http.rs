//! HTTP exchange transfers.
//!
//! Bodies are a batch of stream frames, so one request can carry several
//! messages. The server side remembers each decoded request per connection
//! until the response for it is encoded, which is how keep-alive is echoed
//! back and how a response finds its request.
//!
//! URL, cookie and header parsing stay with the HTTP carrier; these types
//! only hold what the transfer needs.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use super::{SocketTransfer, TransportProtocolTransfer};
use crate::protocol::{Protocol, ProtocolRegistry};
use crate::transport::frame::{decode_all, encode_frame_into, MAX_FRAME_SIZE};
use crate::transport::traits::{ConnectionId, ConnectionInfo, TransportError};

/// Content type used for framed protocol bodies
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// Request as seen by the transfer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRequestUnit {
    /// Request method
    pub method: String,
    /// Request target
    pub uri: String,
    /// Whether the client asked to keep the connection open
    pub keep_alive: bool,
    /// Framed protocol packets
    pub body: Bytes,
}

/// Response as seen by the transfer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponseUnit {
    /// Status code
    pub status: u16,
    /// Body content type
    pub content_type: String,
    /// Whether the carrier should keep the connection open
    pub keep_alive: bool,
    /// Framed protocol packets
    pub body: Bytes,
}

fn frame_body(
    packets: &SocketTransfer,
    protocol: &dyn Protocol,
    max_frame_size: usize,
) -> Result<Bytes, TransportError> {
    let packet = packets.encode_packet(protocol)?;
    let mut body = Vec::new();
    encode_frame_into(&packet, max_frame_size, &mut body)?;
    Ok(Bytes::from(body))
}

fn unframe_body(
    packets: &SocketTransfer,
    body: &[u8],
    max_frame_size: usize,
) -> Result<Vec<Box<dyn Protocol>>, TransportError> {
    decode_all(body, max_frame_size)?
        .into_iter()
        .map(|packet| packets.decode_packet(packet))
        .collect()
}

// =============================================================================
// Server Side
// =============================================================================

#[derive(Clone, Debug)]
struct PendingExchange {
    uri: String,
    keep_alive: bool,
}

/// Request in, response out
#[derive(Debug)]
pub struct HttpServerTransfer {
    packets: SocketTransfer,
    max_frame_size: usize,
    pending: DashMap<ConnectionId, PendingExchange>,
}

impl HttpServerTransfer {
    /// Create a transfer over a frozen registry
    #[must_use]
    pub fn new(registry: Arc<ProtocolRegistry>) -> Self {
        Self::from_socket(SocketTransfer::new(registry))
    }

    /// Reuse a configured packet transfer
    #[must_use]
    pub fn from_socket(packets: SocketTransfer) -> Self {
        Self {
            packets,
            max_frame_size: MAX_FRAME_SIZE,
            pending: DashMap::new(),
        }
    }

    /// Override the maximum frame size
    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Number of requests still waiting for a response
    #[must_use]
    pub fn pending_exchanges(&self) -> usize {
        self.pending.len()
    }
}

impl TransportProtocolTransfer for HttpServerTransfer {
    type Inbound = HttpRequestUnit;
    type Message = Box<dyn Protocol>;
    type Outbound = HttpResponseUnit;

    fn decode(
        &self,
        conn: &ConnectionInfo,
        unit: HttpRequestUnit,
    ) -> Result<Vec<Box<dyn Protocol>>, TransportError> {
        self.pending.insert(
            conn.id.clone(),
            PendingExchange {
                uri: unit.uri,
                keep_alive: unit.keep_alive,
            },
        );
        unframe_body(&self.packets, &unit.body, self.max_frame_size)
    }

    fn encode(
        &self,
        conn: &ConnectionInfo,
        message: &Box<dyn Protocol>,
    ) -> Result<Vec<HttpResponseUnit>, TransportError> {
        let Some((_, exchange)) = self.pending.remove(&conn.id) else {
            tracing::error!(
                conn_id = %conn.id,
                protocol_id = message.protocol_id(),
                "No pending HTTP request for response; dropping message"
            );
            return Ok(Vec::new());
        };

        tracing::trace!(conn_id = %conn.id, uri = %exchange.uri, "Answering HTTP request");
        Ok(vec![HttpResponseUnit {
            status: 200,
            content_type: BINARY_CONTENT_TYPE.to_string(),
            keep_alive: exchange.keep_alive,
            body: frame_body(&self.packets, message.as_ref(), self.max_frame_size)?,
        }])
    }

    fn release(&self, conn: &ConnectionInfo) {
        self.pending.remove(&conn.id);
    }
}

// =============================================================================
// Client Side
// =============================================================================

/// Message out as a POST request, response body in as messages
#[derive(Clone, Debug)]
pub struct HttpClientTransfer {
    packets: SocketTransfer,
    uri: String,
    keep_alive: bool,
    max_frame_size: usize,
}

impl HttpClientTransfer {
    /// Create a transfer posting to `uri`
    #[must_use]
    pub fn new(registry: Arc<ProtocolRegistry>, uri: impl Into<String>) -> Self {
        Self {
            packets: SocketTransfer::new(registry),
            uri: uri.into(),
            keep_alive: true,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Ask the server to close after each response
    #[must_use]
    pub fn without_keep_alive(mut self) -> Self {
        self.keep_alive = false;
        self
    }
}

impl TransportProtocolTransfer for HttpClientTransfer {
    type Inbound = HttpResponseUnit;
    type Message = Box<dyn Protocol>;
    type Outbound = HttpRequestUnit;

    fn decode(
        &self,
        _conn: &ConnectionInfo,
        unit: HttpResponseUnit,
    ) -> Result<Vec<Box<dyn Protocol>>, TransportError> {
        if !(200..300).contains(&unit.status) {
            return Err(TransportError::HttpStatus(unit.status));
        }
        unframe_body(&self.packets, &unit.body, self.max_frame_size)
    }

    fn encode(
        &self,
        _conn: &ConnectionInfo,
        message: &Box<dyn Protocol>,
    ) -> Result<Vec<HttpRequestUnit>, TransportError> {
        Ok(vec![HttpRequestUnit {
            method: "POST".to_string(),
            uri: self.uri.clone(),
            keep_alive: self.keep_alive,
            body: frame_body(&self.packets, message.as_ref(), self.max_frame_size)?,
        }])
    }
}
