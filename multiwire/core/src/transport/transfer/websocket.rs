//! WebSocket frame transfer.
//!
//! Binary frames carry one packet each. Control frames (ping, pong, close)
//! are the carrier's business and decode to nothing. Text frames are not
//! part of the binary protocol.

use std::sync::Arc;

use tokio_tungstenite::tungstenite::Message;

use super::{SocketTransfer, TransportProtocolTransfer};
use crate::protocol::{Protocol, ProtocolRegistry};
use crate::transport::traits::{ConnectionInfo, TransportError};

/// WebSocket message in, protocol out
#[derive(Clone, Debug)]
pub struct WebSocketTransfer {
    packets: SocketTransfer,
}

impl WebSocketTransfer {
    /// Create a transfer over a frozen registry
    #[must_use]
    pub fn new(registry: Arc<ProtocolRegistry>) -> Self {
        Self::from_socket(SocketTransfer::new(registry))
    }

    /// Reuse a configured packet transfer
    #[must_use]
    pub fn from_socket(packets: SocketTransfer) -> Self {
        Self { packets }
    }
}

impl TransportProtocolTransfer for WebSocketTransfer {
    type Inbound = Message;
    type Message = Box<dyn Protocol>;
    type Outbound = Message;

    fn decode(
        &self,
        conn: &ConnectionInfo,
        unit: Message,
    ) -> Result<Vec<Box<dyn Protocol>>, TransportError> {
        match unit {
            Message::Binary(data) => Ok(vec![self.packets.decode_packet(data.into())?]),
            Message::Text(_) => Err(TransportError::SerializationError(
                "text frames are not supported by the binary protocol".to_string(),
            )),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(Vec::new()),
            Message::Close(frame) => {
                tracing::debug!(conn_id = %conn.id, ?frame, "WebSocket close frame");
                Ok(Vec::new())
            }
        }
    }

    fn encode(
        &self,
        _conn: &ConnectionInfo,
        message: &Box<dyn Protocol>,
    ) -> Result<Vec<Message>, TransportError> {
        let packet = self.packets.encode_packet(message.as_ref())?;
        Ok(vec![Message::Binary(packet.to_vec())])
    }
}
