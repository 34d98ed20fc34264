//! Packet transfer for stream carriers.
//!
//! Each unit is exactly one protocol packet. Framing is the carrier's job
//! (see [`frame`](crate::transport::frame)). Other transfers reuse this one
//! for the packet step.

use std::sync::Arc;

use bytes::Bytes;

use super::TransportProtocolTransfer;
use crate::protocol::{Protocol, ProtocolCodec, ProtocolRegistry};
use crate::transport::traits::{ConnectionInfo, TransportError};

/// One packet in, one protocol out
#[derive(Clone, Debug)]
pub struct SocketTransfer {
    codec: ProtocolCodec,
    #[cfg(feature = "compression")]
    compression: Option<i32>,
}

impl SocketTransfer {
    /// Create a transfer over a frozen registry
    #[must_use]
    pub fn new(registry: Arc<ProtocolRegistry>) -> Self {
        Self {
            codec: ProtocolCodec::new(registry),
            #[cfg(feature = "compression")]
            compression: None,
        }
    }

    /// Compress payloads with zstd at `level`
    ///
    /// Both peers must use the same setting.
    #[cfg(feature = "compression")]
    #[must_use]
    pub fn with_compression(mut self, level: i32) -> Self {
        self.compression = Some(level);
        self
    }

    /// The codec used for packets
    #[must_use]
    pub fn codec(&self) -> &ProtocolCodec {
        &self.codec
    }

    /// Decode one packet
    ///
    /// # Errors
    ///
    /// Fails on an unknown id, malformed payload, or bad compression.
    pub fn decode_packet(&self, packet: Bytes) -> Result<Box<dyn Protocol>, TransportError> {
        #[cfg(feature = "compression")]
        if self.compression.is_some() {
            let (id, payload) = ProtocolCodec::split_header(packet)?;
            let payload = zstd::decode_all(payload.as_ref())
                .map_err(|e| crate::protocol::ProtocolError::Compression(e.to_string()))?;
            return Ok(self.codec.decode_payload(id, Bytes::from(payload))?);
        }

        Ok(self.codec.decode(packet)?)
    }

    /// Encode one packet
    ///
    /// # Errors
    ///
    /// Fails only when compression fails.
    pub fn encode_packet(&self, protocol: &dyn Protocol) -> Result<Bytes, TransportError> {
        #[cfg(feature = "compression")]
        if let Some(level) = self.compression {
            let payload = self.codec.encode_payload(protocol);
            let compressed = zstd::encode_all(payload.as_ref(), level)
                .map_err(|e| crate::protocol::ProtocolError::Compression(e.to_string()))?;
            let mut writer = crate::protocol::ProtocolWriter::with_capacity(4 + compressed.len());
            writer.write_u32(protocol.protocol_id());
            writer.write_raw(&compressed);
            return Ok(writer.freeze());
        }

        Ok(self.codec.encode(protocol))
    }
}

impl TransportProtocolTransfer for SocketTransfer {
    type Inbound = Bytes;
    type Message = Box<dyn Protocol>;
    type Outbound = Bytes;

    fn decode(
        &self,
        _conn: &ConnectionInfo,
        unit: Bytes,
    ) -> Result<Vec<Box<dyn Protocol>>, TransportError> {
        Ok(vec![self.decode_packet(unit)?])
    }

    fn encode(
        &self,
        _conn: &ConnectionInfo,
        message: &Box<dyn Protocol>,
    ) -> Result<Vec<Bytes>, TransportError> {
        Ok(vec![self.encode_packet(message.as_ref())?])
    }
}
