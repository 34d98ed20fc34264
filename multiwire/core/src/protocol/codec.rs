//! Packet codec: `[protocol_id: u32 BE][payload]` to and from protocol
//! instances, resolved through the shared [`ProtocolRegistry`].

use std::sync::Arc;

use bytes::{Buf, Bytes};

use super::{Protocol, ProtocolError, ProtocolReader, ProtocolRegistry, ProtocolWriter};

/// Size of the protocol id header
pub const HEADER_LEN: usize = 4;

/// Encodes and decodes protocol packets
#[derive(Clone, Debug)]
pub struct ProtocolCodec {
    registry: Arc<ProtocolRegistry>,
}

impl ProtocolCodec {
    /// Create a codec over a frozen registry
    #[must_use]
    pub fn new(registry: Arc<ProtocolRegistry>) -> Self {
        Self { registry }
    }

    /// The registry used to resolve ids
    #[must_use]
    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }

    /// Split a packet into its id and payload
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MissingHeader`] for packets shorter than the header.
    pub fn split_header(mut packet: Bytes) -> Result<(u32, Bytes), ProtocolError> {
        if packet.len() < HEADER_LEN {
            return Err(ProtocolError::MissingHeader { len: packet.len() });
        }
        let id = packet.get_u32();
        Ok((id, packet))
    }

    /// Decode a full packet
    ///
    /// # Errors
    ///
    /// Fails on a short header, an unregistered id, or a malformed payload.
    pub fn decode(&self, packet: Bytes) -> Result<Box<dyn Protocol>, ProtocolError> {
        let (id, payload) = Self::split_header(packet)?;
        self.decode_payload(id, payload)
    }

    /// Construct the type registered under `id` and read `payload` into it
    ///
    /// # Errors
    ///
    /// Fails on an unregistered id or a malformed payload.
    pub fn decode_payload(
        &self,
        id: u32,
        payload: Bytes,
    ) -> Result<Box<dyn Protocol>, ProtocolError> {
        let mut protocol = self.registry.create(id)?;
        let mut reader = ProtocolReader::new(payload);
        protocol.read(&mut reader)?;

        if !reader.is_empty() {
            tracing::trace!(
                protocol_id = id,
                trailing = reader.remaining(),
                "Ignoring trailing payload bytes"
            );
        }
        Ok(protocol)
    }

    /// Encode a full packet (header plus payload)
    #[must_use]
    pub fn encode(&self, protocol: &dyn Protocol) -> Bytes {
        let mut writer = ProtocolWriter::with_capacity(64);
        writer.write_u32(protocol.protocol_id());
        protocol.write(&mut writer);
        writer.freeze()
    }

    /// Encode only the payload, without the id header
    #[must_use]
    pub fn encode_payload(&self, protocol: &dyn Protocol) -> Bytes {
        let mut writer = ProtocolWriter::with_capacity(64);
        protocol.write(&mut writer);
        writer.freeze()
    }
}
