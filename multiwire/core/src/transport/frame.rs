//! Stream Framing
//!
//! Splits a byte stream (TCP, HTTP body) into protocol packets using a
//! length prefix and CRC32 checksum.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+----------------+------------------------------------------+
//! | Length (4)     | Checksum (4)   | Packet (variable)                        |
//! | big-endian u32 | CRC32          | [protocol_id][payload]                   |
//! +----------------+----------------+------------------------------------------+
//! ```
//!
//! The Length field covers the packet only (not the checksum).
//!
//! # Security
//!
//! - Maximum frame size is enforced before buffering the packet
//! - A corrupt frame (checksum mismatch) is skipped so the stream stays aligned
//! - An oversized length is unrecoverable; the caller must drop the stream

use bytes::Bytes;

use super::TransportError;

/// Default maximum packet size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Frame header size: 4 bytes length + 4 bytes checksum
pub const FRAME_HEADER_SIZE: usize = 8;

#[inline]
fn compute_checksum(packet: &[u8]) -> u32 {
    crc32fast::hash(packet)
}

/// Wrap a packet in a length-prefixed, checksummed frame
///
/// # Errors
///
/// Returns [`TransportError::FrameTooLarge`] if the packet exceeds `max_frame_size`.
pub fn encode_frame(packet: &[u8], max_frame_size: usize) -> Result<Vec<u8>, TransportError> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + packet.len());
    encode_frame_into(packet, max_frame_size, &mut buf)?;
    Ok(buf)
}

/// Append a frame to an existing buffer
///
/// # Errors
///
/// Returns [`TransportError::FrameTooLarge`] if the packet exceeds `max_frame_size`.
pub fn encode_frame_into(
    packet: &[u8],
    max_frame_size: usize,
    buf: &mut Vec<u8>,
) -> Result<(), TransportError> {
    let len = u32::try_from(packet.len())
        .ok()
        .filter(|_| packet.len() <= max_frame_size)
        .ok_or(TransportError::FrameTooLarge {
            size: packet.len(),
            max: max_frame_size,
        })?;

    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&compute_checksum(packet).to_be_bytes());
    buf.extend_from_slice(packet);
    Ok(())
}

/// Split a complete buffer into packets
///
/// Used for bodies that arrive whole, such as HTTP. Trailing bytes that do
/// not form a complete frame are an error.
///
/// # Errors
///
/// Fails on checksum mismatch, oversize frames, or a truncated tail.
pub fn decode_all(body: &[u8], max_frame_size: usize) -> Result<Vec<Bytes>, TransportError> {
    let mut decoder = FrameDecoder::with_max_frame_size(max_frame_size);
    decoder.push(body);

    let mut packets = Vec::new();
    while let Some(packet) = decoder.decode()? {
        packets.push(packet);
    }

    if decoder.available() > 0 {
        return Err(TransportError::SerializationError(format!(
            "{} trailing bytes after last complete frame",
            decoder.available()
        )));
    }
    Ok(packets)
}

/// Decoder state machine for streaming frame parsing
///
/// Buffers incoming bytes and yields complete packets.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a decoder with the default maximum frame size
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a decoder with a custom maximum frame size
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            max_frame_size,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact once the consumed prefix dominates
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Get the number of unconsumed bytes
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    fn read_u32_at(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buffer[offset..offset + 4]);
        u32::from_be_bytes(raw)
    }

    /// Try to decode the next packet
    ///
    /// Returns:
    /// - `Ok(Some(packet))` if a complete frame was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(TransportError::ChecksumMismatch)` if the frame was corrupt; it
    ///   has been skipped and decoding may continue
    /// - `Err(TransportError::FrameTooLarge)` if the length is over the limit;
    ///   the stream cannot be resynchronized
    pub fn decode(&mut self) -> Result<Option<Bytes>, TransportError> {
        let available = self.available();
        if available < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let len = self.read_u32_at(self.read_pos) as usize;
        if len > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        if available < FRAME_HEADER_SIZE + len {
            return Ok(None);
        }

        let expected = self.read_u32_at(self.read_pos + 4);
        let start = self.read_pos + FRAME_HEADER_SIZE;
        let end = start + len;
        let packet = &self.buffer[start..end];
        let actual = compute_checksum(packet);
        let packet = Bytes::copy_from_slice(packet);

        self.read_pos = end;

        if actual != expected {
            return Err(TransportError::ChecksumMismatch { expected, actual });
        }
        Ok(Some(packet))
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}
