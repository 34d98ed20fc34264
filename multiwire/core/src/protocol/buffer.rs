//! Payload cursors handed to `Protocol::read` and `Protocol::write`.
//!
//! All integers are big-endian. Strings and byte slices carry a `u32`
//! length prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::ProtocolError;

/// Read cursor over an inbound payload
#[derive(Debug, Clone)]
pub struct ProtocolReader {
    buf: Bytes,
}

impl ProtocolReader {
    /// Wrap a payload
    #[must_use]
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Bytes left to read
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Whether the payload has been fully consumed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn ensure(&self, needed: usize) -> Result<(), ProtocolError> {
        let remaining = self.buf.remaining();
        if remaining < needed {
            return Err(ProtocolError::BufferUnderflow { needed, remaining });
        }
        Ok(())
    }

    /// Read one byte
    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    /// Read a boolean encoded as one byte (non-zero is `true`)
    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_u8()? != 0)
    }

    /// Read a big-endian `u16`
    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    /// Read a big-endian `i16`
    pub fn read_i16(&mut self) -> Result<i16, ProtocolError> {
        self.ensure(2)?;
        Ok(self.buf.get_i16())
    }

    /// Read a big-endian `u32`
    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    /// Read a big-endian `i32`
    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    /// Read a big-endian `u64`
    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    /// Read a big-endian `i64`
    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    /// Read a big-endian IEEE 754 `f64`
    pub fn read_f64(&mut self) -> Result<f64, ProtocolError> {
        self.ensure(8)?;
        Ok(self.buf.get_f64())
    }

    /// Read a length-prefixed byte slice
    pub fn read_bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.read_u32()? as usize;
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    /// Read a length-prefixed UTF-8 string
    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let raw = self.read_bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Take everything that is left
    pub fn read_remaining(&mut self) -> Bytes {
        let len = self.buf.remaining();
        self.buf.split_to(len)
    }
}

/// Write cursor for an outbound payload
#[derive(Debug, Default)]
pub struct ProtocolWriter {
    buf: BytesMut,
}

impl ProtocolWriter {
    /// Create an empty writer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with preallocated capacity
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Bytes written so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Write one byte
    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    /// Write a boolean as one byte
    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    /// Write a big-endian `u16`
    pub fn write_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    /// Write a big-endian `i16`
    pub fn write_i16(&mut self, value: i16) {
        self.buf.put_i16(value);
    }

    /// Write a big-endian `u32`
    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    /// Write a big-endian `i32`
    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    /// Write a big-endian `u64`
    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    /// Write a big-endian `i64`
    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    /// Write a big-endian IEEE 754 `f64`
    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64(value);
    }

    /// Write a length-prefixed byte slice
    ///
    /// Slices longer than `u32::MAX` are not representable on the wire and
    /// are truncated to that length.
    pub fn write_bytes(&mut self, value: &[u8]) {
        let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
        self.buf.put_u32(len);
        self.buf.put_slice(&value[..len as usize]);
    }

    /// Write a length-prefixed UTF-8 string
    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    /// Append raw bytes with no length prefix
    pub fn write_raw(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    /// Finish writing and freeze the payload
    #[must_use]
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_fields_in_order() {
        let mut writer = ProtocolWriter::new();
        writer.write_u8(7);
        writer.write_bool(true);
        writer.write_i16(-2);
        writer.write_i32(-40_000);
        writer.write_u64(u64::MAX);
        writer.write_f64(1.5);

        let mut reader = ProtocolReader::new(writer.freeze());
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_i16().unwrap(), -2);
        assert_eq!(reader.read_i32().unwrap(), -40_000);
        assert_eq!(reader.read_u64().unwrap(), u64::MAX);
        assert!((reader.read_f64().unwrap() - 1.5).abs() < f64::EPSILON);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_big_endian_layout() {
        let mut writer = ProtocolWriter::new();
        writer.write_u32(0x0102_0304);
        assert_eq!(writer.freeze().as_ref(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_string_is_length_prefixed() {
        let mut writer = ProtocolWriter::new();
        writer.write_string("hi");
        let bytes = writer.freeze();
        assert_eq!(bytes.as_ref(), &[0, 0, 0, 2, b'h', b'i']);

        let mut reader = ProtocolReader::new(bytes);
        assert_eq!(reader.read_string().unwrap(), "hi");
    }

    #[test]
    fn test_underflow_reports_sizes() {
        let mut reader = ProtocolReader::new(Bytes::from_static(&[0, 1]));
        let err = reader.read_u32().unwrap_err();
        assert_eq!(
            err,
            ProtocolError::BufferUnderflow {
                needed: 4,
                remaining: 2
            }
        );
    }

    #[test]
    fn test_truncated_byte_slice() {
        // Declares 10 bytes but carries 3
        let mut reader = ProtocolReader::new(Bytes::from_static(&[0, 0, 0, 10, 1, 2, 3]));
        assert!(matches!(
            reader.read_bytes(),
            Err(ProtocolError::BufferUnderflow { needed: 10, .. })
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut reader = ProtocolReader::new(Bytes::from_static(&[0, 0, 0, 1, 0xff]));
        assert_eq!(reader.read_string().unwrap_err(), ProtocolError::InvalidUtf8);
    }

    #[test]
    fn test_read_remaining_drains() {
        let mut reader = ProtocolReader::new(Bytes::from_static(&[1, 2, 3]));
        reader.read_u8().unwrap();
        assert_eq!(reader.read_remaining().as_ref(), &[2, 3]);
        assert!(reader.is_empty());
    }
}
