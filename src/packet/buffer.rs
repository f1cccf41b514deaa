use thiserror::Error;

/// Errors raised while decoding a received byte buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// The buffer ended before the expected field could be read.
    #[error("buffer too short: needed {needed} more byte(s) at offset {offset}")]
    UnexpectedEnd { offset: usize, needed: usize },

    /// A length-prefixed string did not contain valid UTF-8.
    #[error("string field at offset {offset} is not valid UTF-8")]
    InvalidString { offset: usize },

    /// The leading protocol id byte did not name a known protocol.
    #[error("unknown protocol id byte {byte}")]
    UnknownProtocol { byte: u8 },
}

/// Growable buffer that encodes primitives in network byte order.
pub struct ByteWriter {
    buffer: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buffer.push(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(bytes);
        self
    }

    /// Writes a string with a one-byte length prefix. Strings longer than
    /// 255 bytes are truncated at a character boundary.
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        let mut bytes = value.as_bytes();
        if bytes.len() > 255 {
            let mut end = 255;
            while !value.is_char_boundary(end) {
                end -= 1;
            }
            bytes = &bytes[..end];
        }
        self.write_u8(bytes.len() as u8);
        self.write_bytes(bytes)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

impl Default for ByteWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over a received byte buffer, decoding in network byte order.
pub struct ByteReader<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.offset
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], PacketError> {
        if self.remaining() < count {
            return Err(PacketError::UnexpectedEnd {
                offset: self.offset,
                needed: count - self.remaining(),
            });
        }
        let slice = &self.buffer[self.offset..self.offset + count];
        self.offset += count;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, PacketError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, PacketError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], PacketError> {
        self.take(count)
    }

    /// Reads a string with a one-byte length prefix.
    pub fn read_string(&mut self) -> Result<String, PacketError> {
        let offset = self.offset;
        let len = self.read_u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| PacketError::InvalidString { offset })
    }

    /// Skips `count` bytes, e.g. over an unknown attribute.
    pub fn skip(&mut self, count: usize) -> Result<(), PacketError> {
        self.take(count).map(|_| ())
    }

    /// Returns everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buffer[self.offset..];
        self.offset = self.buffer.len();
        slice
    }
}
