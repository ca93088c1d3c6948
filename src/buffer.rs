//! Buffer utilities for replication protocol payloads
//!
//! Safe big-endian readers and writers over the byte payloads carried by the
//! COPY subprotocol, backed by the bytes crate. All multibyte integers on
//! the wire are network byte order.

use crate::error::{Result, StreamError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Cursor over a received protocol payload
///
/// # Example
///
/// ```
/// use pg_streamrecv::buffer::BufferReader;
///
/// let data = [b'w', 0, 0, 0, 0, 0x01, 0x00, 0x00, 0x00];
/// let mut reader = BufferReader::new(&data);
///
/// assert_eq!(reader.read_u8().unwrap(), b'w');
/// assert_eq!(reader.read_u64().unwrap(), 0x0100_0000);
/// assert_eq!(reader.remaining(), 0);
/// ```
pub struct BufferReader {
    data: Bytes,
}

impl BufferReader {
    /// Create a reader over a byte slice
    #[inline]
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }

    /// Create a reader that takes ownership of an existing buffer
    #[inline]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Bytes::from(data),
        }
    }

    /// Bytes not yet consumed
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    #[inline]
    fn ensure_bytes(&self, count: usize) -> Result<()> {
        if self.data.remaining() < count {
            return Err(StreamError::protocol(format!(
                "Not enough bytes remaining. Need {}, have {}",
                count,
                self.data.remaining()
            )));
        }
        Ok(())
    }

    /// Read a single byte
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the buffer is exhausted.
    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure_bytes(1)?;
        Ok(self.data.get_u8())
    }

    /// Read a 32-bit unsigned integer in network byte order
    #[inline]
    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure_bytes(4)?;
        Ok(self.data.get_u32())
    }

    /// Read a 64-bit unsigned integer in network byte order.
    ///
    /// WAL positions travel as big-endian u64 values.
    #[inline]
    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure_bytes(8)?;
        Ok(self.data.get_u64())
    }

    /// Read a 64-bit signed integer in network byte order (timestamps)
    #[inline]
    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure_bytes(8)?;
        Ok(self.data.get_i64())
    }

    /// Read raw bytes
    #[inline]
    pub fn read_bytes(&mut self, length: usize) -> Result<Vec<u8>> {
        self.ensure_bytes(length)?;
        Ok(self.data.copy_to_bytes(length).to_vec())
    }

    /// Consume the rest of the buffer as raw bytes
    #[inline]
    pub fn read_rest(&mut self) -> Vec<u8> {
        let len = self.data.remaining();
        self.data.copy_to_bytes(len).to_vec()
    }

    /// Skip n bytes
    #[inline]
    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.ensure_bytes(count)?;
        self.data.advance(count);
        Ok(())
    }
}

/// Builder for protocol messages written back to the server
///
/// Used for standby status updates on the COPY BOTH channel.
pub struct BufferWriter {
    data: BytesMut,
}

impl BufferWriter {
    /// Create a writer with the given initial capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
        }
    }

    /// Bytes written so far
    pub fn bytes_written(&self) -> usize {
        self.data.len()
    }

    /// Finish the message and hand back an immutable buffer
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    /// Write a single byte
    pub fn write_u8(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    /// Write a 64-bit unsigned integer in network byte order
    pub fn write_u64(&mut self, value: u64) {
        self.data.put_u64(value);
    }

    /// Write a 64-bit signed integer in network byte order
    pub fn write_i64(&mut self, value: i64) {
        self.data.put_i64(value);
    }
}
