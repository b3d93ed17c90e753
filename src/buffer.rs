//! Big-endian cursor types for the replication wire format
//!
//! Everything PostgreSQL sends on the replication stream is network byte
//! order. [`BufferReader`] tracks a position over an immutable frame;
//! [`BufferWriter`] builds the small fixed-size messages we send back.

use crate::errors::{ReplicationError, ReplicationResult};

/// A buffer reader that manages position and provides bounds-checked reads
#[derive(Debug)]
pub struct BufferReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Get remaining bytes in the buffer
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Check if we have at least `count` bytes remaining
    pub fn has_bytes(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    pub fn read_u8(&mut self) -> ReplicationResult<u8> {
        if !self.has_bytes(1) {
            return Err(ReplicationError::decode("not enough bytes for u8"));
        }
        let value = self.buffer[self.position];
        self.position += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> ReplicationResult<u16> {
        let bytes = self.take(2, "u16")?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> ReplicationResult<u32> {
        let bytes = self.take(4, "u32")?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i32(&mut self) -> ReplicationResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> ReplicationResult<u64> {
        let bytes = self.take(8, "u64")?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn read_i64(&mut self) -> ReplicationResult<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// Read a null-terminated string. The terminator must appear before the
    /// end of the buffer; anything else is a malformed message.
    pub fn read_cstring(&mut self) -> ReplicationResult<String> {
        let start = self.position;
        while self.position < self.buffer.len() && self.buffer[self.position] != 0 {
            self.position += 1;
        }
        if self.position >= self.buffer.len() {
            return Err(ReplicationError::decode("string not null-terminated"));
        }
        let value = String::from_utf8_lossy(&self.buffer[start..self.position]).into_owned();
        self.position += 1; // terminator
        Ok(value)
    }

    /// Read `count` raw bytes into an owned vector
    pub fn read_bytes(&mut self, count: usize) -> ReplicationResult<Vec<u8>> {
        Ok(self.take(count, "bytes")?.to_vec())
    }

    fn take(&mut self, count: usize, what: &str) -> ReplicationResult<&'a [u8]> {
        if !self.has_bytes(count) {
            return Err(ReplicationError::decode(format!(
                "not enough bytes for {what}"
            )));
        }
        let slice = &self.buffer[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }
}

/// A buffer writer over a fixed-size frame with automatic position tracking
#[derive(Debug)]
pub struct BufferWriter<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> BufferWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn write_u8(&mut self, value: u8) -> ReplicationResult<()> {
        if self.position >= self.buffer.len() {
            return Err(ReplicationError::protocol("not enough space for u8"));
        }
        self.buffer[self.position] = value;
        self.position += 1;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> ReplicationResult<()> {
        self.write_slice(&value.to_be_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> ReplicationResult<()> {
        self.write_slice(&value.to_be_bytes())
    }

    /// Get the total bytes written so far
    pub fn bytes_written(&self) -> usize {
        self.position
    }

    fn write_slice(&mut self, bytes: &[u8]) -> ReplicationResult<()> {
        if self.buffer.len() - self.position < bytes.len() {
            return Err(ReplicationError::protocol("not enough space in frame"));
        }
        self.buffer[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
        Ok(())
    }
}
