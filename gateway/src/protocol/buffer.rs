//! Wire primitive reader/writer for PostgreSQL protocol messages
//!
//! The reader is a cursor over a borrowed byte slice. Every operation
//! fails with [`GatewayError::Incomplete`] when the buffer is short,
//! signaling the caller to await more input rather than abort the
//! connection. The writer side back-patches the 4-byte big-endian length
//! prefix once the message body is known, since PostgreSQL messages are
//! length-prefixed before their type-specific payload.

use crate::error::{GatewayError, Result};
use bytes::{BufMut, BytesMut};

/// Cursor-based reader over a single protocol message payload
#[derive(Debug)]
pub struct BufferReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BufferReader<'a> {
    /// Create a reader over the given bytes
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of unread bytes
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Read a single byte
    pub fn read_u8(&mut self) -> Result<u8> {
        let bytes = self.read_bytes(1)?;
        Ok(bytes[0])
    }

    /// Read a 16-bit signed integer in network byte order
    pub fn read_i16(&mut self) -> Result<i16> {
        let bytes = self.read_bytes(2)?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read a 32-bit signed integer in network byte order
    pub fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a null-terminated string
    pub fn read_cstring(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(GatewayError::Incomplete)?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|e| GatewayError::Protocol(format!("Invalid UTF-8: {}", e)))?
            .to_string();
        self.pos += nul + 1;
        Ok(s)
    }

    /// Read exactly `n` raw bytes
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(GatewayError::Incomplete);
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    /// Read all remaining bytes
    pub fn read_rest(&mut self) -> &'a [u8] {
        let bytes = &self.buf[self.pos..];
        self.pos = self.buf.len();
        bytes
    }
}

/// Write a tagged message into `dst`, back-patching the length prefix
///
/// The length covers the 4-byte length field itself but not the tag byte.
pub fn write_message<F>(dst: &mut BytesMut, tag: u8, body: F)
where
    F: FnOnce(&mut BytesMut),
{
    dst.put_u8(tag);
    write_length_prefixed(dst, body);
}

/// Write an untagged (startup-style) message into `dst`
///
/// The first message on a connection carries no tag byte; the length
/// prefix covers the whole message.
pub fn write_startup_message<F>(dst: &mut BytesMut, body: F)
where
    F: FnOnce(&mut BytesMut),
{
    write_length_prefixed(dst, body);
}

fn write_length_prefixed<F>(dst: &mut BytesMut, body: F)
where
    F: FnOnce(&mut BytesMut),
{
    let length_pos = dst.len();
    dst.put_i32(0); // Placeholder
    body(dst);

    let message_length = (dst.len() - length_pos) as i32;
    dst[length_pos..length_pos + 4].copy_from_slice(&message_length.to_be_bytes());
}

/// Write a null-terminated string into `dst`
pub fn write_cstring(dst: &mut BytesMut, s: &str) {
    dst.put_slice(s.as_bytes());
    dst.put_u8(0);
}
