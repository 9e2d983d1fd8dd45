//! Primitive SSH field encoding.
//!
//! Request payloads are built from two field types: big-endian `uint32`
//! values and `string`s, which are a `uint32` length followed by that many
//! bytes. [`PayloadReader`] walks a borrowed payload without copying and
//! never panics on short input.

use bytes::{BufMut, BytesMut};

use crate::error::{ProtocolError, Result};

/// Append a big-endian `uint32`.
#[inline]
pub fn put_u32(buf: &mut BytesMut, value: u32) {
    buf.put_u32(value);
}

/// Append a length-prefixed `string`.
pub fn put_string(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

/// Cursor over a request payload.
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    /// Start reading at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a big-endian `uint32`.
    pub fn read_u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Read a length-prefixed `string` as raw bytes.
    pub fn read_string(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Read a length-prefixed `string` that must be UTF-8.
    pub fn read_utf8(&mut self, field: &str) -> Result<&'a str> {
        let raw = self.read_string()?;
        std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8(field.to_string()))
    }

    /// Fail if any bytes are left.
    pub fn finish(self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}
