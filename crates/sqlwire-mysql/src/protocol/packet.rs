//! Primitive wire value codec.
//!
//! [`Packet`] is a received payload with a consuming read cursor; every read
//! past the end of the payload is a fatal protocol error. [`PacketWriter`]
//! mirrors each read exactly.
//!
//! Length-encoded integers use the following forms:
//!
//! | first byte  | meaning                   |
//! |-------------|---------------------------|
//! | 0x00..=0xFA | the value itself          |
//! | 0xFB        | NULL                      |
//! | 0xFC        | 2-byte little-endian value |
//! | 0xFD        | 3-byte little-endian value |
//! | 0xFE        | 8-byte little-endian value |

use sqlwire_core::{Error, Result};

/// A received logical packet plus a read cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Vec<u8>,
    pos: usize,
}

impl Packet {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Unread bytes, without consuming them.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// The whole payload, including already consumed bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// True iff the unread bytes are exactly a 5-byte EOF packet.
    ///
    /// Under the text protocol a row may legitimately start with 0xFE (an
    /// 8-byte length prefix), so the length check is what tells them apart.
    pub fn is_eof_marker(&self) -> bool {
        self.remaining() == 5 && self.peek() == Some(0xFE)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&[u8]> {
        if self.remaining() < n {
            return Err(truncated(n, self.remaining()));
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.data[start..self.pos])
    }

    /// Consume and return everything that is left.
    pub fn read_rest(&mut self) -> &[u8] {
        let start = self.pos;
        self.pos = self.data.len();
        &self.data[start..]
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u24_le(&mut self) -> Result<u32> {
        let b = self.read_bytes(3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// An 8-byte value assembled from two little-endian 32-bit words.
    pub fn read_u64_le(&mut self) -> Result<u64> {
        let low = self.read_u32_le()?;
        let high = self.read_u32_le()?;
        Ok((u64::from(high) << 32) | u64::from(low))
    }

    /// Length-encoded integer; `None` for the NULL marker 0xFB.
    pub fn read_lenenc_int(&mut self) -> Result<Option<u64>> {
        let first = self.read_u8()?;
        let value = match first {
            0xFB => return Ok(None),
            0xFC => u64::from(self.read_u16_le()?),
            0xFD => u64::from(self.read_u24_le()?),
            0xFE => self.read_u64_le()?,
            0xFF => {
                return Err(Error::protocol(
                    "invalid length-encoded integer prefix 0xFF",
                ));
            }
            v => u64::from(v),
        };
        Ok(Some(value))
    }

    /// Length-encoded integer that must not be NULL.
    pub fn read_lenenc_int_required(&mut self) -> Result<u64> {
        self.read_lenenc_int()?
            .ok_or_else(|| Error::protocol("unexpected NULL length-encoded integer"))
    }

    /// Length-encoded byte string; `None` when the length is NULL.
    pub fn read_lenenc_bytes(&mut self) -> Result<Option<&[u8]>> {
        match self.read_lenenc_int()? {
            None => Ok(None),
            Some(len) => {
                let len = usize::try_from(len)
                    .map_err(|_| Error::protocol(format!("string length {} too large", len)))?;
                self.read_bytes(len).map(Some)
            }
        }
    }

    /// Length-encoded string decoded lossily as UTF-8 (metadata only).
    pub fn read_lenenc_string(&mut self) -> Result<Option<String>> {
        Ok(self
            .read_lenenc_bytes()?
            .map(|b| String::from_utf8_lossy(b).into_owned()))
    }

    /// NUL-terminated bytes; the terminator is consumed but not returned.
    pub fn read_null_bytes(&mut self) -> Result<&[u8]> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::protocol("missing NUL terminator"))?;
        let start = self.pos;
        self.pos += end + 1;
        Ok(&self.data[start..start + end])
    }

    pub fn read_null_string(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(self.read_null_bytes()?).into_owned())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

fn truncated(wanted: usize, available: usize) -> Error {
    Error::protocol(format!(
        "read past end of packet: wanted {} bytes, {} available",
        wanted, available
    ))
}

/// Builder for outgoing payloads.
#[derive(Debug, Clone, Default)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16_le(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u24_le(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes()[..3]);
    }

    pub fn write_u32_le(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, v: u64) {
        self.write_u32_le(v as u32);
        self.write_u32_le((v >> 32) as u32);
    }

    /// Length-encoded integer. 251 and up never use the literal form.
    pub fn write_lenenc_int(&mut self, v: u64) {
        if v < 251 {
            self.write_u8(v as u8);
        } else if v < 1 << 16 {
            self.write_u8(0xFC);
            self.write_u16_le(v as u16);
        } else if v < 1 << 24 {
            self.write_u8(0xFD);
            self.write_u24_le(v as u32);
        } else {
            self.write_u8(0xFE);
            self.write_u64_le(v);
        }
    }

    /// The NULL length marker.
    pub fn write_lenenc_null(&mut self) {
        self.write_u8(0xFB);
    }

    pub fn write_lenenc_bytes(&mut self, data: &[u8]) {
        self.write_lenenc_int(data.len() as u64);
        self.buf.extend_from_slice(data);
    }

    pub fn write_lenenc_string(&mut self, s: &str) {
        self.write_lenenc_bytes(s.as_bytes());
    }

    pub fn write_null_string(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn write_zeros(&mut self, n: usize) {
        self.buf.resize(self.buf.len() + n, 0);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
