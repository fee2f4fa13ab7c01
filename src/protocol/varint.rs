//! Variable-length integer encoding.
//!
//! Values are written in little-endian groups of 7 bits; the high bit of each
//! byte signals that another byte follows. At most five bytes are used, and
//! the fifth byte may only carry the top three bits of a non-negative `i32`.

use bytes::{BufMut, BytesMut};

use crate::error::{FramingError, Result};

/// Maximum number of bytes in an encoded integer.
pub const MAX_ENCODED_SIZE: usize = 5;

/// Largest value that can be encoded.
pub const MAX_VALUE: u32 = i32::MAX as u32;

/// Number of bytes `value` occupies once encoded.
pub fn encoded_size(value: u32) -> usize {
    let mut size = 1;
    let mut rest = value >> 7;
    while rest != 0 {
        size += 1;
        rest >>= 7;
    }
    size
}

/// Append the encoding of `value` to `buf`.
pub fn encode_into(mut value: u32, buf: &mut BytesMut) {
    debug_assert!(value <= MAX_VALUE, "varint value out of range");
    buf.reserve(encoded_size(value));
    while value & !0x7F != 0 {
        buf.put_u8((value & 0x7F) as u8 | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Encode `value` into a fresh buffer.
pub fn encode(value: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(encoded_size(value));
    encode_into(value, &mut buf);
    buf
}

/// Convert a length to an encodable value, failing with a quota error.
pub fn checked_len(len: usize) -> Result<u32> {
    u32::try_from(len)
        .ok()
        .filter(|v| *v <= MAX_VALUE)
        .ok_or_else(|| FramingError::quota(format!("length {len} cannot be encoded"), None))
}

/// Incremental decoder for a single encoded integer.
///
/// Bytes may arrive in any split; [`decode`](Self::decode) consumes only what
/// belongs to the integer and reports how much that was.
#[derive(Debug, Default, Clone)]
pub struct IntDecoder {
    value: u32,
    index: usize,
    decoded: bool,
}

impl IntDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns the number consumed.
    ///
    /// Zero-length input is a no-op. Returns an error if the value has
    /// already been decoded or if the encoding is oversized.
    pub fn decode(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.decoded {
            return Err(FramingError::Protocol(
                "integer already decoded; reset before reuse".into(),
            ));
        }

        let mut consumed = 0;
        for &next in buf {
            consumed += 1;
            if self.index == MAX_ENCODED_SIZE - 1 && next & 0xF8 != 0 {
                return Err(FramingError::OversizedInteger);
            }
            self.value |= u32::from(next & 0x7F) << (self.index * 7);
            self.index += 1;
            if next & 0x80 == 0 {
                self.decoded = true;
                break;
            }
        }
        Ok(consumed)
    }

    #[inline]
    pub fn is_decoded(&self) -> bool {
        self.decoded
    }

    /// The decoded value, once complete.
    #[inline]
    pub fn value(&self) -> Option<u32> {
        self.decoded.then_some(self.value)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
