//! Raw codec - envelope bodies are the messages.
//!
//! Used when the application already owns its serialization. Decoding is
//! zero-copy: the returned `Bytes` shares the receive buffer.

use bytes::Bytes;

use super::MessageCodec;
use crate::error::Result;

/// Content type announced by [`RawCodec`].
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Pass-through codec for binary messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl MessageCodec for RawCodec {
    type Message = Bytes;

    #[inline]
    fn content_type(&self) -> &str {
        OCTET_STREAM
    }

    #[inline]
    fn encode(&self, message: &Bytes) -> Result<Bytes> {
        // Cheap clone: reference-counted.
        Ok(message.clone())
    }

    #[inline]
    fn decode(&self, body: Bytes) -> Result<Bytes> {
        Ok(body)
    }
}
