//! Message codecs - turning application messages into envelope bodies.
//!
//! A channel is built over one codec. The codec's content type is announced
//! in the preamble, so both ends agree on the body encoding before the first
//! envelope is sent.
//!
//! - [`RawCodec`] - opaque bytes, `application/octet-stream`
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (struct-as-map)
//!
//! # Example
//!
//! ```
//! use netframe_client::codec::{MessageCodec, MsgPackCodec, RawCodec};
//! use bytes::Bytes;
//!
//! let codec = MsgPackCodec::<String>::new();
//! let body = codec.encode(&"hello".to_string()).unwrap();
//! assert_eq!(codec.decode(body).unwrap(), "hello");
//!
//! let raw = RawCodec;
//! assert_eq!(raw.content_type(), "application/octet-stream");
//! assert_eq!(raw.decode(Bytes::from_static(b"x")).unwrap(), "x");
//! ```

mod msgpack;
mod raw;

use bytes::Bytes;

use crate::error::Result;

pub use msgpack::MsgPackCodec;
pub use raw::RawCodec;

/// Encodes and decodes the messages carried by a channel.
pub trait MessageCodec: Send + Sync + 'static {
    type Message: Send;

    /// Content type sent in the preamble.
    fn content_type(&self) -> &str;

    fn encode(&self, message: &Self::Message) -> Result<Bytes>;

    fn decode(&self, body: Bytes) -> Result<Self::Message>;
}
