//! MsgPack codec using `rmp-serde`.
//!
//! Always encodes with `to_vec_named`: structs go on the wire as maps keyed by
//! field name, not as positional arrays, so peers in other languages can
//! decode them without sharing field order.
//!
//! # Example
//!
//! ```
//! use netframe_client::codec::{MessageCodec, MsgPackCodec};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Order {
//!     id: u32,
//!     item: String,
//! }
//!
//! let codec = MsgPackCodec::<Order>::new();
//! let order = Order { id: 42, item: "widget".to_string() };
//! let body = codec.encode(&order).unwrap();
//! assert_eq!(codec.decode(body).unwrap(), order);
//! ```

use std::fmt;
use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::MessageCodec;
use crate::error::Result;

/// Content type announced by [`MsgPackCodec`].
pub const MSGPACK: &str = "application/msgpack";

/// MessagePack codec for messages of type `T`.
pub struct MsgPackCodec<T> {
    _message: PhantomData<fn() -> T>,
}

impl<T> MsgPackCodec<T> {
    pub const fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

impl<T> Default for MsgPackCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for MsgPackCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for MsgPackCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgPackCodec")
            .field("message", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> MessageCodec for MsgPackCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Message = T;

    #[inline]
    fn content_type(&self) -> &str {
        MSGPACK
    }

    #[inline]
    fn encode(&self, message: &T) -> Result<Bytes> {
        // to_vec_named, NOT to_vec.
        Ok(rmp_serde::to_vec_named(message)?.into())
    }

    #[inline]
    fn decode(&self, body: Bytes) -> Result<T> {
        Ok(rmp_serde::from_slice(&body)?)
    }
}
