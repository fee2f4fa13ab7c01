//! # netframe-client
//!
//! Client side of a binary message framing protocol in the style of .NET
//! `net.tcp`: a preamble negotiates version, mode, target via and content
//! type, optional stream upgrades run in-band, and messages then travel as
//! sized envelopes (duplex sessions) or chunked unsized envelopes
//! (singleton request/reply).
//!
//! ## Architecture
//!
//! - **protocol**: records, varints, quota-checked strings, the preamble and
//!   the client framing decoders
//! - **transport**: the [`Connection`](transport::Connection) abstraction,
//!   stream and buffered connections, connectors
//! - **upgrade**: preamble exchange and stream upgrade negotiation
//! - **pool**: idle connection pooling with idle and lease timeouts
//! - **channel**: duplex sessions and singleton requests built on the above
//!
//! ## Example
//!
//! ```ignore
//! use bytes::Bytes;
//! use netframe_client::{ChannelBuilder, RawCodec};
//!
//! #[tokio::main]
//! async fn main() -> netframe_client::Result<()> {
//!     let factory = ChannelBuilder::new("net.tcp://localhost:808/echo", RawCodec).build()?;
//!
//!     let reply = factory
//!         .request_channel()
//!         .request(&Bytes::from_static(b"ping"))
//!         .await?;
//!     println!("{reply:?}");
//!
//!     factory.close().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod timeout;
pub mod transport;
pub mod upgrade;
pub mod via;

pub use channel::{
    ChannelBuilder, ChannelFactory, ChannelState, DuplexSessionChannel, SingletonRequestChannel,
};
pub use codec::{MessageCodec, MsgPackCodec, RawCodec};
pub use config::{FramingSettings, PoolSettings};
pub use error::{ErrorCategory, FramingError, Result};
pub use pool::ConnectionPoolRegistry;
pub use via::Via;
