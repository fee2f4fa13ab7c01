//! Transport module - the connection abstraction and its implementations.
//!
//! Provides:
//! - [`Connection`]: byte-level read/write with per-operation timeouts
//! - [`StreamConnection`]: a connection over any tokio byte stream
//! - [`BufferedConnection`]: write batching with a delayed flush
//! - [`Connector`] / [`TcpConnector`]: establishing new connections

mod buffered;
mod connector;
mod stream;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{FramingError, Result};

pub use buffered::{BufferedConnection, DEFAULT_FLUSH_DELAY, DEFAULT_WRITE_BUFFER_SIZE};
pub use connector::{Connector, TcpConnector};
pub use stream::{ByteStream, StreamConnection};

/// A bidirectional byte connection.
///
/// At most one read and one write may be in flight at a time. Every
/// operation takes its own timeout; a timed-out operation aborts the
/// connection. `abort` is synchronous and wakes in-flight operations.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Read up to `buf.len()` bytes. `Ok(0)` means the peer closed.
    async fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Write all of `buf`.
    ///
    /// `immediate` asks buffering implementations to flush now.
    async fn write(&self, buf: &[u8], immediate: bool, timeout: Duration) -> Result<()>;

    /// Flush and shut down gracefully.
    async fn close(&self, timeout: Duration) -> Result<()>;

    /// Tear down immediately.
    fn abort(&self);
}

/// Owned, type-erased connection.
pub type BoxedConnection = Box<dyn Connection>;

/// Read exactly one byte; EOF is an error.
pub async fn read_byte(connection: &dyn Connection, timeout: Duration) -> Result<u8> {
    let mut byte = [0u8; 1];
    match connection.read(&mut byte, timeout).await? {
        0 => Err(FramingError::ConnectionClosed),
        _ => Ok(byte[0]),
    }
}
