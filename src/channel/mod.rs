//! Channels - the user-facing surface.
//!
//! A [`ChannelBuilder`] produces a [`ChannelFactory`], which owns the
//! prebuilt preambles and a reference on a shared connection pool. The
//! factory hands out:
//! - [`DuplexSessionChannel`]: a session of sized envelopes in both
//!   directions over one connection
//! - [`SingletonRequestChannel`]: one chunked request and one chunked reply
//!   per exchange
//!
//! Both kinds take a pooled connection when one is idle (re-sending the
//! preamble without upgrades) and otherwise connect, run the upgrades and
//! read the ack, all under a single time budget.

mod builder;
mod duplex;
mod request;
mod singleton_io;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};

use crate::codec::MessageCodec;
use crate::config::FramingSettings;
use crate::error::{ErrorCategory, FramingError, Result};
use crate::pool::{ConnectionPool, ConnectionPoolRegistry, PooledConnection};
use crate::protocol::{ClientFramingDecoder, Preamble};
use crate::timeout::TimeoutHelper;
use crate::transport::{Connection, Connector};
use crate::upgrade::{resend_preamble, send_preamble, StreamUpgradeProvider};
use crate::via::Via;

pub use builder::{ChannelBuilder, ChannelFactory};
pub use duplex::DuplexSessionChannel;
pub use request::SingletonRequestChannel;

/// Lifecycle of a session channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Created,
    Opened,
    Closed,
    /// An operation failed; the connection has been aborted.
    Faulted,
}

/// State shared by a factory and every channel it created.
pub(crate) struct ChannelCore<C> {
    pub(crate) via: Via,
    pub(crate) codec: C,
    pub(crate) settings: FramingSettings,
    pub(crate) duplex_preamble: Preamble,
    pub(crate) singleton_preamble: Preamble,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) registry: Arc<ConnectionPoolRegistry>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) upgrade: Option<Arc<dyn StreamUpgradeProvider>>,
    pub(crate) pool_key: String,
    pub(crate) closed: AtomicBool,
}

impl<C: MessageCodec> ChannelCore<C> {
    /// Get a connection that has been acknowledged for `preamble`.
    ///
    /// Pooled connections come first. One that fails the re-sent preamble
    /// with a communication error is dropped and the next one is tried;
    /// when none is left a new connection is opened.
    pub(crate) async fn establish<D, F>(
        &self,
        preamble: &Preamble,
        make_decoder: F,
        helper: &TimeoutHelper,
    ) -> Result<(PooledConnection, D)>
    where
        D: ClientFramingDecoder,
        F: Fn() -> D,
    {
        if self.closed.load(Ordering::Acquire) || self.pool.is_closed() {
            return Err(FramingError::PoolClosed);
        }

        while let Some(connection) = self.pool.take_connection(&self.pool_key, helper.remaining()?) {
            let mut decoder = make_decoder();
            match resend_preamble(&*connection, preamble.reuse(), &mut decoder, helper).await {
                Ok(()) => return Ok((connection, decoder)),
                Err(e) => {
                    let retry = e.category() == ErrorCategory::Communication;
                    tracing::debug!(
                        via = %self.via,
                        connection = connection.id(),
                        error = %e,
                        retry,
                        "pooled connection rejected the preamble"
                    );
                    self.pool
                        .return_connection(&self.pool_key, connection, false, helper.remaining_or_zero())
                        .await;
                    if !retry {
                        return Err(e);
                    }
                }
            }
        }

        let raw = self.connector.connect(&self.via, helper.remaining()?).await?;
        let mut decoder = make_decoder();
        let handshake = send_preamble(
            raw,
            preamble.initial(),
            self.upgrade.as_deref(),
            &self.via,
            &mut decoder,
            helper,
        )
        .await?;

        let connection = PooledConnection::new(handshake.connection, handshake.remote_identity);
        self.pool.track_connection(&self.pool_key, &connection);
        tracing::debug!(via = %self.via, connection = connection.id(), mode = ?preamble.mode(), "connection established");
        Ok((connection, decoder))
    }
}

impl<C> Drop for ChannelCore<C> {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Factory dropped without close: release the pool reference anyway.
        let registry = Arc::clone(&self.registry);
        let pool = Arc::clone(&self.pool);
        let timeout = self.settings.close_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    registry.release(&pool, timeout).await;
                });
            }
            Err(_) => tracing::warn!(via = %self.via, "channel factory dropped outside a runtime; pool left open"),
        }
    }
}

impl<C> fmt::Debug for ChannelCore<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCore")
            .field("via", &self.via)
            .field("pool_key", &self.pool_key)
            .field("upgrade", &self.upgrade.is_some())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Bytes read from a connection and not yet decoded.
#[derive(Debug)]
pub(crate) struct InputBuffer {
    pending: BytesMut,
    read_buf: Vec<u8>,
}

impl InputBuffer {
    pub(crate) fn new(read_size: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            read_buf: vec![0u8; read_size.max(1)],
        }
    }

    #[inline]
    pub(crate) fn pending(&self) -> &[u8] {
        &self.pending
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.pending.advance(n);
    }

    pub(crate) fn split_to(&mut self, n: usize) -> BytesMut {
        self.pending.split_to(n)
    }

    /// Read once more from `connection`. EOF is a protocol error naming
    /// the decoder state that still wanted bytes.
    pub(crate) async fn fill(
        &mut self,
        connection: &dyn Connection,
        state: &str,
        helper: &TimeoutHelper,
    ) -> Result<()> {
        let n = connection.read(&mut self.read_buf, helper.remaining()?).await?;
        if n == 0 {
            return Err(FramingError::Protocol(format!(
                "connection closed by the server while in state {state}"
            )));
        }
        self.pending.extend_from_slice(&self.read_buf[..n]);
        Ok(())
    }
}
