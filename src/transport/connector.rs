//! Establishing new connections.
//!
//! # Example
//!
//! ```ignore
//! use netframe_client::transport::{Connector, TcpConnector};
//! use netframe_client::via::Via;
//!
//! let via = Via::parse("net.tcp://127.0.0.1:8080/Echo")?;
//! let connection = TcpConnector::new().connect(&via, timeout).await?;
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::{BoxedConnection, BufferedConnection, StreamConnection};
use super::{DEFAULT_FLUSH_DELAY, DEFAULT_WRITE_BUFFER_SIZE};
use crate::config::FramingSettings;
use crate::error::{FramingError, Result};
use crate::via::Via;

/// Opens raw connections to a via.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, via: &Via, timeout: Duration) -> Result<BoxedConnection>;

    /// Names the kind of connection this connector produces.
    ///
    /// Channels only share pooled connections when their connectors report
    /// the same key. Connectors whose output depends on configuration
    /// should include it.
    fn pool_key(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// TCP connector with optional write batching.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    buffer_size: usize,
    output_delay: Duration,
    buffered: bool,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpConnector {
    /// Unbuffered connector.
    pub fn new() -> Self {
        Self {
            buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            output_delay: DEFAULT_FLUSH_DELAY,
            buffered: false,
        }
    }

    pub fn from_settings(settings: &FramingSettings) -> Self {
        Self {
            buffer_size: settings.connection_buffer_size,
            output_delay: settings.max_output_delay,
            buffered: settings.buffered_writes,
        }
    }

    /// Batch writes through a [`BufferedConnection`].
    pub fn buffered(mut self, buffer_size: usize, output_delay: Duration) -> Self {
        self.buffer_size = buffer_size;
        self.output_delay = output_delay;
        self.buffered = true;
        self
    }

    #[inline]
    pub fn is_buffered(&self) -> bool {
        self.buffered
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn pool_key(&self) -> String {
        if self.buffered {
            format!(
                "tcp+buffered({}, {}ms)",
                self.buffer_size,
                self.output_delay.as_millis()
            )
        } else {
            "tcp".to_string()
        }
    }

    async fn connect(&self, via: &Via, timeout: Duration) -> Result<BoxedConnection> {
        let address = (via.host(), via.port());
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| FramingError::Timeout(timeout))??;
        stream.set_nodelay(true)?;

        let connection = StreamConnection::new(stream);
        tracing::debug!(
            connection = connection.id(),
            via = %via,
            buffered = self.buffered,
            "tcp connection established"
        );

        if self.buffered {
            Ok(Box::new(BufferedConnection::new(
                Box::new(connection),
                self.buffer_size,
                self.output_delay,
            )))
        } else {
            Ok(Box::new(connection))
        }
    }
}
