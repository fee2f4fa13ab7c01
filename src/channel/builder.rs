//! Channel builder and factory.
//!
//! The [`ChannelBuilder`] provides a fluent API for configuring a target
//! endpoint and building a [`ChannelFactory`]:
//!
//! ```ignore
//! use netframe_client::channel::ChannelBuilder;
//! use netframe_client::codec::RawCodec;
//! use std::time::Duration;
//!
//! let factory = ChannelBuilder::new("net.tcp://orders.local:808/submit", RawCodec)
//!     .open_timeout(Duration::from_secs(5))
//!     .build()?;
//!
//! let session = factory.duplex_channel();
//! session.open().await?;
//! session.send(&Bytes::from_static(b"hello")).await?;
//! let reply = session.receive().await?;
//! session.close().await?;
//!
//! factory.close().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::channel::{ChannelCore, DuplexSessionChannel, SingletonRequestChannel};
use crate::codec::MessageCodec;
use crate::config::{FramingSettings, PoolSettings};
use crate::error::Result;
use crate::pool::{ConnectionPool, ConnectionPoolRegistry};
use crate::protocol::{FramingMode, Preamble};
use crate::transport::{Connector, TcpConnector};
use crate::upgrade::StreamUpgradeProvider;
use crate::via::Via;

/// Builder for configuring and creating a channel factory.
pub struct ChannelBuilder<C: MessageCodec> {
    via: String,
    codec: C,
    settings: FramingSettings,
    pool_settings: PoolSettings,
    connector: Option<Arc<dyn Connector>>,
    upgrade: Option<Arc<dyn StreamUpgradeProvider>>,
    registry: Option<Arc<ConnectionPoolRegistry>>,
}

impl<C: MessageCodec> ChannelBuilder<C> {
    /// Create a builder targeting `via` (a `net.tcp://host:port/path` URI).
    pub fn new(via: impl Into<String>, codec: C) -> Self {
        Self {
            via: via.into(),
            codec,
            settings: FramingSettings::default(),
            pool_settings: PoolSettings::default(),
            connector: None,
            upgrade: None,
            registry: None,
        }
    }

    /// Replace all framing settings.
    pub fn settings(mut self, settings: FramingSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace all pool settings.
    ///
    /// `buffer_size` and `max_output_delay` are always taken from the
    /// framing settings.
    pub fn pool_settings(mut self, settings: PoolSettings) -> Self {
        self.pool_settings = settings;
        self
    }

    /// Set how new connections are established.
    ///
    /// Default: a [`TcpConnector`] built from the framing settings.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Negotiate stream upgrades on every new connection.
    pub fn upgrade(mut self, provider: Arc<dyn StreamUpgradeProvider>) -> Self {
        self.upgrade = Some(provider);
        self
    }

    /// Share pools with other factories built on the same registry.
    ///
    /// Default: a registry private to this factory.
    pub fn registry(mut self, registry: Arc<ConnectionPoolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Default: 60 seconds
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.settings.open_timeout = timeout;
        self
    }

    /// Default: 60 seconds
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.settings.close_timeout = timeout;
        self
    }

    /// Budget for one send, and for a whole singleton exchange.
    ///
    /// Default: 60 seconds
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.settings.send_timeout = timeout;
        self
    }

    /// Default: 10 minutes
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.settings.receive_timeout = timeout;
        self
    }

    /// Largest envelope accepted from the peer.
    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.settings.max_buffer_size = size;
        self
    }

    pub fn max_received_message_size(mut self, size: usize) -> Self {
        self.settings.max_received_message_size = size;
        self
    }

    /// Batch small writes and flush after the max output delay.
    pub fn buffered_writes(mut self, enabled: bool) -> Self {
        self.settings.buffered_writes = enabled;
        self
    }

    /// Validate the configuration and build the factory.
    ///
    /// Fails when the via cannot be parsed, or when the via or the codec's
    /// content type is too long to fit in a preamble.
    pub fn build(self) -> Result<ChannelFactory<C>> {
        let via = Via::parse(&self.via)?;
        let content_type = self.codec.content_type().to_string();
        let upgrade_configured = self.upgrade.is_some();
        let duplex_preamble =
            Preamble::build(FramingMode::Duplex, via.as_str(), &content_type, upgrade_configured)?;
        let singleton_preamble = Preamble::build(
            FramingMode::Singleton,
            via.as_str(),
            &content_type,
            upgrade_configured,
        )?;

        // Connection buffering comes from the framing settings, so factories
        // that shape connections differently never share a pool.
        let mut pool_settings = self.pool_settings;
        pool_settings.buffer_size = self.settings.connection_buffer_size;
        pool_settings.max_output_delay = self.settings.max_output_delay;

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ConnectionPoolRegistry::new()));
        let pool = registry.lookup(&pool_settings);
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::from_settings(&self.settings)));
        let pool_key = channel_pool_key(&via, connector.as_ref(), self.upgrade.as_deref());

        tracing::debug!(via = %via, content_type = %content_type, pool_key = %pool_key, "channel factory built");
        Ok(ChannelFactory {
            core: Arc::new(ChannelCore {
                via,
                codec: self.codec,
                settings: self.settings,
                duplex_preamble,
                singleton_preamble,
                pool,
                registry,
                connector,
                upgrade: self.upgrade,
                pool_key,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

/// Key of the idle set a channel draws from.
///
/// A pooled connection keeps whatever its connector and upgrades made of
/// it, so both are part of the key alongside the endpoint.
fn channel_pool_key(
    via: &Via,
    connector: &dyn Connector,
    upgrade: Option<&dyn StreamUpgradeProvider>,
) -> String {
    let upgrade = upgrade.map_or_else(|| "none".to_string(), |provider| provider.pool_key());
    format!("{} [{}] upgrade={}", via.pool_key(), connector.pool_key(), upgrade)
}

/// Creates channels to one endpoint.
///
/// Cloning is cheap; clones share the pool reference, which is released by
/// the first [`close`](Self::close) or when the last clone and channel drop.
pub struct ChannelFactory<C: MessageCodec> {
    core: Arc<ChannelCore<C>>,
}

impl<C: MessageCodec> Clone for ChannelFactory<C> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<C: MessageCodec> std::fmt::Debug for ChannelFactory<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelFactory").field("core", &self.core).finish()
    }
}

impl<C: MessageCodec> ChannelFactory<C> {
    /// Create a builder; same as [`ChannelBuilder::new`].
    pub fn builder(via: impl Into<String>, codec: C) -> ChannelBuilder<C> {
        ChannelBuilder::new(via, codec)
    }

    /// A new, unopened duplex session.
    pub fn duplex_channel(&self) -> DuplexSessionChannel<C> {
        DuplexSessionChannel::new(Arc::clone(&self.core))
    }

    /// A request channel; every request is an independent exchange.
    pub fn request_channel(&self) -> SingletonRequestChannel<C> {
        SingletonRequestChannel::new(Arc::clone(&self.core))
    }

    #[inline]
    pub fn via(&self) -> &Via {
        &self.core.via
    }

    #[inline]
    pub fn settings(&self) -> &FramingSettings {
        &self.core.settings
    }

    #[inline]
    pub fn codec(&self) -> &C {
        &self.core.codec
    }

    /// The pool this factory draws connections from.
    #[inline]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.core.pool
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
    }

    /// Release the pool reference. Channels opened afterwards fail.
    ///
    /// Idempotent. When this was the last factory on the pool, idle
    /// connections are closed within the close timeout.
    pub async fn close(&self) {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained = self
            .core
            .registry
            .release(&self.core.pool, self.core.settings.close_timeout)
            .await;
        tracing::debug!(via = %self.core.via, drained, "channel factory closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MsgPackCodec, RawCodec};
    use crate::error::ErrorCategory;

    #[test]
    fn test_builder_settings() {
        let builder = ChannelBuilder::new("net.tcp://host:808/svc", RawCodec)
            .open_timeout(Duration::from_secs(5))
            .receive_timeout(Duration::from_secs(7))
            .max_buffer_size(1024)
            .buffered_writes(true);
        assert_eq!(builder.settings.open_timeout, Duration::from_secs(5));
        assert_eq!(builder.settings.receive_timeout, Duration::from_secs(7));
        assert_eq!(builder.settings.max_buffer_size, 1024);
        assert!(builder.settings.buffered_writes);
    }

    #[tokio::test]
    async fn test_build_prepares_preambles() {
        let factory = ChannelBuilder::new("net.tcp://Host:808/svc", MsgPackCodec::<String>::new())
            .build()
            .unwrap();
        let core = &factory.core;
        assert_eq!(core.duplex_preamble.mode(), FramingMode::Duplex);
        assert_eq!(core.singleton_preamble.mode(), FramingMode::Singleton);
        assert_eq!(core.duplex_preamble.content_type(), "application/msgpack");
        assert!(core.pool_key.starts_with(&factory.via().pool_key()));
        assert!(core.pool_key.ends_with("[tcp] upgrade=none"));
        factory.close().await;
    }

    struct NoUpgrades;

    impl StreamUpgradeProvider for NoUpgrades {
        fn create_initiator(&self, _via: &Via) -> Box<dyn crate::upgrade::StreamUpgradeInitiator> {
            unreachable!("not connected in this test")
        }
    }

    #[tokio::test]
    async fn test_upgrade_leaves_preamble_open() {
        let factory = ChannelBuilder::new("net.tcp://host:808/svc", RawCodec)
            .upgrade(Arc::new(NoUpgrades))
            .build()
            .unwrap();
        let preamble = &factory.core.duplex_preamble;
        assert_eq!(preamble.initial().len() + 1, preamble.reuse().len());
    }

    #[test]
    fn test_invalid_via() {
        let err = ChannelBuilder::new("http://host/svc", RawCodec).build().unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Protocol);
    }

    #[tokio::test]
    async fn test_factories_share_registry_pool() {
        let registry = Arc::new(ConnectionPoolRegistry::new());
        let a = ChannelBuilder::new("net.tcp://host:808/a", RawCodec)
            .registry(Arc::clone(&registry))
            .build()
            .unwrap();
        let b = ChannelBuilder::new("net.tcp://host:808/b", RawCodec)
            .registry(Arc::clone(&registry))
            .build()
            .unwrap();
        assert!(Arc::ptr_eq(a.pool(), b.pool()));

        a.close().await;
        a.close().await;
        assert!(a.is_closed());
        assert!(!b.pool().is_closed());
        b.close().await;
        assert!(b.pool().is_closed());
    }

    #[tokio::test]
    async fn test_upgrade_separates_pooled_connections() {
        let registry = Arc::new(ConnectionPoolRegistry::new());
        let plain = ChannelBuilder::new("net.tcp://host:808/a", RawCodec)
            .registry(Arc::clone(&registry))
            .build()
            .unwrap();
        let upgraded = ChannelBuilder::new("net.tcp://host:808/a", RawCodec)
            .registry(Arc::clone(&registry))
            .upgrade(Arc::new(NoUpgrades))
            .build()
            .unwrap();

        assert!(Arc::ptr_eq(plain.pool(), upgraded.pool()));
        assert_ne!(plain.core.pool_key, upgraded.core.pool_key);
        assert!(upgraded.core.pool_key.contains("NoUpgrades"));
        plain.close().await;
        upgraded.close().await;
    }

    #[tokio::test]
    async fn test_connection_buffering_splits_pools() {
        let registry = Arc::new(ConnectionPoolRegistry::new());
        let small = ChannelBuilder::new("net.tcp://host:808/a", RawCodec)
            .registry(Arc::clone(&registry))
            .settings(FramingSettings {
                connection_buffer_size: 512,
                ..FramingSettings::default()
            })
            .build()
            .unwrap();
        let default = ChannelBuilder::new("net.tcp://host:808/a", RawCodec)
            .registry(Arc::clone(&registry))
            .build()
            .unwrap();

        assert_eq!(small.pool().settings().buffer_size, 512);
        assert!(!Arc::ptr_eq(small.pool(), default.pool()));

        let buffered = ChannelBuilder::new("net.tcp://host:808/a", RawCodec)
            .registry(Arc::clone(&registry))
            .buffered_writes(true)
            .build()
            .unwrap();
        assert!(Arc::ptr_eq(default.pool(), buffered.pool()));
        assert_ne!(default.core.pool_key, buffered.core.pool_key);

        small.close().await;
        default.close().await;
        buffered.close().await;
    }
}
