//! Sharing pools between channel factories.
//!
//! Factories with compatible [`PoolSettings`] share one [`ConnectionPool`].
//! The registry is an ordinary value: create one per component that owns a
//! family of factories and pass it to each [`ChannelBuilder`].
//!
//! [`ChannelBuilder`]: crate::channel::ChannelBuilder

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::ConnectionPool;
use crate::config::PoolSettings;

/// Pools grouped by group name.
#[derive(Debug, Default)]
pub struct ConnectionPoolRegistry {
    groups: Mutex<HashMap<String, Vec<Arc<ConnectionPool>>>>,
}

impl ConnectionPoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find an open pool compatible with `settings`, or create one.
    ///
    /// The returned pool has been opened once on the caller's behalf; pair
    /// every lookup with a [`release`](Self::release).
    pub fn lookup(&self, settings: &PoolSettings) -> Arc<ConnectionPool> {
        let mut groups = self.groups.lock();
        let pools = groups.entry(settings.group_name.clone()).or_default();

        if let Some(pool) = pools
            .iter()
            .find(|pool| pool.is_compatible(settings) && pool.try_open())
        {
            return Arc::clone(pool);
        }

        let pool = Arc::new(ConnectionPool::new(settings.clone()));
        // A fresh pool cannot be closed yet.
        let _ = pool.try_open();
        pools.push(Arc::clone(&pool));
        tracing::debug!(group = %settings.group_name, pools = pools.len(), "created connection pool");
        pool
    }

    /// Give back a pool obtained from [`lookup`](Self::lookup).
    ///
    /// The last release closes the pool and removes it from the registry.
    /// Returns `true` when this call closed the pool.
    pub async fn release(&self, pool: &Arc<ConnectionPool>, timeout: Duration) -> bool {
        if !pool.close(timeout).await {
            return false;
        }

        let group = &pool.settings().group_name;
        let mut groups = self.groups.lock();
        if let Some(pools) = groups.get_mut(group) {
            pools.retain(|candidate| !Arc::ptr_eq(candidate, pool));
            if pools.is_empty() {
                groups.remove(group);
            }
        }
        true
    }

    /// Number of pools registered under `group_name`.
    pub fn pool_count(&self, group_name: &str) -> usize {
        self.groups.lock().get(group_name).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_compatible_lookups_share_a_pool() {
        let registry = ConnectionPoolRegistry::new();
        let settings = PoolSettings::default();

        let a = registry.lookup(&settings);
        let b = registry.lookup(&settings.clone());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.pool_count(&settings.group_name), 1);

        assert!(!registry.release(&a, TIMEOUT).await);
        assert!(registry.release(&b, TIMEOUT).await);
        assert_eq!(registry.pool_count(&settings.group_name), 0);
    }

    #[tokio::test]
    async fn test_different_buffer_size_gets_own_pool() {
        let registry = ConnectionPoolRegistry::new();
        let settings = PoolSettings::default();
        let other = PoolSettings {
            buffer_size: settings.buffer_size * 2,
            ..PoolSettings::default()
        };

        let a = registry.lookup(&settings);
        let b = registry.lookup(&other);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.pool_count(&settings.group_name), 2);

        assert!(registry.release(&a, TIMEOUT).await);
        assert_eq!(registry.pool_count(&settings.group_name), 1);
    }

    #[tokio::test]
    async fn test_groups_are_separate() {
        let registry = ConnectionPoolRegistry::new();
        let a = registry.lookup(&PoolSettings::default());
        let b = registry.lookup(&PoolSettings {
            group_name: "reports".into(),
            ..PoolSettings::default()
        });
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.pool_count("reports"), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_is_replaced() {
        let registry = ConnectionPoolRegistry::new();
        let settings = PoolSettings::default();
        let first = registry.lookup(&settings);
        // Closed without going through the registry.
        assert!(first.close(TIMEOUT).await);

        let second = registry.lookup(&settings);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());
    }
}
