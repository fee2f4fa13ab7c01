//! A pool of connections to many endpoints sharing one set of settings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::endpoint::EndpointConnectionPool;
use super::PooledConnection;
use crate::config::PoolSettings;
use crate::timeout::TimeoutHelper;

/// Endpoint lookups between passes that drop empty endpoint pools.
pub const PRUNE_THRESHOLD: usize = 30;

#[derive(Debug, Default)]
struct PoolState {
    endpoints: HashMap<String, Arc<EndpointConnectionPool>>,
    open_count: usize,
    closed: bool,
    prune_accrual: usize,
}

/// Reference-counted pool of connections, keyed by endpoint.
///
/// Every factory using the pool calls [`try_open`](Self::try_open) once and
/// [`close`](Self::close) once; the pool drains when the last user closes.
#[derive(Debug)]
pub struct ConnectionPool {
    settings: PoolSettings,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    /// Create a pool with no users.
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(PoolState::default()),
        }
    }

    #[inline]
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Whether this pool may serve a factory configured with `settings`.
    pub fn is_compatible(&self, settings: &PoolSettings) -> bool {
        self.settings.is_compatible(settings)
    }

    /// Register one more user. Fails once the pool has fully closed.
    pub fn try_open(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.open_count += 1;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn endpoint(&self, key: &str, create: bool) -> Option<Arc<EndpointConnectionPool>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }

        state.prune_accrual += 1;
        if state.prune_accrual >= PRUNE_THRESHOLD {
            state.prune_accrual = 0;
            let before = state.endpoints.len();
            state.endpoints.retain(|_, endpoint| !endpoint.is_empty());
            let pruned = before - state.endpoints.len();
            if pruned > 0 {
                tracing::debug!(pruned, "pruned empty endpoint pools");
            }
        }

        if let Some(endpoint) = state.endpoints.get(key) {
            return Some(Arc::clone(endpoint));
        }
        if !create {
            return None;
        }
        let endpoint = Arc::new(EndpointConnectionPool::new(key, &self.settings));
        state.endpoints.insert(key.to_string(), Arc::clone(&endpoint));
        Some(endpoint)
    }

    /// Take an idle connection to `key`, or `None` when the caller must
    /// establish one.
    pub fn take_connection(&self, key: &str, timeout: Duration) -> Option<PooledConnection> {
        self.endpoint(key, false)?.take(timeout)
    }

    /// Register a freshly established connection as busy under `key`.
    pub fn track_connection(&self, key: &str, connection: &PooledConnection) {
        if let Some(endpoint) = self.endpoint(key, true) {
            endpoint.track(connection);
        }
    }

    /// Hand a connection back after use.
    pub async fn return_connection(
        &self,
        key: &str,
        connection: PooledConnection,
        usable: bool,
        timeout: Duration,
    ) {
        match self.endpoint(key, usable) {
            Some(endpoint) => endpoint.return_connection(connection, usable, timeout).await,
            None => {
                tracing::debug!(endpoint = %key, usable, "no endpoint pool for returned connection; aborting");
                connection.abort();
            }
        }
    }

    /// Abort a busy connection without awaiting anything.
    ///
    /// Used where a channel gives up its connection from synchronous code.
    pub fn discard_connection(&self, key: &str, connection: &PooledConnection) {
        match self.endpoint(key, false) {
            Some(endpoint) => endpoint.discard(connection),
            None => connection.abort(),
        }
    }

    /// Seed an established connection into the idle set.
    pub async fn add_connection(&self, key: &str, connection: PooledConnection, timeout: Duration) {
        match self.endpoint(key, true) {
            Some(endpoint) => endpoint.add(connection, timeout).await,
            None => connection.abort(),
        }
    }

    /// Drop one user; the last one drains every endpoint.
    ///
    /// Returns `true` when this call closed the pool.
    pub async fn close(&self, timeout: Duration) -> bool {
        let endpoints = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.open_count = state.open_count.saturating_sub(1);
            if state.open_count > 0 {
                return false;
            }
            state.closed = true;
            std::mem::take(&mut state.endpoints)
        };

        tracing::debug!(group = %self.settings.group_name, endpoints = endpoints.len(), "closing connection pool");
        let helper = TimeoutHelper::new(timeout);
        for endpoint in endpoints.into_values() {
            endpoint.close(helper.remaining_or_zero()).await;
        }
        true
    }

    pub fn idle_count(&self) -> usize {
        self.endpoints().iter().map(|e| e.idle_count()).sum()
    }

    pub fn busy_count(&self) -> usize {
        self.endpoints().iter().map(|e| e.busy_count()).sum()
    }

    pub fn endpoint_count(&self) -> usize {
        self.state.lock().endpoints.len()
    }

    fn endpoints(&self) -> Vec<Arc<EndpointConnectionPool>> {
        self.state.lock().endpoints.values().cloned().collect()
    }
}
