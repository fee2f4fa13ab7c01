//! Per-endpoint pool: idle connections, busy ids and the idle sweeper.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::idle::IdleConnectionPool;
use super::{close_in_background, close_or_abort, PooledConnection};
use crate::config::PoolSettings;
use crate::timeout::TimeoutHelper;

#[derive(Debug)]
struct EndpointState {
    idle: IdleConnectionPool,
    busy: HashSet<u64>,
    closed: bool,
    sweeper: Option<JoinHandle<()>>,
}

/// Connections to one endpoint.
#[derive(Debug)]
pub(crate) struct EndpointConnectionPool {
    key: String,
    idle_timeout: Duration,
    lease_timeout: Duration,
    state: Mutex<EndpointState>,
}

impl EndpointConnectionPool {
    pub(crate) fn new(key: impl Into<String>, settings: &PoolSettings) -> Self {
        Self {
            key: key.into(),
            idle_timeout: settings.idle_timeout,
            lease_timeout: settings.lease_timeout,
            state: Mutex::new(EndpointState {
                idle: IdleConnectionPool::new(
                    settings.max_outbound_connections_per_endpoint,
                    settings.idle_timeout,
                    settings.lease_timeout,
                ),
                busy: HashSet::new(),
                closed: false,
                sweeper: None,
            }),
        }
    }

    /// Budget for closing a connection evicted from the idle set.
    fn eviction_budget(&self) -> Duration {
        self.idle_timeout / 2
    }

    /// Take an idle connection and mark it busy.
    pub(crate) fn take(&self, timeout: Duration) -> Option<PooledConnection> {
        let (taken, stale) = {
            let mut state = self.state.lock();
            if state.closed {
                return None;
            }
            let (taken, stale) = state.idle.take(Instant::now());
            if let Some(connection) = &taken {
                state.busy.insert(connection.id());
            }
            (taken, stale)
        };

        if !stale.is_empty() {
            tracing::debug!(endpoint = %self.key, count = stale.len(), "dropping stale idle connections");
        }
        close_in_background(stale, timeout.min(self.eviction_budget()));
        if let Some(connection) = &taken {
            tracing::debug!(endpoint = %self.key, connection = connection.id(), "reusing pooled connection");
        }
        taken
    }

    /// Mark a freshly established connection as busy.
    pub(crate) fn track(&self, connection: &PooledConnection) {
        self.state.lock().busy.insert(connection.id());
    }

    /// Hand a busy connection back.
    ///
    /// Unusable connections and connections returned after close are
    /// aborted. Usable ones are parked, or closed gracefully when the idle
    /// set is full or their lease has run out.
    pub(crate) async fn return_connection(
        self: &Arc<Self>,
        connection: PooledConnection,
        usable: bool,
        timeout: Duration,
    ) {
        let now = Instant::now();
        let rejected = {
            let mut state = self.state.lock();
            let was_busy = state.busy.remove(&connection.id());
            if !was_busy {
                tracing::warn!(
                    endpoint = %self.key,
                    connection = connection.id(),
                    "returned connection was not taken from this pool"
                );
            }

            if !usable || state.closed {
                drop(state);
                tracing::debug!(endpoint = %self.key, connection = connection.id(), usable, "aborting returned connection");
                connection.abort();
                return;
            }
            if state.idle.lease_expired(&connection, now) {
                Some(connection)
            } else {
                match state.idle.push(connection, now) {
                    Ok(()) => {
                        self.ensure_sweeper(&mut state);
                        None
                    }
                    Err(connection) => Some(connection),
                }
            }
        };

        if let Some(connection) = rejected {
            tracing::debug!(endpoint = %self.key, connection = connection.id(), "closing connection the pool cannot keep");
            close_or_abort(connection, timeout).await;
        }
    }

    /// Forget a busy connection and abort it without touching the idle set.
    ///
    /// Borrows the connection: in-flight operations may still hold it and
    /// are woken by the abort.
    pub(crate) fn discard(&self, connection: &PooledConnection) {
        self.state.lock().busy.remove(&connection.id());
        tracing::debug!(endpoint = %self.key, connection = connection.id(), "discarding connection");
        connection.abort();
    }

    /// Seed a connection that was never taken into the idle set.
    pub(crate) async fn add(self: &Arc<Self>, connection: PooledConnection, timeout: Duration) {
        let rejected = {
            let mut state = self.state.lock();
            if state.closed {
                Some(connection)
            } else {
                match state.idle.push(connection, Instant::now()) {
                    Ok(()) => {
                        self.ensure_sweeper(&mut state);
                        None
                    }
                    Err(connection) => Some(connection),
                }
            }
        };
        if let Some(connection) = rejected {
            close_or_abort(connection, timeout).await;
        }
    }

    /// Evict expired idle connections.
    pub(crate) fn sweep(&self) {
        let stale = self.state.lock().idle.sweep(Instant::now());
        if !stale.is_empty() {
            tracing::debug!(endpoint = %self.key, count = stale.len(), "evicting expired idle connections");
        }
        close_in_background(stale, self.eviction_budget());
    }

    /// Close every idle connection; later returns are aborted.
    pub(crate) async fn close(&self, timeout: Duration) {
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            if let Some(sweeper) = state.sweeper.take() {
                sweeper.abort();
            }
            state.idle.drain()
        };

        let helper = TimeoutHelper::new(timeout);
        for connection in idle {
            match helper.remaining() {
                Ok(remaining) => close_or_abort(connection, remaining).await,
                Err(_) => connection.abort(),
            }
        }
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub(crate) fn busy_count(&self) -> usize {
        self.state.lock().busy.len()
    }

    /// No idle and no busy connections.
    pub(crate) fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.idle.is_empty() && state.busy.is_empty()
    }

    /// Start the idle sweeper if it is not running.
    ///
    /// The sweeper holds a weak reference and stops once the pool is gone.
    fn ensure_sweeper(self: &Arc<Self>, state: &mut EndpointState) {
        if state.sweeper.is_some() || state.closed || state.idle.is_empty() {
            return;
        }
        // Half the shortest timeout, so an expired connection goes within
        // one and a half timeouts even though expiry is strict.
        let period = self.idle_timeout.min(self.lease_timeout) / 2;
        if period.is_zero() || Instant::now().checked_add(period).is_none() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let pool: Weak<Self> = Arc::downgrade(self);
        state.sweeper = Some(handle.spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.sweep();
            }
        }));
        tracing::debug!(endpoint = %self.key, ?period, "idle sweeper started");
    }
}

impl Drop for EndpointConnectionPool {
    fn drop(&mut self) {
        if let Some(sweeper) = self.state.get_mut().sweeper.take() {
            sweeper.abort();
        }
    }
}
