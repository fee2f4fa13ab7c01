//! Connection pooling.
//!
//! ```text
//! ConnectionPoolRegistry ── group name ──► [ConnectionPool, ...]
//!        ConnectionPool ── pool key ───► EndpointConnectionPool
//! EndpointConnectionPool ── idle (LIFO, bounded) + busy ids + idle sweeper
//! ```
//!
//! A connection is owned by exactly one caller while busy. Callers take an
//! idle connection or establish a new one, then hand it back with
//! `return_connection`, saying whether it is still usable. Pool locks are
//! never held across I/O; connections leaving the pool are closed after the
//! lock is released.

mod connection_pool;
mod endpoint;
mod idle;
mod registry;

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::transport::{BoxedConnection, Connection};
use crate::upgrade::RemoteIdentity;

pub use connection_pool::{ConnectionPool, PRUNE_THRESHOLD};
pub use registry::ConnectionPoolRegistry;

static NEXT_POOLED_ID: AtomicU64 = AtomicU64::new(1);

/// A connection that finished its preamble and may be pooled.
pub struct PooledConnection {
    id: u64,
    created_at: Instant,
    connection: BoxedConnection,
    remote_identity: Option<RemoteIdentity>,
}

impl PooledConnection {
    pub fn new(connection: BoxedConnection, remote_identity: Option<RemoteIdentity>) -> Self {
        Self {
            id: NEXT_POOLED_ID.fetch_add(1, Ordering::Relaxed),
            created_at: Instant::now(),
            connection,
            remote_identity,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Identity established by the upgrade that opened this connection.
    #[inline]
    pub fn remote_identity(&self) -> Option<&RemoteIdentity> {
        self.remote_identity.as_ref()
    }

    pub fn into_inner(self) -> BoxedConnection {
        self.connection
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref()
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("remote_identity", &self.remote_identity)
            .finish_non_exhaustive()
    }
}

/// Close gracefully within `timeout`, aborting if that fails.
pub(crate) async fn close_or_abort(connection: PooledConnection, timeout: Duration) {
    if let Err(e) = connection.close(timeout).await {
        tracing::debug!(connection = connection.id, error = %e, "graceful close failed; aborting");
        connection.abort();
    }
}

/// Close connections on a background task.
///
/// Outside a runtime the connections are aborted instead.
pub(crate) fn close_in_background(connections: Vec<PooledConnection>, timeout: Duration) {
    if connections.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                for connection in connections {
                    close_or_abort(connection, timeout).await;
                }
            });
        }
        Err(_) => {
            for connection in connections {
                connection.abort();
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::probe_connection;
    use super::*;

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (a, _) = probe_connection();
        let (b, _) = probe_connection();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_close_or_abort_closes() {
        let (connection, probe) = probe_connection();
        close_or_abort(connection, Duration::from_secs(1)).await;
        assert_eq!(probe.closed(), 1);
        assert!(!probe.aborted());
    }

    #[test]
    fn test_close_outside_runtime_aborts() {
        let (connection, probe) = probe_connection();
        close_in_background(vec![connection], Duration::from_secs(1));
        assert!(probe.aborted());
    }
}
