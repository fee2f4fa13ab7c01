//! Bounded set of idle connections with idle and lease expiry.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use super::PooledConnection;

#[derive(Debug)]
struct IdleEntry {
    connection: PooledConnection,
    last_used: Instant,
}

/// Idle connections for one endpoint, most recently returned last.
#[derive(Debug)]
pub(crate) struct IdleConnectionPool {
    entries: VecDeque<IdleEntry>,
    capacity: usize,
    idle_timeout: Duration,
    lease_timeout: Duration,
}

impl IdleConnectionPool {
    pub(crate) fn new(capacity: usize, idle_timeout: Duration, lease_timeout: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            idle_timeout,
            lease_timeout,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a connection has outlived its lease.
    pub(crate) fn lease_expired(&self, connection: &PooledConnection, now: Instant) -> bool {
        now.saturating_duration_since(connection.created_at()) >= self.lease_timeout
    }

    fn is_expired(&self, entry: &IdleEntry, now: Instant) -> bool {
        let idle_expired = match entry.last_used.checked_add(self.idle_timeout) {
            Some(deadline) => now > deadline,
            None => false,
        };
        idle_expired || self.lease_expired(&entry.connection, now)
    }

    /// Park a connection; hands it back when the pool is full.
    pub(crate) fn push(
        &mut self,
        connection: PooledConnection,
        now: Instant,
    ) -> Result<(), PooledConnection> {
        if self.entries.len() >= self.capacity {
            return Err(connection);
        }
        self.entries.push_back(IdleEntry {
            connection,
            last_used: now,
        });
        Ok(())
    }

    /// Pop the most recently used live connection.
    ///
    /// Expired entries met on the way are returned separately for closing.
    pub(crate) fn take(&mut self, now: Instant) -> (Option<PooledConnection>, Vec<PooledConnection>) {
        let mut stale = Vec::new();
        while let Some(entry) = self.entries.pop_back() {
            if self.is_expired(&entry, now) {
                stale.push(entry.connection);
            } else {
                return (Some(entry.connection), stale);
            }
        }
        (None, stale)
    }

    /// Remove every expired entry.
    pub(crate) fn sweep(&mut self, now: Instant) -> Vec<PooledConnection> {
        let (stale, live): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| self.is_expired(entry, now));
        self.entries = live;
        stale.into_iter().map(|entry| entry.connection).collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<PooledConnection> {
        self.entries.drain(..).map(|entry| entry.connection).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::testing::probe_connection;

    const IDLE: Duration = Duration::from_millis(100);
    const LEASE: Duration = Duration::from_millis(500);

    #[tokio::test(start_paused = true)]
    async fn test_take_is_lifo() {
        let mut pool = IdleConnectionPool::new(4, IDLE, LEASE);
        let (a, _) = probe_connection();
        let (b, _) = probe_connection();
        let b_id = b.id();
        pool.push(a, Instant::now()).unwrap();
        pool.push(b, Instant::now()).unwrap();

        let (taken, stale) = pool.take(Instant::now());
        assert_eq!(taken.unwrap().id(), b_id);
        assert!(stale.is_empty());
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_full_returns_connection() {
        let mut pool = IdleConnectionPool::new(1, IDLE, LEASE);
        let (a, _) = probe_connection();
        let (b, _) = probe_connection();
        let b_id = b.id();
        pool.push(a, Instant::now()).unwrap();
        let rejected = pool.push(b, Instant::now()).unwrap_err();
        assert_eq!(rejected.id(), b_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_skips_idle_expired() {
        let mut pool = IdleConnectionPool::new(4, IDLE, LEASE);
        let (old, _) = probe_connection();
        pool.push(old, Instant::now()).unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;

        let (taken, stale) = pool.take(Instant::now());
        assert!(taken.is_none());
        assert_eq!(stale.len(), 1);
        assert!(pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_boundary_is_exclusive() {
        let mut pool = IdleConnectionPool::new(4, IDLE, LEASE);
        let (connection, _) = probe_connection();
        let start = Instant::now();
        pool.push(connection, start).unwrap();

        assert!(pool.sweep(start + IDLE).is_empty());
        assert_eq!(pool.sweep(start + IDLE + Duration::from_millis(1)).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_despite_activity() {
        let mut pool = IdleConnectionPool::new(4, IDLE, LEASE);
        let (connection, _) = probe_connection();
        pool.push(connection, Instant::now()).unwrap();

        // Returned every 50ms: never idle-expired, but the lease runs out.
        for _ in 0..9 {
            tokio::time::advance(Duration::from_millis(50)).await;
            let (taken, stale) = pool.take(Instant::now());
            assert!(stale.is_empty());
            pool.push(taken.unwrap(), Instant::now()).unwrap();
        }
        tokio::time::advance(Duration::from_millis(50)).await;
        let (taken, stale) = pool.take(Instant::now());
        assert!(taken.is_none());
        assert_eq!(stale.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_live_entries() {
        let mut pool = IdleConnectionPool::new(4, IDLE, LEASE);
        let (old, _) = probe_connection();
        pool.push(old, Instant::now()).unwrap();
        tokio::time::advance(Duration::from_millis(80)).await;
        let (fresh, _) = probe_connection();
        let fresh_id = fresh.id();
        pool.push(fresh, Instant::now()).unwrap();
        tokio::time::advance(Duration::from_millis(40)).await;

        let stale = pool.sweep(Instant::now());
        assert_eq!(stale.len(), 1);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.drain()[0].id(), fresh_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_infinite_idle_timeout() {
        let mut pool = IdleConnectionPool::new(4, Duration::MAX, Duration::MAX);
        let (connection, _) = probe_connection();
        pool.push(connection, Instant::now()).unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(pool.sweep(Instant::now()).is_empty());
    }
}
