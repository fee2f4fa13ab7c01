//! Write batching over another [`Connection`].
//!
//! Small writes are collected in a buffer and sent as one write to the inner
//! connection when:
//! - the buffer fills up,
//! - a write asks for `immediate`, or
//! - the flush delay elapses after the first buffered write.
//!
//! ```text
//! write(a) ─┐
//! write(b) ─┼─► BytesMut ──(full | immediate | timer)──► inner.write(a+b+c)
//! write(c) ─┘
//! ```
//!
//! A failed timer flush has no caller to report to, so the error is kept and
//! returned from the next `write` or `close`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

use super::{BoxedConnection, Connection};
use crate::error::{FramingError, Result};
use crate::timeout::TimeoutHelper;

/// Default write buffer capacity.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 8 * 1024;

/// Default delay before buffered bytes are flushed.
pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(200);

struct WriteState {
    buffer: BytesMut,
    flush_timer: Option<JoinHandle<()>>,
    pending_error: Option<FramingError>,
}

struct Shared {
    inner: BoxedConnection,
    state: Mutex<WriteState>,
    capacity: usize,
    flush_delay: Duration,
}

impl Shared {
    /// Send everything buffered. Cancels a pending flush timer.
    async fn flush_locked(&self, state: &mut WriteState, timeout: Duration) -> Result<()> {
        if let Some(timer) = state.flush_timer.take() {
            timer.abort();
        }
        if state.buffer.is_empty() {
            return Ok(());
        }
        let pending = state.buffer.split().freeze();
        self.inner.write(&pending, true, timeout).await
    }

    fn arm_timer(self: &Arc<Self>, state: &mut WriteState, timeout: Duration) {
        let shared: Weak<Self> = Arc::downgrade(self);
        let delay = self.flush_delay;
        state.flush_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut state = shared.state.lock().await;
            state.flush_timer = None;
            if let Err(e) = shared.flush_locked(&mut state, timeout).await {
                tracing::warn!(error = %e, "delayed flush failed; reporting on next operation");
                state.pending_error = Some(e);
            }
        }));
    }
}

/// A connection that batches small writes.
pub struct BufferedConnection {
    shared: Arc<Shared>,
}

impl BufferedConnection {
    pub fn new(inner: BoxedConnection, capacity: usize, flush_delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner,
                state: Mutex::new(WriteState {
                    buffer: BytesMut::with_capacity(capacity),
                    flush_timer: None,
                    pending_error: None,
                }),
                capacity,
                flush_delay,
            }),
        }
    }

    /// Wrap with the default capacity and flush delay.
    pub fn with_defaults(inner: BoxedConnection) -> Self {
        Self::new(inner, DEFAULT_WRITE_BUFFER_SIZE, DEFAULT_FLUSH_DELAY)
    }

    /// Bytes currently waiting to be flushed.
    pub async fn buffered_len(&self) -> usize {
        self.shared.state.lock().await.buffer.len()
    }

    async fn lock_state(&self, helper: &TimeoutHelper) -> Result<MutexGuard<'_, WriteState>> {
        tokio::time::timeout(helper.remaining()?, self.shared.state.lock())
            .await
            .map_err(|_| FramingError::Timeout(helper.original()))
    }

    async fn close_inner(&self, helper: &TimeoutHelper) -> Result<()> {
        let mut state = self.lock_state(helper).await?;
        self.shared
            .flush_locked(&mut state, helper.remaining()?)
            .await?;
        let pending = state.pending_error.take();
        drop(state);

        self.shared.inner.close(helper.remaining()?).await?;
        match pending {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Connection for BufferedConnection {
    async fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.shared.inner.read(buf, timeout).await
    }

    async fn write(&self, buf: &[u8], immediate: bool, timeout: Duration) -> Result<()> {
        let helper = TimeoutHelper::new(timeout);
        let shared = &self.shared;
        let mut state = self.lock_state(&helper).await?;
        if let Some(e) = state.pending_error.take() {
            return Err(e);
        }

        if buf.len() >= shared.capacity {
            shared.flush_locked(&mut state, helper.remaining()?).await?;
            return shared.inner.write(buf, immediate, helper.remaining()?).await;
        }
        if state.buffer.len() + buf.len() > shared.capacity {
            shared.flush_locked(&mut state, helper.remaining()?).await?;
        }

        state.buffer.extend_from_slice(buf);
        if immediate || state.buffer.len() >= shared.capacity {
            shared.flush_locked(&mut state, helper.remaining()?).await
        } else {
            if state.flush_timer.is_none() {
                shared.arm_timer(&mut state, timeout);
            }
            Ok(())
        }
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        let helper = TimeoutHelper::new(timeout);
        let result = self.close_inner(&helper).await;
        if let Err(e) = &result {
            tracing::debug!(error = %e, "buffered close failed; aborting");
            self.shared.inner.abort();
        }
        result
    }

    fn abort(&self) {
        if let Ok(mut state) = self.shared.state.try_lock() {
            if let Some(timer) = state.flush_timer.take() {
                timer.abort();
            }
            state.buffer.clear();
        }
        self.shared.inner.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StreamConnection;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn buffered(capacity: usize, delay: Duration) -> (BufferedConnection, DuplexStream) {
        let (client, server) = duplex(4096);
        let inner: BoxedConnection = Box::new(StreamConnection::new(client));
        (BufferedConnection::new(inner, capacity, delay), server)
    }

    /// Inner connection whose writes always fail.
    struct FailingConnection;

    #[async_trait]
    impl Connection for FailingConnection {
        async fn read(&self, _buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            Ok(0)
        }

        async fn write(&self, _buf: &[u8], _immediate: bool, _timeout: Duration) -> Result<()> {
            Err(FramingError::ConnectionAborted)
        }

        async fn close(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        fn abort(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_writes_flush_after_delay() {
        let (connection, mut server) = buffered(1024, DEFAULT_FLUSH_DELAY);
        connection.write(b"ab", false, TIMEOUT).await.unwrap();
        connection.write(b"cd", false, TIMEOUT).await.unwrap();
        assert_eq!(connection.buffered_len().await, 4);

        let mut buf = [0u8; 16];
        let early = tokio::time::timeout(Duration::from_millis(10), server.read(&mut buf)).await;
        assert!(early.is_err(), "nothing should be sent before the delay");

        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        assert_eq!(connection.buffered_len().await, 0);
    }

    #[tokio::test]
    async fn test_immediate_write_flushes_buffer() {
        let (connection, mut server) = buffered(1024, Duration::from_secs(3600));
        connection.write(b"ab", false, TIMEOUT).await.unwrap();
        connection.write(b"cd", true, TIMEOUT).await.unwrap();

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[tokio::test]
    async fn test_overflow_flushes_previous_bytes() {
        let (connection, mut server) = buffered(4, Duration::from_secs(3600));
        connection.write(b"abc", false, TIMEOUT).await.unwrap();
        connection.write(b"de", false, TIMEOUT).await.unwrap();

        let mut buf = [0u8; 3];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
        assert_eq!(connection.buffered_len().await, 2);
    }

    #[tokio::test]
    async fn test_large_write_passes_through() {
        let (connection, mut server) = buffered(4, Duration::from_secs(3600));
        connection.write(b"x", false, TIMEOUT).await.unwrap();
        connection.write(b"0123456789", false, TIMEOUT).await.unwrap();

        let mut buf = [0u8; 11];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x0123456789");
        assert_eq!(connection.buffered_len().await, 0);
    }

    #[tokio::test]
    async fn test_close_flushes_and_shuts_down() {
        let (connection, mut server) = buffered(1024, Duration::from_secs(3600));
        connection.write(b"bye", false, TIMEOUT).await.unwrap();
        connection.close(TIMEOUT).await.unwrap();

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_error_surfaces_on_next_write() {
        let connection =
            BufferedConnection::new(Box::new(FailingConnection), 1024, Duration::from_millis(50));
        connection.write(b"x", false, TIMEOUT).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = connection.write(b"y", false, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, FramingError::ConnectionAborted));
        // Reported once.
        connection.write(b"z", false, TIMEOUT).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_error_surfaces_on_close() {
        let connection =
            BufferedConnection::new(Box::new(FailingConnection), 1024, Duration::from_millis(50));
        connection.write(b"x", false, TIMEOUT).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(connection.close(TIMEOUT).await.is_err());
    }

    #[tokio::test]
    async fn test_abort_discards_buffer() {
        let (connection, _server) = buffered(1024, Duration::from_secs(3600));
        connection.write(b"lost", false, TIMEOUT).await.unwrap();
        connection.abort();
        assert_eq!(connection.buffered_len().await, 0);
        assert!(connection.write(b"x", true, TIMEOUT).await.is_err());
    }
}
