//! [`Connection`] over any tokio byte stream.
//!
//! The stream is split into read and write halves, each behind its own lock,
//! so one read and one write can be in flight at the same time. Aborting
//! signals every in-flight operation through a `watch` channel and drops
//! whatever halves are not currently in use.
//!
//! # Example
//!
//! ```ignore
//! use netframe_client::transport::{Connection, StreamConnection};
//!
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:808").await?;
//! let connection = StreamConnection::new(stream);
//! connection.write(b"\x00\x01\x00", true, timeout).await?;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};

use super::Connection;
use crate::error::{FramingError, Result};

/// Any stream a [`StreamConnection`] can wrap.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type BoxedStream = Box<dyn ByteStream>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A connection over a split byte stream.
pub struct StreamConnection {
    id: u64,
    reader: Mutex<Option<ReadHalf<BoxedStream>>>,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    abort_signal: watch::Sender<bool>,
    closed: AtomicBool,
}

impl StreamConnection {
    pub fn new<S: ByteStream>(stream: S) -> Self {
        let boxed: BoxedStream = Box::new(stream);
        let (reader, writer) = tokio::io::split(boxed);
        let (abort_signal, _) = watch::channel(false);
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            abort_signal,
            closed: AtomicBool::new(false),
        }
    }

    /// Process-unique identifier, used in log events.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the connection was aborted or closed.
    pub fn is_torn_down(&self) -> bool {
        *self.abort_signal.borrow()
    }

    fn closed_error(&self) -> FramingError {
        if self.closed.load(Ordering::Acquire) {
            FramingError::ConnectionClosed
        } else {
            FramingError::ConnectionAborted
        }
    }

    /// Run one I/O operation under `timeout`, racing the abort signal.
    async fn run_io<T, F>(&self, timeout: Duration, io: F) -> Result<T>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        let abort_rx = self.abort_signal.subscribe();
        let outcome = tokio::select! {
            biased;
            _ = wait_for_abort(abort_rx) => return Err(self.closed_error()),
            result = tokio::time::timeout(timeout, io) => result,
        };
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                tracing::debug!(connection = self.id, ?timeout, "I/O operation timed out");
                Err(FramingError::Timeout(timeout))
            }
        }
    }
}

async fn wait_for_abort(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|aborted| *aborted).await;
}

#[async_trait]
impl Connection for StreamConnection {
    async fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or_else(|| self.closed_error())?;
        let result = self.run_io(timeout, reader.read(buf)).await;
        if result.is_err() {
            guard.take();
            drop(guard);
            self.abort();
        }
        result
    }

    async fn write(&self, buf: &[u8], _immediate: bool, timeout: Duration) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.closed_error())?;
        let result = self
            .run_io(timeout, async {
                writer.write_all(buf).await?;
                writer.flush().await
            })
            .await;
        if result.is_err() {
            guard.take();
            drop(guard);
            self.abort();
        }
        result
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            if self.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            return Err(FramingError::ConnectionAborted);
        };
        let result = self.run_io(timeout, writer.shutdown()).await;
        guard.take();
        drop(guard);

        match result {
            Ok(()) => {
                self.closed.store(true, Ordering::Release);
                self.abort_signal.send_replace(true);
                if let Ok(mut reader) = self.reader.try_lock() {
                    reader.take();
                }
                tracing::debug!(connection = self.id, "connection closed");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(connection = self.id, error = %e, "graceful close failed; aborting");
                self.abort();
                Err(e)
            }
        }
    }

    fn abort(&self) {
        if !self.abort_signal.send_replace(true) {
            tracing::debug!(connection = self.id, "connection aborted");
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }
}
