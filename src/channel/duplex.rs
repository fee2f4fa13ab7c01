//! Duplex session channel.
//!
//! ```text
//! client                                server
//!   │── preamble (Mode=Duplex) ───────────►│
//!   │◄──────────────────────── PreambleAck │
//!   │── SizedEnvelope ... ────────────────►│
//!   │◄──────────────────── SizedEnvelope ..│
//!   │── End ──────────────────────────────►│
//!   │◄──────────────────────────────── End │
//! ```
//!
//! The read side (decoder and pending input) and the write side sit behind
//! separate locks, so one send and one receive can be in flight together.
//! After both `End` records the connection sits at a record boundary and
//! goes back to the pool for the next session.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use super::{ChannelCore, ChannelState, InputBuffer};
use crate::codec::MessageCodec;
use crate::error::{FramingError, Result};
use crate::pool::PooledConnection;
use crate::protocol::{
    single_byte, ClientDuplexDecoder, ClientFramingDecoder, ClientFramingState, DecodeResult,
    Record, RecordType,
};
use crate::timeout::TimeoutHelper;
use crate::upgrade::RemoteIdentity;

struct ReadSide {
    decoder: ClientDuplexDecoder,
    input: InputBuffer,
    /// The server's `End` was read.
    ended: bool,
}

struct WriteSide {
    /// Our `End` was written.
    ended: bool,
}

/// A session of sized envelopes over one connection.
///
/// Any failed operation faults the channel and aborts its connection, which
/// also fails the other in-flight operation. A faulted channel only accepts
/// `close` and `abort`.
pub struct DuplexSessionChannel<C: MessageCodec> {
    core: Arc<ChannelCore<C>>,
    state: Mutex<ChannelState>,
    connection: Mutex<Option<Arc<PooledConnection>>>,
    reader: AsyncMutex<ReadSide>,
    writer: AsyncMutex<WriteSide>,
}

impl<C: MessageCodec> DuplexSessionChannel<C> {
    pub(crate) fn new(core: Arc<ChannelCore<C>>) -> Self {
        let reader = ReadSide {
            decoder: ClientDuplexDecoder::new(Self::envelope_limit(&core)),
            input: InputBuffer::new(core.settings.connection_buffer_size),
            ended: false,
        };
        Self {
            core,
            state: Mutex::new(ChannelState::Created),
            connection: Mutex::new(None),
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(WriteSide { ended: false }),
        }
    }

    fn envelope_limit(core: &ChannelCore<C>) -> usize {
        core.settings
            .max_buffer_size
            .min(core.settings.max_received_message_size)
    }

    #[inline]
    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    /// Identity the server proved during the upgrade, if any.
    pub fn remote_identity(&self) -> Option<RemoteIdentity> {
        self.connection.lock().as_ref()?.remote_identity().cloned()
    }

    /// Get a connection and complete the preamble exchange.
    pub async fn open(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let mut reader = self.reader.lock().await;
        let state = self.state();
        if state != ChannelState::Created {
            return Err(FramingError::InvalidOperation(format!(
                "cannot open a channel in state {state:?}"
            )));
        }

        let helper = TimeoutHelper::new(self.core.settings.open_timeout);
        let limit = Self::envelope_limit(&self.core);
        let result = self
            .core
            .establish(&self.core.duplex_preamble, || ClientDuplexDecoder::new(limit), &helper)
            .await;
        match result {
            Ok((connection, decoder)) => {
                tracing::debug!(via = %self.core.via, connection = connection.id(), "duplex session opened");
                reader.decoder = decoder;
                reader.ended = false;
                writer.ended = false;
                *self.connection.lock() = Some(Arc::new(connection));
                *self.state.lock() = ChannelState::Opened;
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = ChannelState::Faulted;
                Err(e)
            }
        }
    }

    /// Send one message as a sized envelope.
    ///
    /// May run while a [`receive`](Self::receive) is pending.
    pub async fn send(&self, message: &C::Message) -> Result<()> {
        self.ensure_opened()?;
        let body = self.core.codec.encode(message)?;
        let record = Record::SizedEnvelope(body).to_bytes()?;

        let writer = self.writer.lock().await;
        self.ensure_opened()?;
        if writer.ended {
            return Err(FramingError::InvalidOperation(
                "session output already ended".into(),
            ));
        }
        let connection = self.current_connection()?;
        let immediate = !self.core.settings.buffered_writes;
        let result = connection
            .write(&record, immediate, self.core.settings.send_timeout)
            .await;
        drop(connection);
        drop(writer);
        self.check(result)
    }

    /// Receive the next message, or `None` once the server ended its side.
    ///
    /// May run while a [`send`](Self::send) is pending.
    pub async fn receive(&self) -> Result<Option<C::Message>> {
        self.ensure_opened()?;
        let mut reader = self.reader.lock().await;
        self.ensure_opened()?;
        let connection = self.current_connection()?;
        let helper = TimeoutHelper::new(self.core.settings.receive_timeout);
        let result = self.read_envelope(&mut reader, &connection, &helper).await;
        drop(connection);
        drop(reader);
        match self.check(result)? {
            Some(body) => self.core.codec.decode(body).map(Some),
            None => Ok(None),
        }
    }

    /// End the session and hand the connection back to the pool.
    ///
    /// Writes `End`, then discards incoming messages until the server's
    /// `End`; a pending receive sees that `End` first. Closing a faulted
    /// channel aborts whatever is left.
    pub async fn close(&self) -> Result<()> {
        if self.settle_close() {
            return Ok(());
        }

        let helper = TimeoutHelper::new(self.core.settings.close_timeout);
        let mut writer = self.writer.lock().await;
        if self.settle_close() {
            return Ok(());
        }
        let result = self.end_output(&mut writer, &helper).await;
        self.check(result)?;
        let mut reader = self.reader.lock().await;
        if self.settle_close() {
            return Ok(());
        }
        let result = self.drain_input(&mut reader, &helper).await;
        self.check(result)?;

        let taken = self.connection.lock().take();
        if let Some(connection) = taken {
            match Arc::try_unwrap(connection) {
                Ok(connection) => {
                    let reusable = reader.input.is_empty();
                    tracing::debug!(via = %self.core.via, connection = connection.id(), reusable, "duplex session closed");
                    self.core
                        .pool
                        .return_connection(&self.core.pool_key, connection, reusable, helper.remaining_or_zero())
                        .await;
                }
                Err(connection) => {
                    tracing::debug!(via = %self.core.via, connection = connection.id(), "connection still shared at close; discarding");
                    self.core.pool.discard_connection(&self.core.pool_key, &connection);
                }
            }
        }
        *self.state.lock() = ChannelState::Closed;
        Ok(())
    }

    /// Drop the connection without any further I/O.
    pub fn abort(&self) {
        self.release_connection();
        let mut state = self.state.lock();
        if *state != ChannelState::Faulted {
            *state = ChannelState::Closed;
        }
    }

    /// Finish a close that needs no I/O; `false` when the session is open.
    fn settle_close(&self) -> bool {
        let state = self.state();
        match state {
            ChannelState::Opened => false,
            ChannelState::Created | ChannelState::Closed => {
                *self.state.lock() = ChannelState::Closed;
                true
            }
            ChannelState::Faulted => {
                self.abort();
                true
            }
        }
    }

    fn ensure_opened(&self) -> Result<()> {
        match self.state() {
            ChannelState::Opened => Ok(()),
            ChannelState::Faulted => Err(FramingError::ChannelFaulted),
            other => Err(FramingError::InvalidOperation(format!(
                "channel is not open (state {other:?})"
            ))),
        }
    }

    fn current_connection(&self) -> Result<Arc<PooledConnection>> {
        self.connection
            .lock()
            .as_ref()
            .map(Arc::clone)
            .ok_or(FramingError::ChannelFaulted)
    }

    /// Fault the channel when `result` is an error.
    fn check<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            tracing::debug!(via = %self.core.via, error = %e, "duplex session faulted");
            *self.state.lock() = ChannelState::Faulted;
            self.release_connection();
        }
        result
    }

    fn release_connection(&self) {
        let taken = self.connection.lock().take();
        if let Some(connection) = taken {
            self.core.pool.discard_connection(&self.core.pool_key, &connection);
        }
    }

    async fn end_output(&self, writer: &mut WriteSide, helper: &TimeoutHelper) -> Result<()> {
        if writer.ended {
            return Ok(());
        }
        let connection = self.current_connection()?;
        connection
            .write(&single_byte(RecordType::End), true, helper.remaining()?)
            .await?;
        writer.ended = true;
        Ok(())
    }

    async fn drain_input(&self, reader: &mut ReadSide, helper: &TimeoutHelper) -> Result<()> {
        let connection = self.current_connection()?;
        while let Some(body) = self.read_envelope(reader, &connection, helper).await? {
            tracing::warn!(
                via = %self.core.via,
                bytes = body.len(),
                "discarding message received while closing the session"
            );
        }
        Ok(())
    }

    /// Decode until one envelope body is complete or the server's `End`.
    async fn read_envelope(
        &self,
        reader: &mut ReadSide,
        connection: &PooledConnection,
        helper: &TimeoutHelper,
    ) -> Result<Option<Bytes>> {
        if reader.ended {
            return Ok(None);
        }

        let mut body = BytesMut::new();
        loop {
            let before = reader.decoder.current_state();
            match reader.decoder.decode(reader.input.pending())? {
                DecodeResult::NeedMoreData => {
                    reader.input.fill(&**connection, before.name(), helper).await?;
                    continue;
                }
                DecodeResult::Progress(n) => {
                    let data = reader.input.split_to(n);
                    if before == ClientFramingState::ReadingEnvelopeBytes {
                        body.unsplit(data);
                    }
                }
                DecodeResult::Fault { consumed, fault } => {
                    reader.input.advance(consumed);
                    tracing::debug!(via = %self.core.via, fault = %fault, "server faulted the session");
                    self.end_after_fault(connection, helper).await;
                    return Err(FramingError::from_fault(&fault));
                }
            }

            match reader.decoder.current_state() {
                ClientFramingState::EnvelopeEnd => return Ok(Some(body.freeze())),
                ClientFramingState::End => {
                    reader.ended = true;
                    return Ok(None);
                }
                _ => {}
            }
        }
    }

    /// Close our output side before surfacing a server fault.
    ///
    /// Skipped while a send holds the write side; the connection is aborted
    /// right after either way.
    async fn end_after_fault(&self, connection: &PooledConnection, helper: &TimeoutHelper) {
        let Ok(mut writer) = self.writer.try_lock() else {
            return;
        };
        if writer.ended {
            return;
        }
        let end = single_byte(RecordType::End);
        match connection.write(&end, true, helper.remaining_or_zero()).await {
            Ok(()) => writer.ended = true,
            Err(e) => tracing::debug!(error = %e, "could not write End after fault"),
        }
    }
}

impl<C: MessageCodec> Drop for DuplexSessionChannel<C> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            self.core.pool.discard_connection(&self.core.pool_key, &connection);
        }
    }
}

impl<C: MessageCodec> std::fmt::Debug for DuplexSessionChannel<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexSessionChannel")
            .field("via", &self.core.via)
            .field("state", &self.state())
            .field("connection", &*self.connection.lock())
            .finish_non_exhaustive()
    }
}
