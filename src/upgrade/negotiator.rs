//! Client side of the preamble exchange.
//!
//! Every step of the exchange draws on one [`TimeoutHelper`], so a single
//! open timeout covers the preamble write, every upgrade round trip and the
//! ack. Any failure aborts the connection: a peer that did not finish the
//! handshake is in an unknown protocol state.

use crate::error::{FramingError, Result};
use crate::protocol::{ClientFramingDecoder, ClientFramingState, DecodeResult, Record, RecordType};
use crate::protocol::single_byte;
use crate::timeout::TimeoutHelper;
use crate::transport::{read_byte, BoxedConnection, Connection};
use crate::upgrade::{Handshake, StreamUpgradeProvider};
use crate::via::Via;

/// Send the preamble on a fresh connection and wait for the ack.
///
/// With an upgrade provider, `preamble` must stop before `PreambleEnd`;
/// each upgrade the initiator asks for is requested and run before
/// `PreambleEnd` is written.
pub async fn send_preamble<D: ClientFramingDecoder>(
    connection: BoxedConnection,
    preamble: &[u8],
    upgrade: Option<&dyn StreamUpgradeProvider>,
    via: &Via,
    decoder: &mut D,
    helper: &TimeoutHelper,
) -> Result<Handshake> {
    let mut connection = connection;
    let mut remote_identity = None;

    abort_on_error(connection.as_ref(), async {
        connection
            .write(preamble, upgrade.is_none(), helper.remaining()?)
            .await
    }
    .await)?;

    if let Some(provider) = upgrade {
        let mut initiator = provider.create_initiator(via);
        while let Some(content_type) = initiator.next_upgrade() {
            abort_on_error(
                connection.as_ref(),
                request_upgrade(connection.as_ref(), &content_type, decoder, helper).await,
            )?;
            let remaining = abort_on_error(connection.as_ref(), helper.remaining())?;

            tracing::debug!(via = %via, upgrade = %content_type, "starting stream upgrade");
            let (upgraded, identity) = initiator.initiate_upgrade(connection, remaining).await?;
            connection = upgraded;
            if identity.is_some() {
                remote_identity = identity;
            }
        }

        abort_on_error(connection.as_ref(), async {
            let end = single_byte(RecordType::PreambleEnd);
            connection.write(&end, true, helper.remaining()?).await
        }
        .await)?;
    }

    abort_on_error(
        connection.as_ref(),
        read_ack(connection.as_ref(), decoder, helper).await,
    )?;

    tracing::debug!(via = %via, identity = ?remote_identity, "preamble acknowledged");
    Ok(Handshake {
        connection,
        remote_identity,
    })
}

/// Send the full preamble on a pooled connection and wait for the ack.
///
/// Pooled connections were upgraded when first opened, so no upgrade
/// records are sent.
pub async fn resend_preamble<D: ClientFramingDecoder>(
    connection: &dyn Connection,
    preamble: &[u8],
    decoder: &mut D,
    helper: &TimeoutHelper,
) -> Result<()> {
    let result = async {
        connection.write(preamble, true, helper.remaining()?).await?;
        read_ack(connection, decoder, helper).await
    }
    .await;
    abort_on_error(connection, result)
}

fn abort_on_error<T>(connection: &dyn Connection, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        tracing::debug!(error = %e, "preamble exchange failed; aborting connection");
        connection.abort();
    }
    result
}

async fn request_upgrade<D: ClientFramingDecoder>(
    connection: &dyn Connection,
    content_type: &str,
    decoder: &mut D,
    helper: &TimeoutHelper,
) -> Result<()> {
    let request = Record::UpgradeRequest(content_type.to_string()).to_bytes()?;
    connection.write(&request, true, helper.remaining()?).await?;

    let byte = read_byte(connection, helper.remaining()?).await?;
    feed_byte(decoder, byte)?;
    match decoder.current_state() {
        ClientFramingState::UpgradeResponse => Ok(()),
        ClientFramingState::ReadingFaultString => Err(read_fault(connection, decoder, helper).await),
        ClientFramingState::Start => Err(FramingError::UpgradeFailed(format!(
            "server acknowledged the preamble without accepting upgrade '{content_type}'"
        ))),
        other => Err(FramingError::Protocol(format!(
            "unexpected state {} after upgrade request",
            other.name()
        ))),
    }
}

async fn read_ack<D: ClientFramingDecoder>(
    connection: &dyn Connection,
    decoder: &mut D,
    helper: &TimeoutHelper,
) -> Result<()> {
    let byte = read_byte(connection, helper.remaining()?).await?;
    feed_byte(decoder, byte)?;
    match decoder.current_state() {
        ClientFramingState::Start => Ok(()),
        ClientFramingState::ReadingFaultString => Err(read_fault(connection, decoder, helper).await),
        other => Err(FramingError::Protocol(format!(
            "unexpected state {} while waiting for the preamble ack",
            other.name()
        ))),
    }
}

/// Step the decoder until it consumes `byte`.
fn feed_byte<D: ClientFramingDecoder>(decoder: &mut D, byte: u8) -> Result<()> {
    loop {
        match decoder.decode(&[byte])? {
            DecodeResult::Progress(0) => continue,
            DecodeResult::NeedMoreData => {
                return Err(FramingError::Protocol(format!(
                    "decoder stalled in state {}",
                    decoder.current_state().name()
                )))
            }
            DecodeResult::Progress(_) | DecodeResult::Fault { .. } => return Ok(()),
        }
    }
}

/// Read the fault string byte by byte and map it to an error.
///
/// Reading one byte at a time leaves whatever follows the fault unread.
async fn read_fault<D: ClientFramingDecoder>(
    connection: &dyn Connection,
    decoder: &mut D,
    helper: &TimeoutHelper,
) -> FramingError {
    let fault = async {
        loop {
            let byte = read_byte(connection, helper.remaining()?).await?;
            if let DecodeResult::Fault { fault, .. } = decoder.decode(&[byte])? {
                return Ok::<_, FramingError>(fault);
            }
        }
    }
    .await;

    match fault {
        Ok(fault) => {
            tracing::debug!(fault = %fault, "server rejected the preamble");
            FramingError::from_fault(&fault)
        }
        Err(e) => e,
    }
}
