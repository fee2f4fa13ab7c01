//! Client decoder for singleton (one message per direction) exchanges.
//!
//! The reply is a single unsized envelope whose body is chunked; the body is
//! handed to a [`ChunkDecoder`](crate::protocol::ChunkDecoder) at
//! `EnvelopeStart` and control comes back via
//! [`finish_envelope`](ClientSingletonDecoder::finish_envelope) once the
//! terminating zero chunk has been read:
//! ```text
//! Start -> ReadingEnvelopeRecord -> EnvelopeStart
//!       -> (chunked body) -> EnvelopeEnd -> ReadingEndRecord -> End
//! ```

use crate::error::{FramingError, Result};
use crate::protocol::decoder::{ClientFramingDecoder, ClientFramingState, DecodeResult, DecoderCore};
use crate::protocol::record::validate_record_type;
use crate::protocol::wire_format::RecordType;

/// Incremental decoder for the server side of a singleton exchange.
#[derive(Debug)]
pub struct ClientSingletonDecoder {
    core: DecoderCore,
}

impl Default for ClientSingletonDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSingletonDecoder {
    pub fn new() -> Self {
        Self {
            core: DecoderCore::new(),
        }
    }

    /// Mark the chunked body as fully read.
    ///
    /// Only valid in `EnvelopeStart`.
    pub fn finish_envelope(&mut self) -> Result<()> {
        if self.core.state != ClientFramingState::EnvelopeStart {
            return Err(FramingError::Protocol(format!(
                "cannot finish an envelope in state {}",
                self.core.state.name()
            )));
        }
        self.core.state = ClientFramingState::EnvelopeEnd;
        Ok(())
    }

    fn step(core: &mut DecoderCore, buf: &[u8]) -> Result<DecodeResult> {
        use ClientFramingState::*;
        match core.state {
            ReadingUpgradeRecord | UpgradeResponse | ReadingAckRecord => core.decode_handshake(buf),
            ReadingFaultString | Fault | ReadingEndRecord | End => core.decode_fault_tail(buf),
            Start => {
                core.state = ReadingEnvelopeRecord;
                Ok(DecodeResult::Progress(0))
            }
            ReadingEnvelopeRecord => {
                let Some(&byte) = buf.first() else {
                    return Ok(DecodeResult::NeedMoreData);
                };
                if byte == RecordType::End.as_byte() {
                    core.state = End;
                } else if byte == RecordType::Fault.as_byte() {
                    core.begin_fault();
                } else {
                    validate_record_type(RecordType::UnsizedEnvelope, byte)?;
                    core.state = EnvelopeStart;
                }
                Ok(DecodeResult::Progress(1))
            }
            EnvelopeStart => Err(FramingError::Protocol(
                "the envelope body must be read by a chunk decoder".into(),
            )),
            EnvelopeEnd => {
                core.state = ReadingEndRecord;
                Ok(DecodeResult::Progress(0))
            }
            ReadingEnvelopeSize | ReadingEnvelopeBytes => Err(FramingError::Protocol(format!(
                "{} is not used by singleton framing",
                core.state.name()
            ))),
        }
    }
}

impl ClientFramingDecoder for ClientSingletonDecoder {
    fn decode(&mut self, buf: &[u8]) -> Result<DecodeResult> {
        self.core.run(|core| Self::step(core, buf))
    }

    #[inline]
    fn current_state(&self) -> ClientFramingState {
        self.core.state
    }

    #[inline]
    fn stream_position(&self) -> u64 {
        self.core.stream_position
    }

    fn fault(&self) -> Option<&str> {
        self.core.fault.as_deref()
    }
}
