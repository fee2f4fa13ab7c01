//! Client decoder for duplex sessions.
//!
//! After the handshake the server sends a sequence of sized envelopes and
//! finishes with `End`, or sends a fault at any record boundary:
//! ```text
//! Start -> ReadingEnvelopeRecord -> ReadingEnvelopeSize -> EnvelopeStart
//!       -> ReadingEnvelopeBytes -> EnvelopeEnd -> ReadingEnvelopeRecord ...
//! ```

use crate::error::{FramingError, Result};
use crate::protocol::decoder::{ClientFramingDecoder, ClientFramingState, DecodeResult, DecoderCore};
use crate::protocol::record::validate_record_type;
use crate::protocol::varint::IntDecoder;
use crate::protocol::wire_format::RecordType;

/// Incremental decoder for the server side of a duplex session.
#[derive(Debug)]
pub struct ClientDuplexDecoder {
    core: DecoderCore,
    size_decoder: IntDecoder,
    envelope_size: usize,
    bytes_needed: usize,
    max_buffer_size: usize,
}

impl ClientDuplexDecoder {
    /// Create a decoder that rejects envelopes above `max_buffer_size`.
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            core: DecoderCore::new(),
            size_decoder: IntDecoder::new(),
            envelope_size: 0,
            bytes_needed: 0,
            max_buffer_size,
        }
    }

    /// Size of the current envelope, valid from `EnvelopeStart` on.
    #[inline]
    pub fn envelope_size(&self) -> usize {
        self.envelope_size
    }

    fn step(
        core: &mut DecoderCore,
        size_decoder: &mut IntDecoder,
        envelope_size: &mut usize,
        bytes_needed: &mut usize,
        max_buffer_size: usize,
        buf: &[u8],
    ) -> Result<DecodeResult> {
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
                    validate_record_type(RecordType::SizedEnvelope, byte)?;
                    size_decoder.reset();
                    core.state = ReadingEnvelopeSize;
                }
                Ok(DecodeResult::Progress(1))
            }
            ReadingEnvelopeSize => {
                if buf.is_empty() {
                    return Ok(DecodeResult::NeedMoreData);
                }
                let consumed = size_decoder.decode(buf)?;
                if let Some(size) = size_decoder.value() {
                    let size = size as usize;
                    if size > max_buffer_size {
                        return Err(FramingError::MessageTooLarge {
                            size: size as u64,
                            max: max_buffer_size as u64,
                        });
                    }
                    *envelope_size = size;
                    *bytes_needed = size;
                    core.state = EnvelopeStart;
                }
                Ok(DecodeResult::Progress(consumed))
            }
            EnvelopeStart => {
                core.state = ReadingEnvelopeBytes;
                Ok(DecodeResult::Progress(0))
            }
            ReadingEnvelopeBytes => {
                if *bytes_needed == 0 {
                    core.state = EnvelopeEnd;
                    return Ok(DecodeResult::Progress(0));
                }
                if buf.is_empty() {
                    return Ok(DecodeResult::NeedMoreData);
                }
                let take = (*bytes_needed).min(buf.len());
                *bytes_needed -= take;
                if *bytes_needed == 0 {
                    core.state = EnvelopeEnd;
                }
                Ok(DecodeResult::Progress(take))
            }
            EnvelopeEnd => {
                core.state = ReadingEnvelopeRecord;
                Ok(DecodeResult::Progress(0))
            }
        }
    }
}

impl ClientFramingDecoder for ClientDuplexDecoder {
    fn decode(&mut self, buf: &[u8]) -> Result<DecodeResult> {
        let Self {
            core,
            size_decoder,
            envelope_size,
            bytes_needed,
            max_buffer_size,
        } = self;
        let max_buffer_size = *max_buffer_size;
        core.run(|core| {
            Self::step(core, size_decoder, envelope_size, bytes_needed, max_buffer_size, buf)
        })
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
