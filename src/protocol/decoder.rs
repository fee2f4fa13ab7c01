//! Shared surface of the client framing decoders.
//!
//! Both client decoders walk the same handshake (optional upgrade responses,
//! then the preamble ack) and the same fault tail (fault string, then `End`).
//! Those steps live on [`DecoderCore`]; each decoder owns the states in
//! between.
//!
//! A decoder advances one state per [`decode`](ClientFramingDecoder::decode)
//! call. States that carry no bytes (`UpgradeResponse`, `Start`,
//! `EnvelopeStart`, `EnvelopeEnd`, `Fault`) report `Progress(0)` and move on,
//! even for empty input, so callers can observe them between calls.

use crate::error::{FramingError, Result};
use crate::protocol::record::{validate_preamble_ack, validate_record_type};
use crate::protocol::string_decoder::{StringDecoder, StringKind};
use crate::protocol::wire_format::RecordType;

/// States of the client framing decoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientFramingState {
    ReadingUpgradeRecord,
    UpgradeResponse,
    ReadingAckRecord,
    Start,
    ReadingFaultString,
    Fault,
    ReadingEnvelopeRecord,
    ReadingEnvelopeSize,
    EnvelopeStart,
    ReadingEnvelopeBytes,
    EnvelopeEnd,
    ReadingEndRecord,
    End,
}

impl ClientFramingState {
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadingUpgradeRecord => "ReadingUpgradeRecord",
            Self::UpgradeResponse => "UpgradeResponse",
            Self::ReadingAckRecord => "ReadingAckRecord",
            Self::Start => "Start",
            Self::ReadingFaultString => "ReadingFaultString",
            Self::Fault => "Fault",
            Self::ReadingEnvelopeRecord => "ReadingEnvelopeRecord",
            Self::ReadingEnvelopeSize => "ReadingEnvelopeSize",
            Self::EnvelopeStart => "EnvelopeStart",
            Self::ReadingEnvelopeBytes => "ReadingEnvelopeBytes",
            Self::EnvelopeEnd => "EnvelopeEnd",
            Self::ReadingEndRecord => "ReadingEndRecord",
            Self::End => "End",
        }
    }
}

/// Outcome of a single decode step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    /// The decoder consumed this many bytes (possibly zero) and moved on.
    Progress(usize),
    /// The current state needs input and none was given.
    NeedMoreData,
    /// The peer's fault string is complete.
    Fault { consumed: usize, fault: String },
}

impl DecodeResult {
    /// Bytes consumed by this step.
    #[inline]
    pub fn consumed(&self) -> usize {
        match self {
            Self::Progress(n) => *n,
            Self::NeedMoreData => 0,
            Self::Fault { consumed, .. } => *consumed,
        }
    }
}

/// Common interface of the client framing decoders.
pub trait ClientFramingDecoder: Send {
    /// Advance by one state, consuming a prefix of `buf`.
    ///
    /// Errors are annotated with the stream position and state name.
    fn decode(&mut self, buf: &[u8]) -> Result<DecodeResult>;

    fn current_state(&self) -> ClientFramingState;

    /// Total bytes consumed so far.
    fn stream_position(&self) -> u64;

    /// The fault string received from the peer, if any.
    fn fault(&self) -> Option<&str>;
}

/// Fields every client decoder carries for the handshake and fault tail.
#[derive(Debug)]
pub(crate) struct DecoderCore {
    pub(crate) state: ClientFramingState,
    pub(crate) stream_position: u64,
    pub(crate) fault_decoder: StringDecoder,
    pub(crate) fault: Option<String>,
}

impl DecoderCore {
    pub(crate) fn new() -> Self {
        Self {
            state: ClientFramingState::ReadingUpgradeRecord,
            stream_position: 0,
            fault_decoder: StringDecoder::new(StringKind::Fault),
            fault: None,
        }
    }

    /// Run one step and account for consumed bytes or annotate the error.
    pub(crate) fn run<F>(&mut self, step: F) -> Result<DecodeResult>
    where
        F: FnOnce(&mut Self) -> Result<DecodeResult>,
    {
        let state = self.state;
        match step(self) {
            Ok(result) => {
                self.stream_position += result.consumed() as u64;
                Ok(result)
            }
            Err(e) => Err(FramingError::decode_at(self.stream_position, state.name(), e)),
        }
    }

    /// Upgrade-response and preamble-ack states.
    pub(crate) fn decode_handshake(&mut self, buf: &[u8]) -> Result<DecodeResult> {
        use ClientFramingState::*;
        match self.state {
            ReadingUpgradeRecord => {
                let Some(&byte) = buf.first() else {
                    return Ok(DecodeResult::NeedMoreData);
                };
                if byte == RecordType::UpgradeResponse.as_byte() {
                    self.state = UpgradeResponse;
                    Ok(DecodeResult::Progress(1))
                } else {
                    self.state = ReadingAckRecord;
                    Ok(DecodeResult::Progress(0))
                }
            }
            UpgradeResponse => {
                self.state = ReadingUpgradeRecord;
                Ok(DecodeResult::Progress(0))
            }
            ReadingAckRecord => {
                let Some(&byte) = buf.first() else {
                    return Ok(DecodeResult::NeedMoreData);
                };
                if byte == RecordType::Fault.as_byte() {
                    self.begin_fault();
                    return Ok(DecodeResult::Progress(1));
                }
                validate_preamble_ack(byte)?;
                self.state = Start;
                Ok(DecodeResult::Progress(1))
            }
            other => Err(FramingError::Protocol(format!(
                "{} is not a handshake state",
                other.name()
            ))),
        }
    }

    /// Fault string, fault, end-record and end states.
    pub(crate) fn decode_fault_tail(&mut self, buf: &[u8]) -> Result<DecodeResult> {
        use ClientFramingState::*;
        match self.state {
            ReadingFaultString => {
                if buf.is_empty() {
                    return Ok(DecodeResult::NeedMoreData);
                }
                let consumed = self.fault_decoder.decode(buf)?;
                match self.fault_decoder.take_value() {
                    Some(fault) => {
                        self.fault = Some(fault.clone());
                        self.state = Fault;
                        Ok(DecodeResult::Fault { consumed, fault })
                    }
                    None => Ok(DecodeResult::Progress(consumed)),
                }
            }
            Fault => {
                self.state = ReadingEndRecord;
                Ok(DecodeResult::Progress(0))
            }
            ReadingEndRecord => {
                let Some(&byte) = buf.first() else {
                    return Ok(DecodeResult::NeedMoreData);
                };
                validate_record_type(RecordType::End, byte)?;
                self.state = End;
                Ok(DecodeResult::Progress(1))
            }
            End => Err(FramingError::FramingEnded),
            other => Err(FramingError::Protocol(format!(
                "{} is not a fault state",
                other.name()
            ))),
        }
    }

    pub(crate) fn begin_fault(&mut self) {
        self.fault_decoder.reset();
        self.state = ClientFramingState::ReadingFaultString;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_without_upgrade() {
        let mut core = DecoderCore::new();
        assert_eq!(core.decode_handshake(&[0x0B]).unwrap(), DecodeResult::Progress(0));
        assert_eq!(core.state, ClientFramingState::ReadingAckRecord);
        assert_eq!(core.decode_handshake(&[0x0B]).unwrap(), DecodeResult::Progress(1));
        assert_eq!(core.state, ClientFramingState::Start);
    }

    #[test]
    fn test_handshake_upgrade_response_cycles() {
        let mut core = DecoderCore::new();
        assert_eq!(core.decode_handshake(&[0x0A]).unwrap(), DecodeResult::Progress(1));
        assert_eq!(core.state, ClientFramingState::UpgradeResponse);
        assert_eq!(core.decode_handshake(&[]).unwrap(), DecodeResult::Progress(0));
        assert_eq!(core.state, ClientFramingState::ReadingUpgradeRecord);
    }

    #[test]
    fn test_handshake_needs_data() {
        let mut core = DecoderCore::new();
        assert_eq!(core.decode_handshake(&[]).unwrap(), DecodeResult::NeedMoreData);
        assert_eq!(core.state, ClientFramingState::ReadingUpgradeRecord);
    }

    #[test]
    fn test_fault_tail() {
        let mut core = DecoderCore::new();
        core.begin_fault();
        let result = core.decode_fault_tail(&[0x03, b'b', b'a', b'd', 0x07]).unwrap();
        assert_eq!(
            result,
            DecodeResult::Fault {
                consumed: 4,
                fault: "bad".into()
            }
        );
        assert_eq!(core.decode_fault_tail(&[0x07]).unwrap(), DecodeResult::Progress(0));
        assert_eq!(core.state, ClientFramingState::ReadingEndRecord);
        assert_eq!(core.decode_fault_tail(&[0x07]).unwrap(), DecodeResult::Progress(1));
        assert_eq!(core.state, ClientFramingState::End);
        assert!(matches!(
            core.decode_fault_tail(&[0x07]),
            Err(FramingError::FramingEnded)
        ));
    }

    #[test]
    fn test_run_annotates_errors() {
        let mut core = DecoderCore::new();
        core.state = ClientFramingState::ReadingAckRecord;
        core.stream_position = 7;
        let err = core.run(|c| c.decode_handshake(&[0x42])).unwrap_err();
        match err {
            FramingError::Decode { offset, state, .. } => {
                assert_eq!(offset, 7);
                assert_eq!(state, "ReadingAckRecord");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
