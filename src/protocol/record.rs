//! Framing records and their encoding.
//!
//! [`Record`] covers every record type a client sends or receives.
//! [`RecordDecoder`] is an incremental, peer-agnostic parser for a stream of
//! records; the client decoders in this module tree are narrower state
//! machines that accept only what a server may legally send.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FramingError, Result};
use crate::protocol::string_decoder::{StringDecoder, StringKind};
use crate::protocol::varint::{self, IntDecoder};
use crate::protocol::wire_format::{
    FramingMode, KnownEncoding, RecordType, VERSION_MAJOR, VERSION_MINOR,
};

/// A single framing record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Version { major: u8, minor: u8 },
    Mode(FramingMode),
    Via(String),
    KnownEncoding(KnownEncoding),
    ExtensibleEncoding(String),
    /// Start of a chunked envelope; the body follows as chunks.
    UnsizedEnvelope,
    SizedEnvelope(Bytes),
    End,
    Fault(String),
    UpgradeRequest(String),
    UpgradeResponse,
    PreambleAck,
    PreambleEnd,
}

impl Record {
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Version { .. } => RecordType::Version,
            Self::Mode(_) => RecordType::Mode,
            Self::Via(_) => RecordType::Via,
            Self::KnownEncoding(_) => RecordType::KnownEncoding,
            Self::ExtensibleEncoding(_) => RecordType::ExtensibleEncoding,
            Self::UnsizedEnvelope => RecordType::UnsizedEnvelope,
            Self::SizedEnvelope(_) => RecordType::SizedEnvelope,
            Self::End => RecordType::End,
            Self::Fault(_) => RecordType::Fault,
            Self::UpgradeRequest(_) => RecordType::UpgradeRequest,
            Self::UpgradeResponse => RecordType::UpgradeResponse,
            Self::PreambleAck => RecordType::PreambleAck,
            Self::PreambleEnd => RecordType::PreambleEnd,
        }
    }

    /// Number of bytes this record occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Self::Version { .. } => 2,
            Self::Mode(_) | Self::KnownEncoding(_) => 1,
            Self::Via(s)
            | Self::ExtensibleEncoding(s)
            | Self::Fault(s)
            | Self::UpgradeRequest(s) => varint::encoded_size(s.len() as u32) + s.len(),
            Self::SizedEnvelope(body) => varint::encoded_size(body.len() as u32) + body.len(),
            Self::UnsizedEnvelope
            | Self::End
            | Self::UpgradeResponse
            | Self::PreambleAck
            | Self::PreambleEnd => 0,
        }
    }

    /// Append this record to `buf`.
    ///
    /// Fails if a string or envelope is too long to length-prefix.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(self.encoded_len());
        buf.put_u8(self.record_type().as_byte());
        match self {
            Self::Version { major, minor } => {
                buf.put_u8(*major);
                buf.put_u8(*minor);
            }
            Self::Mode(mode) => buf.put_u8(mode.as_byte()),
            Self::KnownEncoding(encoding) => buf.put_u8(encoding.as_byte()),
            Self::Via(s) | Self::ExtensibleEncoding(s) | Self::Fault(s) | Self::UpgradeRequest(s) => {
                encode_string(s, buf)?;
            }
            Self::SizedEnvelope(body) => {
                varint::encode_into(varint::checked_len(body.len())?, buf);
                buf.put_slice(body);
            }
            Self::UnsizedEnvelope
            | Self::End
            | Self::UpgradeResponse
            | Self::PreambleAck
            | Self::PreambleEnd => {}
        }
        Ok(())
    }

    /// Encode this record into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Append a varint length prefix and the UTF-8 bytes of `s`.
pub fn encode_string(s: &str, buf: &mut BytesMut) -> Result<()> {
    varint::encode_into(varint::checked_len(s.len())?, buf);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Single-byte record with no payload.
#[inline]
pub fn single_byte(record_type: RecordType) -> [u8; 1] {
    [record_type.as_byte()]
}

/// Check that `byte` is the record type the state machine expects.
pub fn validate_record_type(expected: RecordType, byte: u8) -> Result<()> {
    if byte == expected.as_byte() {
        return Ok(());
    }
    let found = RecordType::from_byte(byte)
        .map(|r| format!("{r:?}"))
        .unwrap_or_else(|| format!("0x{byte:02X}"));
    Err(FramingError::Protocol(format!(
        "expected {expected:?} record but found {found}"
    )))
}

/// Check that `byte` is a preamble ack.
pub fn validate_preamble_ack(byte: u8) -> Result<()> {
    if byte == RecordType::PreambleAck.as_byte() {
        Ok(())
    } else {
        Err(FramingError::PreambleAckIncorrect { byte })
    }
}

/// Check that the peer speaks a compatible framing version.
pub fn validate_version(major: u8, minor: u8) -> Result<()> {
    if major != VERSION_MAJOR || minor > VERSION_MINOR {
        return Err(FramingError::Protocol(format!(
            "unsupported framing version {major}.{minor}"
        )));
    }
    Ok(())
}

/// Parse a mode byte, failing on unknown modes.
pub fn validate_mode(byte: u8) -> Result<FramingMode> {
    FramingMode::from_byte(byte)
        .ok_or_else(|| FramingError::Protocol(format!("unsupported framing mode 0x{byte:02X}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadingType,
    ReadingVersionMajor,
    ReadingVersionMinor { major: u8 },
    ReadingMode,
    ReadingKnownEncoding,
    ReadingString(RecordType),
    ReadingEnvelopeSize,
    ReadingEnvelopeBytes,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            Self::ReadingType => "ReadingType",
            Self::ReadingVersionMajor => "ReadingVersionMajor",
            Self::ReadingVersionMinor { .. } => "ReadingVersionMinor",
            Self::ReadingMode => "ReadingMode",
            Self::ReadingKnownEncoding => "ReadingKnownEncoding",
            Self::ReadingString(_) => "ReadingString",
            Self::ReadingEnvelopeSize => "ReadingEnvelopeSize",
            Self::ReadingEnvelopeBytes => "ReadingEnvelopeBytes",
        }
    }
}

/// Incremental parser for a stream of framing records.
///
/// Feed bytes with [`decode`](Self::decode); each call returns how many bytes
/// were consumed and, once a record completes, the record itself. After an
/// `UnsizedEnvelope` record the caller owns the chunked body that follows.
#[derive(Debug)]
pub struct RecordDecoder {
    state: State,
    size_decoder: IntDecoder,
    string: Option<StringDecoder>,
    envelope: BytesMut,
    envelope_size: usize,
    max_envelope_size: usize,
    stream_position: u64,
}

impl RecordDecoder {
    pub fn new(max_envelope_size: usize) -> Self {
        Self {
            state: State::ReadingType,
            size_decoder: IntDecoder::new(),
            string: None,
            envelope: BytesMut::new(),
            envelope_size: 0,
            max_envelope_size,
            stream_position: 0,
        }
    }

    /// Total bytes consumed so far.
    #[inline]
    pub fn stream_position(&self) -> u64 {
        self.stream_position
    }

    /// Feed bytes; returns `(consumed, record)`.
    ///
    /// Consumes at most one record. `record` is `None` when more input is
    /// needed to complete it.
    pub fn decode(&mut self, buf: &[u8]) -> Result<(usize, Option<Record>)> {
        let mut consumed = 0;
        loop {
            if consumed == buf.len() && self.state != State::ReadingEnvelopeBytes {
                break;
            }
            match self.step(&buf[consumed..]) {
                Ok((n, record)) => {
                    consumed += n;
                    self.stream_position += n as u64;
                    if record.is_some() {
                        return Ok((consumed, record));
                    }
                    if n == 0 {
                        break;
                    }
                }
                Err(e) => {
                    return Err(FramingError::decode_at(
                        self.stream_position,
                        self.state.name(),
                        e,
                    ))
                }
            }
        }
        Ok((consumed, None))
    }

    fn step(&mut self, buf: &[u8]) -> Result<(usize, Option<Record>)> {
        match self.state {
            State::ReadingType => {
                let Some(&byte) = buf.first() else {
                    return Ok((0, None));
                };
                let record_type = RecordType::from_byte(byte).ok_or_else(|| {
                    FramingError::Protocol(format!("unknown record type 0x{byte:02X}"))
                })?;
                let record = match record_type {
                    RecordType::Version => {
                        self.state = State::ReadingVersionMajor;
                        None
                    }
                    RecordType::Mode => {
                        self.state = State::ReadingMode;
                        None
                    }
                    RecordType::KnownEncoding => {
                        self.state = State::ReadingKnownEncoding;
                        None
                    }
                    RecordType::Via
                    | RecordType::ExtensibleEncoding
                    | RecordType::Fault
                    | RecordType::UpgradeRequest => {
                        self.string = Some(StringDecoder::new(string_kind(record_type)));
                        self.state = State::ReadingString(record_type);
                        None
                    }
                    RecordType::SizedEnvelope => {
                        self.size_decoder.reset();
                        self.state = State::ReadingEnvelopeSize;
                        None
                    }
                    RecordType::UnsizedEnvelope => Some(Record::UnsizedEnvelope),
                    RecordType::End => Some(Record::End),
                    RecordType::UpgradeResponse => Some(Record::UpgradeResponse),
                    RecordType::PreambleAck => Some(Record::PreambleAck),
                    RecordType::PreambleEnd => Some(Record::PreambleEnd),
                };
                Ok((1, record))
            }
            State::ReadingVersionMajor => {
                let Some(&major) = buf.first() else {
                    return Ok((0, None));
                };
                self.state = State::ReadingVersionMinor { major };
                Ok((1, None))
            }
            State::ReadingVersionMinor { major } => {
                let Some(&minor) = buf.first() else {
                    return Ok((0, None));
                };
                validate_version(major, minor)?;
                self.state = State::ReadingType;
                Ok((1, Some(Record::Version { major, minor })))
            }
            State::ReadingMode => {
                let Some(&byte) = buf.first() else {
                    return Ok((0, None));
                };
                let mode = validate_mode(byte)?;
                self.state = State::ReadingType;
                Ok((1, Some(Record::Mode(mode))))
            }
            State::ReadingKnownEncoding => {
                let Some(&byte) = buf.first() else {
                    return Ok((0, None));
                };
                let encoding = KnownEncoding::from_byte(byte).ok_or_else(|| {
                    FramingError::Protocol(format!("unknown encoding 0x{byte:02X}"))
                })?;
                self.state = State::ReadingType;
                Ok((1, Some(Record::KnownEncoding(encoding))))
            }
            State::ReadingString(record_type) => {
                let Some(decoder) = self.string.as_mut() else {
                    return Err(FramingError::Protocol("string decoder missing".into()));
                };
                let n = decoder.decode(buf)?;
                let Some(value) = decoder.take_value() else {
                    return Ok((n, None));
                };
                self.string = None;
                self.state = State::ReadingType;
                let record = match record_type {
                    RecordType::Via => Record::Via(value),
                    RecordType::ExtensibleEncoding => Record::ExtensibleEncoding(value),
                    RecordType::Fault => Record::Fault(value),
                    _ => Record::UpgradeRequest(value),
                };
                Ok((n, Some(record)))
            }
            State::ReadingEnvelopeSize => {
                let n = self.size_decoder.decode(buf)?;
                if let Some(size) = self.size_decoder.value() {
                    let size = size as usize;
                    if size > self.max_envelope_size {
                        return Err(FramingError::MessageTooLarge {
                            size: size as u64,
                            max: self.max_envelope_size as u64,
                        });
                    }
                    self.envelope_size = size;
                    self.envelope = BytesMut::with_capacity(size);
                    self.state = State::ReadingEnvelopeBytes;
                }
                Ok((n, None))
            }
            State::ReadingEnvelopeBytes => {
                let needed = self.envelope_size - self.envelope.len();
                let take = needed.min(buf.len());
                self.envelope.extend_from_slice(&buf[..take]);
                if self.envelope.len() < self.envelope_size {
                    return Ok((take, None));
                }
                self.state = State::ReadingType;
                let body = std::mem::take(&mut self.envelope).freeze();
                Ok((take, Some(Record::SizedEnvelope(body))))
            }
        }
    }
}

fn string_kind(record_type: RecordType) -> StringKind {
    match record_type {
        RecordType::Via => StringKind::Via,
        RecordType::ExtensibleEncoding => StringKind::ContentType,
        RecordType::UpgradeRequest => StringKind::UpgradeContentType,
        _ => StringKind::Fault,
    }
}
