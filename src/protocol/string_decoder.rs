//! Length-prefixed UTF-8 string decoding with a size quota.

use crate::error::{FramingError, Result};
use crate::protocol::faults;
use crate::protocol::varint::IntDecoder;
use crate::protocol::wire_format::{
    MAX_CONTENT_TYPE_SIZE, MAX_FAULT_SIZE, MAX_IDENTITY_SIZE, MAX_VIA_SIZE,
};

/// What a decoded string represents; decides the quota error it raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringKind {
    Via,
    ContentType,
    UpgradeContentType,
    Fault,
    Identity,
}

impl StringKind {
    fn label(self) -> &'static str {
        match self {
            Self::Via => "via",
            Self::ContentType => "content type",
            Self::UpgradeContentType => "upgrade content type",
            Self::Fault => "fault",
            Self::Identity => "identity",
        }
    }

    fn fault(self) -> Option<&'static str> {
        match self {
            Self::Via => Some(faults::VIA_TOO_LONG),
            Self::ContentType | Self::UpgradeContentType => Some(faults::CONTENT_TYPE_TOO_LONG),
            Self::Fault | Self::Identity => None,
        }
    }

    /// The default quota for this kind of string.
    pub fn default_quota(self) -> usize {
        match self {
            Self::Via => MAX_VIA_SIZE,
            Self::ContentType | Self::UpgradeContentType => MAX_CONTENT_TYPE_SIZE,
            Self::Fault => MAX_FAULT_SIZE,
            Self::Identity => MAX_IDENTITY_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadingSize,
    ReadingBytes,
    Done,
}

/// Incremental decoder for a varint-length-prefixed UTF-8 string.
///
/// The announced length is checked against the quota before any payload is
/// buffered, so an oversized string never allocates.
#[derive(Debug)]
pub struct StringDecoder {
    kind: StringKind,
    size_quota: usize,
    state: State,
    size_decoder: IntDecoder,
    encoded_size: usize,
    bytes: Vec<u8>,
    value: Option<String>,
}

impl StringDecoder {
    /// Create a decoder with the default quota for `kind`.
    pub fn new(kind: StringKind) -> Self {
        Self::with_quota(kind, kind.default_quota())
    }

    pub fn with_quota(kind: StringKind, size_quota: usize) -> Self {
        Self {
            kind,
            size_quota,
            state: State::ReadingSize,
            size_decoder: IntDecoder::new(),
            encoded_size: 0,
            bytes: Vec::new(),
            value: None,
        }
    }

    /// Feed bytes; returns the number consumed.
    ///
    /// Consumes nothing beyond the end of the string.
    pub fn decode(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.state == State::Done {
            return Err(FramingError::Protocol(format!(
                "{} already decoded; reset before reuse",
                self.kind.label()
            )));
        }

        let mut consumed = 0;
        while consumed < buf.len() && self.state != State::Done {
            match self.state {
                State::ReadingSize => {
                    consumed += self.size_decoder.decode(&buf[consumed..])?;
                    if let Some(size) = self.size_decoder.value() {
                        self.begin_bytes(size as usize)?;
                    }
                }
                State::ReadingBytes => {
                    let needed = self.encoded_size - self.bytes.len();
                    let take = needed.min(buf.len() - consumed);
                    self.bytes.extend_from_slice(&buf[consumed..consumed + take]);
                    consumed += take;
                    if self.bytes.len() == self.encoded_size {
                        self.complete()?;
                    }
                }
                State::Done => break,
            }
        }
        Ok(consumed)
    }

    fn begin_bytes(&mut self, size: usize) -> Result<()> {
        if size > self.size_quota {
            return Err(FramingError::quota(
                format!(
                    "{} of {size} bytes exceeds the quota of {} bytes",
                    self.kind.label(),
                    self.size_quota
                ),
                self.kind.fault(),
            ));
        }
        self.encoded_size = size;
        self.bytes = Vec::with_capacity(size);
        if size == 0 {
            self.complete()
        } else {
            self.state = State::ReadingBytes;
            Ok(())
        }
    }

    fn complete(&mut self) -> Result<()> {
        let bytes = std::mem::take(&mut self.bytes);
        let value = String::from_utf8(bytes).map_err(|_| {
            FramingError::Protocol(format!("{} is not valid UTF-8", self.kind.label()))
        })?;
        self.value = Some(value);
        self.state = State::Done;
        Ok(())
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// The decoded string, once complete.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Take the decoded string, leaving the decoder done but empty.
    pub fn take_value(&mut self) -> Option<String> {
        self.value.take()
    }

    pub fn reset(&mut self) {
        self.state = State::ReadingSize;
        self.size_decoder.reset();
        self.encoded_size = 0;
        self.bytes = Vec::new();
        self.value = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::varint;

    fn encoded(s: &str) -> Vec<u8> {
        let mut buf = varint::encode(s.len() as u32);
        buf.extend_from_slice(s.as_bytes());
        buf.to_vec()
    }

    #[test]
    fn test_decode_whole_string() {
        let mut decoder = StringDecoder::new(StringKind::Via);
        let mut bytes = encoded("net.tcp://host/svc");
        bytes.push(0xEE);

        let consumed = decoder.decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len() - 1);
        assert!(decoder.is_done());
        assert_eq!(decoder.value(), Some("net.tcp://host/svc"));
    }

    #[test]
    fn test_decode_split_points_consume_same_total() {
        let bytes = encoded(&"x".repeat(200));
        for split in 0..=bytes.len() {
            let mut decoder = StringDecoder::new(StringKind::ContentType);
            let first = decoder.decode(&bytes[..split]).unwrap();
            let second = decoder.decode(&bytes[first..]).unwrap();
            assert_eq!(first + second, bytes.len(), "split at {split}");
            assert_eq!(decoder.value().map(str::len), Some(200));
        }
    }

    #[test]
    fn test_decode_empty_string() {
        let mut decoder = StringDecoder::new(StringKind::Fault);
        assert_eq!(decoder.decode(&[0x00]).unwrap(), 1);
        assert_eq!(decoder.value(), Some(""));
    }

    #[test]
    fn test_quota_checked_before_payload() {
        let mut decoder = StringDecoder::with_quota(StringKind::Via, 8);
        // Only the length prefix: quota must fail without any payload bytes.
        let err = decoder.decode(&varint::encode(9)).unwrap_err();
        match err {
            FramingError::QuotaExceeded { fault, .. } => {
                assert_eq!(fault, Some(faults::VIA_TOO_LONG));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_quota_fault_per_kind() {
        let mut decoder = StringDecoder::with_quota(StringKind::ContentType, 1);
        let err = decoder.decode(&encoded("ab")).unwrap_err();
        assert_eq!(err.fault_string(), Some(faults::CONTENT_TYPE_TOO_LONG));

        let mut decoder = StringDecoder::with_quota(StringKind::Fault, 1);
        let err = decoder.decode(&encoded("ab")).unwrap_err();
        assert_eq!(err.fault_string(), None);
        assert!(err.to_string().contains("fault"));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut decoder = StringDecoder::new(StringKind::Via);
        assert!(decoder.decode(&[0x02, 0xFF, 0xFE]).is_err());
    }

    #[test]
    fn test_reset_allows_reuse() {
        let mut decoder = StringDecoder::new(StringKind::Fault);
        decoder.decode(&encoded("first")).unwrap();
        assert!(decoder.decode(&encoded("second")).is_err());

        decoder.reset();
        decoder.decode(&encoded("second")).unwrap();
        assert_eq!(decoder.take_value().as_deref(), Some("second"));
    }
}
