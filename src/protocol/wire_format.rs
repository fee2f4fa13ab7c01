//! Wire constants for the message framing protocol.
//!
//! Every record on the wire starts with a single record-type byte:
//! ```text
//! ┌────────────┬──────────────────────────────────────────┐
//! │ RecordType │ payload (depends on the record type)     │
//! │ 1 byte     │ none | 1-2 bytes | varint len + UTF-8    │
//! └────────────┴──────────────────────────────────────────┘
//! ```
//!
//! The numeric values match the well-known .NET Message Framing table so that
//! a client built on this crate interoperates with existing peers.

/// Major protocol version sent in the `Version` record.
pub const VERSION_MAJOR: u8 = 1;

/// Minor protocol version sent in the `Version` record.
pub const VERSION_MINOR: u8 = 0;

/// Maximum encoded size of a via URI, in bytes.
pub const MAX_VIA_SIZE: usize = 2048;

/// Maximum encoded size of a content type, in bytes.
pub const MAX_CONTENT_TYPE_SIZE: usize = 256;

/// Maximum encoded size of a fault string, in bytes.
pub const MAX_FAULT_SIZE: usize = 256;

/// Maximum encoded size of an upgrade identity returned by the peer.
pub const MAX_IDENTITY_SIZE: usize = 1024;

/// Record-type tag, the first byte of every framing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    Version = 0x00,
    Mode = 0x01,
    Via = 0x02,
    KnownEncoding = 0x03,
    ExtensibleEncoding = 0x04,
    UnsizedEnvelope = 0x05,
    SizedEnvelope = 0x06,
    End = 0x07,
    Fault = 0x08,
    UpgradeRequest = 0x09,
    UpgradeResponse = 0x0A,
    PreambleAck = 0x0B,
    PreambleEnd = 0x0C,
}

impl RecordType {
    /// Parse a record-type byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Self::Version,
            0x01 => Self::Mode,
            0x02 => Self::Via,
            0x03 => Self::KnownEncoding,
            0x04 => Self::ExtensibleEncoding,
            0x05 => Self::UnsizedEnvelope,
            0x06 => Self::SizedEnvelope,
            0x07 => Self::End,
            0x08 => Self::Fault,
            0x09 => Self::UpgradeRequest,
            0x0A => Self::UpgradeResponse,
            0x0B => Self::PreambleAck,
            0x0C => Self::PreambleEnd,
            _ => return None,
        })
    }

    /// The wire byte for this record type.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Framing mode announced in the `Mode` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FramingMode {
    /// One unsized (chunked) message per direction.
    Singleton = 0x01,
    /// Long-lived session of sized envelopes in both directions.
    Duplex = 0x02,
    /// One-way stream of sized envelopes.
    Simplex = 0x03,
    /// One sized message per direction.
    SingletonSized = 0x04,
}

impl FramingMode {
    /// Parse a mode byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => Self::Singleton,
            0x02 => Self::Duplex,
            0x03 => Self::Simplex,
            0x04 => Self::SingletonSized,
            _ => return None,
        })
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Content types with a single-byte encoding on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KnownEncoding {
    Soap11Utf8 = 0x00,
    Soap11Utf16 = 0x01,
    Soap11UnicodeLe = 0x02,
    Soap12Utf8 = 0x03,
    Soap12Utf16 = 0x04,
    Soap12UnicodeLe = 0x05,
    Soap12Mtom = 0x06,
    Soap12Binary = 0x07,
    Soap12BinarySession = 0x08,
}

const KNOWN_ENCODINGS: [(KnownEncoding, &str); 9] = [
    (KnownEncoding::Soap11Utf8, "text/xml; charset=utf-8"),
    (KnownEncoding::Soap11Utf16, "text/xml; charset=utf-16"),
    (KnownEncoding::Soap11UnicodeLe, "text/xml; charset=unicodeFFFE"),
    (KnownEncoding::Soap12Utf8, "application/soap+xml; charset=utf-8"),
    (KnownEncoding::Soap12Utf16, "application/soap+xml; charset=utf-16"),
    (KnownEncoding::Soap12UnicodeLe, "application/soap+xml; charset=unicodeFFFE"),
    (KnownEncoding::Soap12Mtom, "multipart/related"),
    (KnownEncoding::Soap12Binary, "application/soap+msbin1"),
    (KnownEncoding::Soap12BinarySession, "application/soap+msbinsession1"),
];

impl KnownEncoding {
    /// Parse a known-encoding byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        KNOWN_ENCODINGS
            .iter()
            .find(|(encoding, _)| encoding.as_byte() == byte)
            .map(|(encoding, _)| *encoding)
    }

    /// Find the known encoding for a content type (case-insensitive).
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        KNOWN_ENCODINGS
            .iter()
            .find(|(_, ct)| ct.eq_ignore_ascii_case(content_type))
            .map(|(encoding, _)| *encoding)
    }

    /// The content type this encoding stands for.
    pub fn content_type(self) -> &'static str {
        KNOWN_ENCODINGS
            .iter()
            .find(|(encoding, _)| *encoding == self)
            .map(|(_, ct)| *ct)
            .unwrap_or_default()
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Fault strings a peer may send in a `Fault` record.
pub mod faults {
    macro_rules! fault {
        ($name:literal) => {
            concat!("http://schemas.microsoft.com/ws/2006/05/framing/faults/", $name)
        };
    }

    pub const CONNECTION_DISPATCH_FAILED: &str = fault!("ConnectionDispatchFailed");
    pub const CONTENT_TYPE_INVALID: &str = fault!("ContentTypeInvalid");
    pub const CONTENT_TYPE_TOO_LONG: &str = fault!("ContentTypeTooLong");
    pub const ENDPOINT_NOT_FOUND: &str = fault!("EndpointNotFound");
    pub const ENDPOINT_PAUSED: &str = fault!("EndpointPaused");
    pub const ENDPOINT_UNAVAILABLE: &str = fault!("EndpointUnavailable");
    pub const MAX_MESSAGE_SIZE_EXCEEDED: &str = fault!("MaxMessageSizeExceededFault");
    pub const SERVER_TOO_BUSY: &str = fault!("ServerTooBusy");
    pub const SERVICE_ACTIVATION_FAILED: &str = fault!("ServiceActivationFailed");
    pub const UNSUPPORTED_MODE: &str = fault!("UnsupportedMode");
    pub const UNSUPPORTED_VERSION: &str = fault!("UnsupportedVersion");
    pub const UPGRADE_INVALID: &str = fault!("UpgradeInvalid");
    pub const VIA_TOO_LONG: &str = fault!("ViaTooLong");

    /// Every fault string this crate recognizes.
    pub const ALL: [&str; 13] = [
        CONNECTION_DISPATCH_FAILED,
        CONTENT_TYPE_INVALID,
        CONTENT_TYPE_TOO_LONG,
        ENDPOINT_NOT_FOUND,
        ENDPOINT_PAUSED,
        ENDPOINT_UNAVAILABLE,
        MAX_MESSAGE_SIZE_EXCEEDED,
        SERVER_TOO_BUSY,
        SERVICE_ACTIVATION_FAILED,
        UNSUPPORTED_MODE,
        UNSUPPORTED_VERSION,
        UPGRADE_INVALID,
        VIA_TOO_LONG,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_byte_values() {
        assert_eq!(RecordType::Version.as_byte(), 0x00);
        assert_eq!(RecordType::SizedEnvelope.as_byte(), 0x06);
        assert_eq!(RecordType::End.as_byte(), 0x07);
        assert_eq!(RecordType::Fault.as_byte(), 0x08);
        assert_eq!(RecordType::PreambleAck.as_byte(), 0x0B);
        assert_eq!(RecordType::PreambleEnd.as_byte(), 0x0C);
    }

    #[test]
    fn test_record_type_from_byte() {
        for byte in 0x00..=0x0C {
            let record = RecordType::from_byte(byte).unwrap();
            assert_eq!(record.as_byte(), byte);
        }
        assert!(RecordType::from_byte(0x0D).is_none());
        assert!(RecordType::from_byte(b'H').is_none());
    }

    #[test]
    fn test_mode_from_byte() {
        assert_eq!(FramingMode::from_byte(0x01), Some(FramingMode::Singleton));
        assert_eq!(FramingMode::from_byte(0x02), Some(FramingMode::Duplex));
        assert_eq!(FramingMode::from_byte(0x04), Some(FramingMode::SingletonSized));
        assert!(FramingMode::from_byte(0x00).is_none());
        assert!(FramingMode::from_byte(0x05).is_none());
    }

    #[test]
    fn test_known_encoding_lookup() {
        assert_eq!(
            KnownEncoding::from_content_type("application/soap+msbin1"),
            Some(KnownEncoding::Soap12Binary)
        );
        assert_eq!(
            KnownEncoding::from_content_type("TEXT/XML; CHARSET=UTF-8"),
            Some(KnownEncoding::Soap11Utf8)
        );
        assert!(KnownEncoding::from_content_type("application/msgpack").is_none());
        assert_eq!(
            KnownEncoding::Soap12Mtom.content_type(),
            "multipart/related"
        );
        assert_eq!(KnownEncoding::from_byte(0x08), Some(KnownEncoding::Soap12BinarySession));
    }

    #[test]
    fn test_fault_strings_share_namespace() {
        for fault in faults::ALL {
            assert!(fault.starts_with("http://schemas.microsoft.com/ws/2006/05/framing/faults/"));
        }
        assert!(faults::VIA_TOO_LONG.ends_with("/ViaTooLong"));
    }
}
