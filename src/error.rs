//! Error types for netframe-client.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::faults;

/// Coarse classification of a [`FramingError`], used by callers to decide
/// whether to retry, back off, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed or unexpected bytes on the wire.
    Protocol,
    /// A size limit was exceeded.
    Quota,
    /// An operation ran out of its time budget.
    Timeout,
    /// The peer has no endpoint at the requested via.
    EndpointNotFound,
    /// The peer refused the connection because it is overloaded.
    ServerTooBusy,
    /// The peer could not activate the target service.
    ServiceActivation,
    /// The endpoint exists but is paused or unavailable.
    EndpointUnavailable,
    /// Transport-level failure (I/O, aborted or closed connection).
    Communication,
}

/// Main error type for all framing operations.
#[derive(Debug, Error)]
pub enum FramingError {
    /// I/O error during socket/stream operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (configuration only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (unexpected record, invalid payload, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer answered the preamble with something other than an ack.
    #[error("{}", preamble_ack_message(.byte))]
    PreambleAckIncorrect { byte: u8 },

    /// Data was offered to a decoder that already reached `End`.
    #[error("Framing stream has already ended")]
    FramingEnded,

    /// A varint ran past five bytes or encodes a value above `i32::MAX`.
    #[error("Encoded integer exceeds the maximum size")]
    OversizedInteger,

    /// A length-prefixed string or other bounded value was too large.
    #[error("Quota exceeded: {message}")]
    QuotaExceeded {
        message: String,
        /// Fault string a server would send for this condition, if any.
        fault: Option<&'static str>,
    },

    /// An envelope announced a size above the receive limit.
    #[error("Message of {size} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { size: u64, max: u64 },

    /// The time budget for an operation ran out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The connection was aborted locally or by a failed operation.
    #[error("Connection aborted")]
    ConnectionAborted,

    /// Connection closed (EOF or already closed).
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection pool has been closed.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// A stream upgrade could not be negotiated.
    #[error("Stream upgrade failed: {0}")]
    UpgradeFailed(String),

    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),

    #[error("Server too busy: {0}")]
    ServerTooBusy(String),

    #[error("Service activation failed: {0}")]
    ServiceActivationFailed(String),

    #[error("Endpoint unavailable: {0}")]
    EndpointUnavailable(String),

    #[error("Communication failure: {0}")]
    CommunicationFailed(String),

    /// The channel is faulted and can no longer be used.
    #[error("Channel is faulted")]
    ChannelFaulted,

    /// The operation is not valid in the current channel state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A decoder failure, annotated with where in the stream it happened.
    #[error("Decode error at offset {offset} in state {state}: {source}")]
    Decode {
        offset: u64,
        state: &'static str,
        #[source]
        source: Box<FramingError>,
    },
}

fn preamble_ack_message(byte: &u8) -> String {
    if *byte == b'h' || *byte == b'H' {
        "The server responded with an HTTP response; the via likely points at an HTTP endpoint \
         rather than a framing endpoint"
            .to_string()
    } else {
        format!("Expected a preamble ack record (0x0B) but received 0x{byte:02X}")
    }
}

impl FramingError {
    /// Wrap a decoder failure with its stream position and state name.
    pub fn decode_at(offset: u64, state: &'static str, source: FramingError) -> Self {
        Self::Decode {
            offset,
            state,
            source: Box::new(source),
        }
    }

    /// Build a quota error tagged with the fault a server would send.
    pub fn quota(message: impl Into<String>, fault: Option<&'static str>) -> Self {
        Self::QuotaExceeded {
            message: message.into(),
            fault,
        }
    }

    /// Map a fault string received from the peer to an error.
    pub fn from_fault(fault: &str) -> Self {
        match fault {
            faults::ENDPOINT_NOT_FOUND => {
                Self::EndpointNotFound("no endpoint is listening at the requested via".into())
            }
            faults::CONTENT_TYPE_INVALID => {
                Self::Protocol("the remote endpoint does not support the content type".into())
            }
            faults::SERVICE_ACTIVATION_FAILED => {
                Self::ServiceActivationFailed("the remote service could not be activated".into())
            }
            faults::CONNECTION_DISPATCH_FAILED => {
                Self::CommunicationFailed("the remote endpoint failed to dispatch the connection".into())
            }
            faults::ENDPOINT_UNAVAILABLE => {
                Self::EndpointUnavailable("the remote endpoint is unavailable".into())
            }
            faults::ENDPOINT_PAUSED => {
                Self::EndpointUnavailable("the remote endpoint is paused".into())
            }
            faults::MAX_MESSAGE_SIZE_EXCEEDED => Self::quota(
                "the message exceeded the remote endpoint's maximum message size",
                Some(faults::MAX_MESSAGE_SIZE_EXCEEDED),
            ),
            faults::UNSUPPORTED_MODE => {
                Self::Protocol("the remote endpoint does not support the framing mode".into())
            }
            faults::UNSUPPORTED_VERSION => {
                Self::Protocol("the remote endpoint does not support the framing version".into())
            }
            faults::UPGRADE_INVALID => {
                Self::UpgradeFailed("the remote endpoint rejected the upgrade request".into())
            }
            faults::CONTENT_TYPE_TOO_LONG => Self::quota(
                "the content type was too long for the remote endpoint",
                Some(faults::CONTENT_TYPE_TOO_LONG),
            ),
            faults::VIA_TOO_LONG => Self::quota(
                "the via was too long for the remote endpoint",
                Some(faults::VIA_TOO_LONG),
            ),
            faults::SERVER_TOO_BUSY => {
                Self::ServerTooBusy("the remote endpoint is too busy to accept the connection".into())
            }
            other => Self::Protocol(format!("remote endpoint sent unrecognized fault: {other}")),
        }
    }

    /// Coarse classification of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Protocol(_)
            | Self::PreambleAckIncorrect { .. }
            | Self::FramingEnded
            | Self::OversizedInteger
            | Self::Json(_)
            | Self::MsgPackEncode(_)
            | Self::MsgPackDecode(_)
            | Self::UpgradeFailed(_)
            | Self::InvalidOperation(_) => ErrorCategory::Protocol,
            Self::QuotaExceeded { .. } | Self::MessageTooLarge { .. } => ErrorCategory::Quota,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::EndpointNotFound(_) => ErrorCategory::EndpointNotFound,
            Self::ServerTooBusy(_) => ErrorCategory::ServerTooBusy,
            Self::ServiceActivationFailed(_) => ErrorCategory::ServiceActivation,
            Self::EndpointUnavailable(_) => ErrorCategory::EndpointUnavailable,
            Self::Io(_)
            | Self::ConnectionAborted
            | Self::ConnectionClosed
            | Self::PoolClosed
            | Self::CommunicationFailed(_)
            | Self::ChannelFaulted => ErrorCategory::Communication,
            Self::Decode { source, .. } => source.category(),
        }
    }

    /// Fault string a server would report for this error, if any.
    pub fn fault_string(&self) -> Option<&'static str> {
        match self {
            Self::QuotaExceeded { fault, .. } => *fault,
            Self::MessageTooLarge { .. } => Some(faults::MAX_MESSAGE_SIZE_EXCEEDED),
            Self::Decode { source, .. } => source.fault_string(),
            _ => None,
        }
    }

    /// Whether this error is a timeout (possibly wrapped by a decoder).
    pub fn is_timeout(&self) -> bool {
        self.category() == ErrorCategory::Timeout
    }
}

/// Result type alias using FramingError.
pub type Result<T> = std::result::Result<T, FramingError>;
