//! Channel and pool configuration.
//!
//! Both settings types deserialize from JSON with durations in milliseconds:
//!
//! ```ignore
//! use netframe_client::config::PoolSettings;
//!
//! let settings = PoolSettings::from_json(r#"{
//!     "group_name": "orders",
//!     "idle_timeout": 30000
//! }"#)?;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default maximum size of a single buffered envelope (64 KiB).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Default maximum size of a received message (64 KiB).
pub const DEFAULT_MAX_RECEIVED_MESSAGE_SIZE: usize = 64 * 1024;

/// Default size of connection read and write buffers.
pub const DEFAULT_CONNECTION_BUFFER_SIZE: usize = 8 * 1024;

/// Default delay before buffered output is flushed.
pub const DEFAULT_MAX_OUTPUT_DELAY: Duration = Duration::from_millis(200);

/// Default budget for opening a channel.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(60);

/// Default budget for closing a channel.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default budget for a single send.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default budget for a single receive.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(600);

/// Default pool group name.
pub const DEFAULT_GROUP_NAME: &str = "default";

/// Default number of idle connections kept per endpoint.
pub const DEFAULT_MAX_OUTBOUND_CONNECTIONS_PER_ENDPOINT: usize = 10;

/// Default time an idle connection may stay pooled.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default maximum lifetime of a pooled connection.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(300);

/// Serde adapter for durations stored as integer milliseconds.
///
/// `u64::MAX` round-trips as `Duration::MAX` (no deadline).
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        if millis == u64::MAX {
            Ok(Duration::MAX)
        } else {
            Ok(Duration::from_millis(millis))
        }
    }
}

/// Channel-level framing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingSettings {
    /// Largest envelope accepted from the peer.
    pub max_buffer_size: usize,
    /// Largest complete message accepted from the peer.
    pub max_received_message_size: usize,
    /// Read buffer size and chunk size for outgoing bodies.
    pub connection_buffer_size: usize,
    #[serde(with = "duration_ms")]
    pub max_output_delay: Duration,
    #[serde(with = "duration_ms")]
    pub open_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub close_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub send_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub receive_timeout: Duration,
    /// Wrap new connections in a write-batching buffer.
    pub buffered_writes: bool,
}

impl Default for FramingSettings {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            max_received_message_size: DEFAULT_MAX_RECEIVED_MESSAGE_SIZE,
            connection_buffer_size: DEFAULT_CONNECTION_BUFFER_SIZE,
            max_output_delay: DEFAULT_MAX_OUTPUT_DELAY,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            buffered_writes: false,
        }
    }
}

impl FramingSettings {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Extra compatibility rule for sharing a pool between factories.
pub trait PoolCompatibility: fmt::Debug + Send + Sync {
    fn is_compatible(&self, other: &PoolSettings) -> bool;
}

/// Connection pool settings.
///
/// Two factories share a pool only when their settings are compatible.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub group_name: String,
    pub buffer_size: usize,
    /// Idle connections kept per endpoint.
    pub max_outbound_connections_per_endpoint: usize,
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub lease_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub max_output_delay: Duration,
    #[serde(skip)]
    pub compatibility: Option<Arc<dyn PoolCompatibility>>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            group_name: DEFAULT_GROUP_NAME.to_string(),
            buffer_size: DEFAULT_CONNECTION_BUFFER_SIZE,
            max_outbound_connections_per_endpoint: DEFAULT_MAX_OUTBOUND_CONNECTIONS_PER_ENDPOINT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            max_output_delay: DEFAULT_MAX_OUTPUT_DELAY,
            compatibility: None,
        }
    }
}

impl PoolSettings {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Whether a pool built with `self` may serve a factory with `other`.
    pub fn is_compatible(&self, other: &PoolSettings) -> bool {
        self.group_name == other.group_name
            && self.buffer_size == other.buffer_size
            && self.max_outbound_connections_per_endpoint
                == other.max_outbound_connections_per_endpoint
            && self.idle_timeout == other.idle_timeout
            && self.lease_timeout == other.lease_timeout
            && self.max_output_delay == other.max_output_delay
            && self
                .compatibility
                .as_ref()
                .map_or(true, |rule| rule.is_compatible(other))
            && other
                .compatibility
                .as_ref()
                .map_or(true, |rule| rule.is_compatible(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_defaults() {
        let settings = FramingSettings::default();
        assert_eq!(settings.max_buffer_size, DEFAULT_MAX_BUFFER_SIZE);
        assert_eq!(settings.max_output_delay, Duration::from_millis(200));
        assert!(!settings.buffered_writes);
    }

    #[test]
    fn test_framing_from_json_partial() {
        let settings =
            FramingSettings::from_json(r#"{"max_buffer_size": 1024, "open_timeout": 1500}"#)
                .unwrap();
        assert_eq!(settings.max_buffer_size, 1024);
        assert_eq!(settings.open_timeout, Duration::from_millis(1500));
        assert_eq!(settings.close_timeout, DEFAULT_CLOSE_TIMEOUT);
    }

    #[test]
    fn test_pool_from_json_infinite_idle() {
        let json = format!(r#"{{"group_name": "g", "idle_timeout": {}}}"#, u64::MAX);
        let settings = PoolSettings::from_json(&json).unwrap();
        assert_eq!(settings.group_name, "g");
        assert_eq!(settings.idle_timeout, Duration::MAX);
    }

    #[test]
    fn test_pool_settings_serialize_millis() {
        let json = serde_json::to_value(PoolSettings::default()).unwrap();
        assert_eq!(json["idle_timeout"], 120_000);
        assert!(json.get("compatibility").is_none());
    }

    #[test]
    fn test_invalid_json() {
        assert!(FramingSettings::from_json("not json").is_err());
    }

    #[test]
    fn test_compatibility_exact_fields() {
        let a = PoolSettings::default();
        let mut b = PoolSettings::default();
        assert!(a.is_compatible(&b));

        b.idle_timeout = Duration::from_secs(1);
        assert!(!a.is_compatible(&b));

        let mut c = PoolSettings::default();
        c.group_name = "other".into();
        assert!(!a.is_compatible(&c));
    }

    #[derive(Debug)]
    struct RejectAll;

    impl PoolCompatibility for RejectAll {
        fn is_compatible(&self, _other: &PoolSettings) -> bool {
            false
        }
    }

    #[test]
    fn test_custom_compatibility_rule() {
        let a = PoolSettings::default();
        let mut b = PoolSettings::default();
        b.compatibility = Some(Arc::new(RejectAll));
        assert!(!a.is_compatible(&b));
        assert!(!b.is_compatible(&a));
    }
}
