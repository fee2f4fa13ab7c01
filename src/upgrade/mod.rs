//! Stream upgrades and preamble negotiation.
//!
//! After the encoding record a client may ask the server to upgrade the raw
//! stream (for example to an authenticated or encrypted one) before the
//! preamble is acknowledged:
//!
//! ```text
//! client: preamble ─ UpgradeRequest(ct) ─ <upgrade bytes> ─ ... ─ PreambleEnd
//! server:                 UpgradeResponse ─ <upgrade bytes> ─ ... ─ PreambleAck | Fault
//! ```
//!
//! A [`StreamUpgradeProvider`] creates one [`StreamUpgradeInitiator`] per
//! connection; the initiator decides which upgrades to request and wraps the
//! connection for each one.

mod negotiator;
mod token;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::transport::BoxedConnection;
use crate::via::Via;

pub use negotiator::{resend_preamble, send_preamble};
pub use token::{CredentialProvider, SecurityToken, TokenUpgradeProvider, TOKEN_UPGRADE_CONTENT_TYPE};

/// Identity the server proved during an upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteIdentity(String);

impl RemoteIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Drives the upgrades of a single connection.
#[async_trait]
pub trait StreamUpgradeInitiator: Send {
    /// Content type of the next upgrade to request, or `None` when done.
    fn next_upgrade(&mut self) -> Option<String>;

    /// Run the upgrade protocol on `connection` after the server accepted
    /// it, returning the connection to use from now on.
    async fn initiate_upgrade(
        &mut self,
        connection: BoxedConnection,
        timeout: Duration,
    ) -> Result<(BoxedConnection, Option<RemoteIdentity>)>;
}

/// Factory for per-connection upgrade initiators.
pub trait StreamUpgradeProvider: Send + Sync {
    fn create_initiator(&self, via: &Via) -> Box<dyn StreamUpgradeInitiator>;

    /// Names the upgrades this provider runs.
    ///
    /// A pooled connection is only reused by channels whose providers report
    /// the same key, since reuse skips the upgrades.
    fn pool_key(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// A connection whose preamble was acknowledged.
pub struct Handshake {
    pub connection: BoxedConnection,
    pub remote_identity: Option<RemoteIdentity>,
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("remote_identity", &self.remote_identity)
            .finish_non_exhaustive()
    }
}
