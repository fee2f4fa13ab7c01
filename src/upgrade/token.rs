//! Token-based stream upgrade.
//!
//! The client sends an opaque security token obtained from a
//! [`CredentialProvider`]; the server answers with the identity it
//! authenticated as. Both are varint-length-prefixed:
//!
//! ```text
//! client: [varint len][token bytes]
//! server: [varint len][UTF-8 identity]
//! ```
//!
//! The stream itself is not transformed; later records flow over the same
//! connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};

use super::{RemoteIdentity, StreamUpgradeInitiator, StreamUpgradeProvider};
use crate::error::Result;
use crate::protocol::{varint, StringDecoder, StringKind};
use crate::timeout::TimeoutHelper;
use crate::transport::{read_byte, BoxedConnection, Connection};
use crate::via::Via;

/// Upgrade content type requested by [`TokenUpgradeProvider`].
pub const TOKEN_UPGRADE_CONTENT_TYPE: &str = "application/negotiate";

/// Opaque credential sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityToken(Bytes);

impl SecurityToken {
    pub fn new(token: impl Into<Bytes>) -> Self {
        Self(token.into())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Source of security tokens.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_token(&self, timeout: Duration) -> Result<SecurityToken>;
}

/// Upgrade provider that authenticates each new connection with a token.
#[derive(Clone)]
pub struct TokenUpgradeProvider {
    credentials: Arc<dyn CredentialProvider>,
}

impl TokenUpgradeProvider {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self { credentials }
    }
}

impl StreamUpgradeProvider for TokenUpgradeProvider {
    fn create_initiator(&self, via: &Via) -> Box<dyn StreamUpgradeInitiator> {
        Box::new(TokenUpgradeInitiator {
            credentials: Arc::clone(&self.credentials),
            via: via.to_string(),
            offered: false,
        })
    }
}

struct TokenUpgradeInitiator {
    credentials: Arc<dyn CredentialProvider>,
    via: String,
    offered: bool,
}

impl TokenUpgradeInitiator {
    async fn exchange(
        &self,
        connection: &dyn Connection,
        timeout: Duration,
    ) -> Result<Option<RemoteIdentity>> {
        let helper = TimeoutHelper::new(timeout);
        let token = self.credentials.get_token(helper.remaining()?).await?;

        let bytes = token.as_bytes();
        let mut buf = BytesMut::with_capacity(varint::MAX_ENCODED_SIZE + bytes.len());
        varint::encode_into(varint::checked_len(bytes.len())?, &mut buf);
        buf.put_slice(bytes);
        connection.write(&buf, true, helper.remaining()?).await?;

        let mut identity = StringDecoder::new(StringKind::Identity);
        while !identity.is_done() {
            let byte = read_byte(connection, helper.remaining()?).await?;
            identity.decode(&[byte])?;
        }
        Ok(identity
            .take_value()
            .filter(|id| !id.is_empty())
            .map(RemoteIdentity::new))
    }
}

#[async_trait]
impl StreamUpgradeInitiator for TokenUpgradeInitiator {
    fn next_upgrade(&mut self) -> Option<String> {
        if self.offered {
            return None;
        }
        self.offered = true;
        Some(TOKEN_UPGRADE_CONTENT_TYPE.to_string())
    }

    async fn initiate_upgrade(
        &mut self,
        connection: BoxedConnection,
        timeout: Duration,
    ) -> Result<(BoxedConnection, Option<RemoteIdentity>)> {
        match self.exchange(connection.as_ref(), timeout).await {
            Ok(identity) => {
                tracing::debug!(via = %self.via, identity = ?identity, "token upgrade complete");
                Ok((connection, identity))
            }
            Err(e) => {
                tracing::warn!(via = %self.via, error = %e, "token upgrade failed");
                connection.abort();
                Err(e)
            }
        }
    }
}
