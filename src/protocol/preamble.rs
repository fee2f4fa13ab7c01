//! Connection preamble construction.
//!
//! A preamble is the fixed run of records a client writes first on every
//! connection:
//! ```text
//! Version(1.0) Mode Via(uri) KnownEncoding | ExtensibleEncoding(ct) [PreambleEnd]
//! ```
//! `PreambleEnd` is only appended directly when no upgrade provider is
//! configured; otherwise it follows the upgrade exchange.

use bytes::{Bytes, BytesMut};

use crate::error::{FramingError, Result};
use crate::protocol::faults;
use crate::protocol::record::Record;
use crate::protocol::wire_format::{
    FramingMode, KnownEncoding, MAX_CONTENT_TYPE_SIZE, MAX_VIA_SIZE, VERSION_MAJOR,
    VERSION_MINOR,
};

/// Encoded preamble for one `(mode, via, content type)` combination.
///
/// Built once per channel factory and reused for every connection.
#[derive(Debug, Clone)]
pub struct Preamble {
    mode: FramingMode,
    via: String,
    content_type: String,
    initial: Bytes,
    reuse: Bytes,
}

impl Preamble {
    /// Encode the preamble.
    ///
    /// With `upgrade_configured` the initial bytes stop before `PreambleEnd`
    /// so that upgrade requests can follow.
    pub fn build(
        mode: FramingMode,
        via: &str,
        content_type: &str,
        upgrade_configured: bool,
    ) -> Result<Self> {
        if via.len() > MAX_VIA_SIZE {
            return Err(FramingError::quota(
                format!("via of {} bytes exceeds {MAX_VIA_SIZE} bytes", via.len()),
                Some(faults::VIA_TOO_LONG),
            ));
        }
        if content_type.len() > MAX_CONTENT_TYPE_SIZE {
            return Err(FramingError::quota(
                format!(
                    "content type of {} bytes exceeds {MAX_CONTENT_TYPE_SIZE} bytes",
                    content_type.len()
                ),
                Some(faults::CONTENT_TYPE_TOO_LONG),
            ));
        }

        let encoding = match KnownEncoding::from_content_type(content_type) {
            Some(known) => Record::KnownEncoding(known),
            None => Record::ExtensibleEncoding(content_type.to_string()),
        };

        let mut buf = BytesMut::new();
        Record::Version {
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
        }
        .encode_into(&mut buf)?;
        Record::Mode(mode).encode_into(&mut buf)?;
        Record::Via(via.to_string()).encode_into(&mut buf)?;
        encoding.encode_into(&mut buf)?;

        let mut full = buf.clone();
        Record::PreambleEnd.encode_into(&mut full)?;
        let reuse = full.freeze();
        let initial = if upgrade_configured {
            buf.freeze()
        } else {
            reuse.clone()
        };

        Ok(Self {
            mode,
            via: via.to_string(),
            content_type: content_type.to_string(),
            initial,
            reuse,
        })
    }

    /// Bytes for a brand-new connection.
    #[inline]
    pub fn initial(&self) -> &Bytes {
        &self.initial
    }

    /// Bytes for a pooled connection that already went through any upgrades.
    #[inline]
    pub fn reuse(&self) -> &Bytes {
        &self.reuse
    }

    #[inline]
    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    #[inline]
    pub fn via(&self) -> &str {
        &self.via
    }

    #[inline]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }
}
