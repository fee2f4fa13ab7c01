//! Target addresses ("vias").
//!
//! A via is the URI announced in the preamble, e.g.
//! `net.tcp://orders.internal:808/OrderService`. Its scheme and authority
//! also decide which pooled connections may be shared.

use std::fmt;

use crate::error::{FramingError, Result};

/// Port used when a `net.tcp` via has none.
pub const DEFAULT_NET_TCP_PORT: u16 = 808;

/// A parsed via URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Via {
    uri: String,
    scheme: String,
    host: String,
    port: u16,
    path: String,
}

impl Via {
    /// Parse `scheme://host[:port][/path]`.
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |reason: &str| FramingError::Protocol(format!("invalid via '{uri}': {reason}"));

        let (scheme, rest) = uri.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        if scheme.is_empty() {
            return Err(invalid("missing scheme"));
        }
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        let (host, port) = if let Some(stripped) = authority.strip_prefix('[') {
            // [v6addr]:port
            let (host, after) = stripped
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 address"))?;
            let port = match after.strip_prefix(':') {
                Some(p) => Some(p),
                None if after.is_empty() => None,
                None => return Err(invalid("unexpected characters after host")),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid("bad port"))?,
            None => default_port(scheme).ok_or_else(|| invalid("missing port"))?,
        };

        Ok(Self {
            uri: uri.to_string(),
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// The URI exactly as given.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.uri
    }

    #[inline]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Key under which connections to this via are pooled.
    pub fn pool_key(&self) -> String {
        let host = self.host.to_ascii_lowercase();
        if host.contains(':') {
            format!("{}://[{}]:{}", self.scheme, host, self.port)
        } else {
            format!("{}://{}:{}", self.scheme, host, self.port)
        }
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    scheme
        .eq_ignore_ascii_case("net.tcp")
        .then_some(DEFAULT_NET_TCP_PORT)
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_via() {
        let via = Via::parse("net.tcp://Orders.Internal:9000/OrderService").unwrap();
        assert_eq!(via.scheme(), "net.tcp");
        assert_eq!(via.host(), "Orders.Internal");
        assert_eq!(via.port(), 9000);
        assert_eq!(via.path(), "/OrderService");
        assert_eq!(via.as_str(), "net.tcp://Orders.Internal:9000/OrderService");
    }

    #[test]
    fn test_parse_default_port() {
        let via = Via::parse("net.tcp://host").unwrap();
        assert_eq!(via.port(), DEFAULT_NET_TCP_PORT);
        assert_eq!(via.path(), "/");
    }

    #[test]
    fn test_parse_ipv6() {
        let via = Via::parse("net.tcp://[::1]:8080/svc").unwrap();
        assert_eq!(via.host(), "::1");
        assert_eq!(via.port(), 8080);
        assert_eq!(via.pool_key(), "net.tcp://[::1]:8080");
    }

    #[test]
    fn test_pool_key_ignores_path_and_case() {
        let a = Via::parse("NET.TCP://Host:808/A").unwrap();
        let b = Via::parse("net.tcp://host/B").unwrap();
        assert_eq!(a.pool_key(), b.pool_key());
        assert_eq!(a.pool_key(), "net.tcp://host:808");
    }

    #[test]
    fn test_parse_errors() {
        assert!(Via::parse("host:808/svc").is_err());
        assert!(Via::parse("net.tcp:///svc").is_err());
        assert!(Via::parse("net.tcp://host:notaport/").is_err());
        assert!(Via::parse("custom://host/").is_err());
    }
}
