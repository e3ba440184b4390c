//! Client identifier derivation.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// An opaque key that identifies the client a request came from.
///
/// Derived from the IP of the peer address; the port is ignored so that
/// several connections from one host share a single quota.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    /// Create a client identifier from an arbitrary key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive the identifier for a peer socket address.
    pub fn from_peer(addr: SocketAddr) -> Self {
        Self::from(addr.ip())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<IpAddr> for ClientId {
    fn from(ip: IpAddr) -> Self {
        // Fold IPv4-mapped IPv6 peers onto their IPv4 form.
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            other => other,
        };
        Self(ip.to_string())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
