#[cfg(test)]
#[path = "tests/socket.rs"]
mod tests;

use core::fmt;
use core::net::SocketAddr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Unix,
    Ipv4,
    Ipv6,
}

/// A local socket endpoint, either a filesystem path or a loopback address.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(tag = "kind", content = "address", rename_all = "lowercase")]
pub enum SocketAddress {
    Unix(Utf8PathBuf),
    Inet(SocketAddr),
}

impl SocketAddress {
    #[must_use]
    pub const fn kind(&self) -> AddressKind {
        match self {
            Self::Unix(_) => AddressKind::Unix,
            Self::Inet(SocketAddr::V4(_)) => AddressKind::Ipv4,
            Self::Inet(SocketAddr::V6(_)) => AddressKind::Ipv6,
        }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{path}"),
            Self::Inet(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

/// Who may connect to a socket a tube listens on.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(tag = "type", content = "param", rename_all = "lowercase")]
pub enum AccessControl {
    /// Any local process.
    #[default]
    Localhost,
    /// Only connections whose source port matches.
    Port(u16),
    /// Connections that authenticate by passing a credentials byte.
    Credentials(u8),
}

impl AccessControl {
    /// Whether a listener of `kind` can enforce this policy.
    #[must_use]
    pub const fn supported_for(self, kind: AddressKind) -> bool {
        match self {
            Self::Localhost => true,
            Self::Port(_) => matches!(kind, AddressKind::Ipv4 | AddressKind::Ipv6),
            Self::Credentials(_) => false,
        }
    }

    /// Whether a connection arriving from `source_port` passes this policy.
    #[must_use]
    pub fn admits(self, source_port: Option<u16>) -> bool {
        match self {
            Self::Localhost => true,
            Self::Port(port) => source_port == Some(port),
            Self::Credentials(_) => false,
        }
    }
}
