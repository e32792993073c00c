use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
#[cfg(unix)]
use std::path::{Path, PathBuf};

use socket2::{Domain, Protocol, SockAddr};

/// Where a socket connects to or listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 TCP endpoint.
    Tcp(SocketAddrV4),
    /// Unix domain stream socket at a filesystem path.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Address {
    /// TCP endpoint from a host-order IPv4 address and a port.
    ///
    /// ```rust
    /// use tether_transport::Address;
    ///
    /// let addr = Address::ipv4(0x7F00_0001, 8080);
    /// assert_eq!(addr.to_string(), "127.0.0.1:8080");
    /// ```
    pub fn ipv4(host: u32, port: u16) -> Self {
        Self::Tcp(SocketAddrV4::new(Ipv4Addr::from(host), port))
    }

    pub fn tcp(ip: Ipv4Addr, port: u16) -> Self {
        Self::Tcp(SocketAddrV4::new(ip, port))
    }

    /// `127.0.0.1:port`. Port 0 lets the OS pick.
    pub fn localhost(port: u16) -> Self {
        Self::tcp(Ipv4Addr::LOCALHOST, port)
    }

    #[cfg(unix)]
    pub fn unix(path: impl AsRef<Path>) -> Self {
        Self::Unix(path.as_ref().to_path_buf())
    }

    /// The TCP port, if this is a TCP address.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp(addr) => Some(addr.port()),
            #[cfg(unix)]
            Self::Unix(_) => None,
        }
    }

    pub(crate) fn domain(&self) -> Domain {
        match self {
            Self::Tcp(_) => Domain::IPV4,
            #[cfg(unix)]
            Self::Unix(_) => Domain::UNIX,
        }
    }

    pub(crate) fn protocol(&self) -> Option<Protocol> {
        match self {
            Self::Tcp(_) => Some(Protocol::TCP),
            #[cfg(unix)]
            Self::Unix(_) => None,
        }
    }

    pub(crate) fn to_sock_addr(&self) -> std::io::Result<SockAddr> {
        match self {
            Self::Tcp(addr) => Ok(SockAddr::from(*addr)),
            #[cfg(unix)]
            Self::Unix(path) => SockAddr::unix(path),
        }
    }

    /// Only IPv4 addresses are recovered; unix peers are usually unnamed.
    pub(crate) fn from_sock_addr(addr: &SockAddr) -> Option<Self> {
        match addr.as_socket() {
            Some(SocketAddr::V4(v4)) => Some(Self::Tcp(v4)),
            _ => None,
        }
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self {
        Self::Tcp(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_is_host_order() {
        let addr = Address::ipv4(0xC0A8_0001, 9000);
        assert_eq!(addr, Address::tcp(Ipv4Addr::new(192, 168, 0, 1), 9000));
        assert_eq!(addr.port(), Some(9000));
    }

    #[test]
    fn test_sock_addr_roundtrip() {
        let addr = Address::localhost(4242);
        let sock = addr.to_sock_addr().unwrap();
        assert_eq!(Address::from_sock_addr(&sock), Some(addr));
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_display() {
        let addr = Address::unix("/tmp/tether.sock");
        assert_eq!(addr.to_string(), "unix:/tmp/tether.sock");
        assert_eq!(addr.port(), None);
    }
}
