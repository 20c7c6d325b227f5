//! Network endpoint type.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

/// A network endpoint (IP address + port).
///
/// Wrapper around [`SocketAddr`] used for both sides of the shim: peer
/// datagram addresses in the cluster map and the client listener bind
/// address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// Creates a new endpoint from an IP address and port.
    #[must_use]
    pub const fn new(addr: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(addr, port))
    }

    /// Creates an endpoint bound to all interfaces (0.0.0.0) on the given port.
    #[must_use]
    pub const fn any(port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    /// Creates a localhost endpoint on the given port.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// Resolves a `host:port` string to an endpoint.
    ///
    /// Hostnames go through the system resolver; the first resolved
    /// address wins. Cluster files use this for their address column.
    ///
    /// # Errors
    ///
    /// Returns an error if resolution fails or yields no addresses.
    pub fn resolve(text: &str) -> io::Result<Self> {
        let addr = text.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{text} resolved to no addresses"),
            )
        })?;
        Ok(Self(addr))
    }

    /// Returns the IP address.
    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    /// Returns the port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    /// Returns the underlying [`SocketAddr`].
    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        ep.0
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_any() {
        let ep = Endpoint::any(9000);
        assert_eq!(ep.ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(ep.port(), 9000);
    }

    #[test]
    fn endpoint_localhost() {
        let ep = Endpoint::localhost(3000);
        assert_eq!(ep.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(ep.port(), 3000);
    }

    #[test]
    fn endpoint_resolve_literal() {
        let ep = Endpoint::resolve("127.0.0.1:9001").unwrap();
        assert_eq!(ep, Endpoint::localhost(9001));
    }

    #[test]
    fn endpoint_resolve_garbage() {
        assert!(Endpoint::resolve("not an address").is_err());
    }

    #[test]
    fn endpoint_from_socket_addr() {
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let ep = Endpoint::from(addr);
        assert_eq!(ep.as_socket_addr(), addr);
    }

    #[test]
    fn endpoint_display() {
        let ep = Endpoint::localhost(8080);
        assert_eq!(format!("{ep}"), "127.0.0.1:8080");
    }
}
