//! Socket wrappers for mio-based I/O.
//!
//! Thin wrappers around [`mio::net::UdpSocket`] and [`mio::net::TcpListener`]
//! whose `try_*` methods fold `WouldBlock` into `Ok(None)`, the shape a
//! readiness loop wants: drain until `None`, never treat a dry socket as an
//! error.

use std::io::{self, ErrorKind};
use std::os::fd::{AsFd, BorrowedFd};

use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UdpSocket as MioUdpSocket};
use mio::{Interest, Registry, Token};

use super::Endpoint;

/// A non-blocking UDP socket carrying one serialized peer message per
/// datagram.
pub struct UdpSocket {
    inner: MioUdpSocket,
}

impl UdpSocket {
    /// Creates a new UDP socket bound to the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound (e.g., address in use).
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioUdpSocket::bind(endpoint.into())?;
        Ok(Self { inner })
    }

    /// Returns the local address this socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Attempts to send a datagram, returning `Ok(None)` instead of
    /// `WouldBlock`.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure other than the socket being busy.
    pub fn try_send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<Option<usize>> {
        match self.inner.send_to(buf, dest.into()) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts to receive a datagram, returning `Ok(None)` instead of
    /// `WouldBlock`.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure other than no data being available.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
        match self.inner.recv_from(buf) {
            Ok((n, addr)) => Ok(Some((n, Endpoint::from(addr)))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sets the socket's receive buffer size.
    ///
    /// The kernel default is often too small to absorb a burst of
    /// maximum-size datagrams between two polls.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        // mio doesn't expose socket options; go through rustix.
        let fd = self.inner.as_fd();
        rustix::net::sockopt::set_socket_recv_buffer_size(fd, size)?;
        Ok(())
    }
}

impl AsFd for UdpSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Source for UdpSocket {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}

/// A non-blocking TCP listener for client connections.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Creates a listener bound to the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = TcpListener::bind(endpoint.into())?;
        Ok(Self { inner })
    }

    /// Returns the local address this listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Attempts to accept one connection, returning `Ok(None)` instead of
    /// `WouldBlock`.
    ///
    /// The returned stream is non-blocking and unregistered; the caller
    /// registers it for readiness under its own token.
    ///
    /// # Errors
    ///
    /// Returns an error on accept failure other than no connection being
    /// pending.
    pub fn try_accept(&self) -> io::Result<Option<(TcpStream, Endpoint)>> {
        match self.inner.accept() {
            Ok((stream, addr)) => Ok(Some((stream, Endpoint::from(addr)))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Source for Listener {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn recv_with_deadline(socket: &UdpSocket, buf: &mut [u8]) -> Option<(usize, Endpoint)> {
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            if let Some(got) = socket.try_recv_from(buf).unwrap() {
                return Some(got);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn socket_bind_and_local_addr() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_eq!(
            addr.ip(),
            std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
        );
        assert_ne!(addr.port(), 0); // OS assigned a port
    }

    #[test]
    fn socket_send_recv_loopback() {
        let sender = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let receiver = UdpSocket::bind(Endpoint::localhost(0)).unwrap();

        let receiver_addr = receiver.local_addr().unwrap();

        let msg = b"hello";
        let sent = sender.try_send_to(msg, receiver_addr).unwrap();
        assert_eq!(sent, Some(msg.len()));

        let mut buf = [0u8; 64];
        let (received, from) = recv_with_deadline(&receiver, &mut buf).expect("datagram arrives");
        assert_eq!(received, msg.len());
        assert_eq!(&buf[..received], msg);
        assert_eq!(from, sender.local_addr().unwrap());
    }

    #[test]
    fn socket_try_recv_empty() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let mut buf = [0u8; 64];
        let result = socket.try_recv_from(&mut buf).unwrap();
        assert!(result.is_none()); // no data, not an error
    }

    #[test]
    fn socket_recv_buffer_size() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        socket.set_recv_buffer_size(256 * 1024).unwrap();
    }

    #[test]
    fn listener_accept_pending_none() {
        let listener = Listener::bind(Endpoint::localhost(0)).unwrap();
        assert!(listener.try_accept().unwrap().is_none());
    }

    #[test]
    fn listener_accepts_connection() {
        let listener = Listener::bind(Endpoint::localhost(0)).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::net::TcpStream::connect(addr.as_socket_addr()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        let accepted = loop {
            if let Some(got) = listener.try_accept().unwrap() {
                break got;
            }
            assert!(Instant::now() < deadline, "accept timed out");
            std::thread::sleep(Duration::from_millis(1));
        };

        assert_eq!(
            accepted.1.as_socket_addr(),
            client.local_addr().unwrap()
        );
    }
}
