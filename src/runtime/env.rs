//! The runtime environment: sockets and the client registry.
//!
//! The registry is the pair of maps the response path and the read path
//! share: token → connection for reads, client id → token for writes. The
//! two are kept mutual inverses by funnelling every mutation through
//! [`Env::bind_client`] and [`Env::drop_client`].

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use mio::net::TcpStream;
use mio::Token;

use crate::cluster::Cluster;
use crate::net::{Listener, UdpSocket};
use crate::runtime::MAX_DATAGRAM_SIZE;

/// One accepted client connection.
pub(crate) struct ClientConn<C> {
    pub stream: TcpStream,
    pub id: C,
}

/// Process-wide runtime context owned by the reactor.
pub(crate) struct Env<N, C> {
    pub me: N,
    pub cluster: Cluster<N>,
    pub peer: UdpSocket,
    pub listener: Listener,
    /// Reusable datagram receive buffer.
    pub recv_buf: Vec<u8>,
    clients: HashMap<Token, ClientConn<C>>,
    routes: HashMap<C, Token>,
}

impl<N, C> Env<N, C>
where
    N: Clone + Eq + Hash + fmt::Debug,
    C: Clone + Eq + Hash,
{
    pub fn new(me: N, cluster: Cluster<N>, peer: UdpSocket, listener: Listener) -> Self {
        Self {
            me,
            cluster,
            peer,
            listener,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            clients: HashMap::new(),
            routes: HashMap::new(),
        }
    }

    /// Records a newly accepted connection in both directions.
    pub fn bind_client(&mut self, token: Token, stream: TcpStream, id: C) {
        debug_assert!(!self.clients.contains_key(&token));
        debug_assert!(!self.routes.contains_key(&id));
        self.routes.insert(id.clone(), token);
        self.clients.insert(token, ClientConn { stream, id });
    }

    /// Removes a connection from both directions, returning it so the
    /// caller can deregister and close the stream.
    pub fn drop_client(&mut self, token: Token) -> Option<ClientConn<C>> {
        let conn = self.clients.remove(&token)?;
        self.routes.remove(&conn.id);
        Some(conn)
    }

    /// The connection dispatched under `token`, if still live.
    pub fn client(&mut self, token: Token) -> Option<&mut ClientConn<C>> {
        self.clients.get_mut(&token)
    }

    /// The token a client id's output should be written to.
    pub fn route(&self, id: &C) -> Option<Token> {
        self.routes.get(id).copied()
    }

    /// Number of live client connections.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::net::Endpoint;

    use super::*;

    fn test_env() -> Env<&'static str, u32> {
        let mut cluster = Cluster::new();
        cluster.insert("me", Endpoint::localhost(19001)).unwrap();
        let peer = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let listener = Listener::bind(Endpoint::localhost(0)).unwrap();
        Env::new("me", cluster, peer, listener)
    }

    /// Connected non-blocking stream for registry tests.
    fn test_stream() -> TcpStream {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = std::net::TcpStream::connect(addr).unwrap();
        stream.set_nonblocking(true).unwrap();
        TcpStream::from_std(stream)
    }

    #[test]
    fn registry_directions_are_mutual_inverses() {
        let mut env = test_env();
        env.bind_client(Token(10), test_stream(), 1);
        env.bind_client(Token(11), test_stream(), 2);

        assert_eq!(env.route(&1), Some(Token(10)));
        assert_eq!(env.route(&2), Some(Token(11)));
        assert_eq!(env.client(Token(10)).map(|c| c.id), Some(1));
        assert_eq!(env.client(Token(11)).map(|c| c.id), Some(2));
        assert_eq!(env.client_count(), 2);
    }

    #[test]
    fn drop_client_clears_both_directions() {
        let mut env = test_env();
        env.bind_client(Token(10), test_stream(), 1);

        let dropped = env.drop_client(Token(10)).expect("connection present");
        assert_eq!(dropped.id, 1);
        assert!(env.client(Token(10)).is_none());
        assert_eq!(env.route(&1), None);
        assert_eq!(env.client_count(), 0);
    }

    #[test]
    fn drop_client_is_idempotent() {
        let mut env = test_env();
        env.bind_client(Token(10), test_stream(), 1);

        assert!(env.drop_client(Token(10)).is_some());
        assert!(env.drop_client(Token(10)).is_none());
    }

    #[test]
    fn dropping_one_client_leaves_others_bound() {
        let mut env = test_env();
        env.bind_client(Token(10), test_stream(), 1);
        env.bind_client(Token(11), test_stream(), 2);

        env.drop_client(Token(10));

        assert_eq!(env.route(&2), Some(Token(11)));
        assert!(env.client(Token(11)).is_some());
    }
}
