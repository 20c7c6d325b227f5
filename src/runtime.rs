//! The single-threaded readiness loop hosting an arrangement.
//!
//! - `task`: per-source task records (select flag, wake deadline, kind tag).
//! - `env`: sockets plus the bidirectional client registry.
//! - `reactor`: the event loop itself — poll, dispatch, deliver, retire.

mod env;
mod reactor;
mod task;

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::cluster::Cluster;
use crate::net::Endpoint;

pub use reactor::Runtime;

/// Largest datagram a peer may send: one serialized message per datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65536;

/// Longest the loop will sleep when nothing is ready and no timer is due.
pub const DEFAULT_POLL_CAP: Duration = Duration::from_secs(1);

/// Startup parameters for a node.
pub struct RuntimeConfig<N> {
    /// This node's own name; must appear in `cluster`.
    pub me: N,
    /// The full peer map, this node included.
    pub cluster: Cluster<N>,
    /// Where to listen for client connections.
    pub client_bind: Endpoint,
    /// Upper bound on one poll's sleep.
    pub poll_cap: Duration,
}

impl<N> RuntimeConfig<N> {
    /// Config with the client listener on all interfaces at `client_port`
    /// and the default polling cap.
    pub fn new(me: N, cluster: Cluster<N>, client_port: u16) -> Self {
        Self {
            me,
            cluster,
            client_bind: Endpoint::any(client_port),
            poll_cap: DEFAULT_POLL_CAP,
        }
    }
}

/// Fatal startup failure; the node cannot run.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The local name has no entry in the cluster map.
    #[error("local node {0} is missing from the cluster map")]
    NotInCluster(String),
    /// The peer datagram socket could not be bound.
    #[error("failed to bind peer socket on {addr}: {source}")]
    BindPeer { addr: Endpoint, source: io::Error },
    /// The client listener could not be bound.
    #[error("failed to bind client listener on {addr}: {source}")]
    BindListener { addr: Endpoint, source: io::Error },
    /// Readiness infrastructure failed to come up.
    #[error("readiness polling setup failed: {0}")]
    Io(#[from] io::Error),
}
