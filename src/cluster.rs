//! The static cluster map: peer names and their datagram addresses.
//!
//! The map is bijective — sender identity is inferred by looking a source
//! address back up to a name, so two peers can no more share an address
//! than a name. It is built once at startup and never changes.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::io;

use thiserror::Error;

use crate::net::Endpoint;

/// Failure building or parsing a cluster map.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The same name was given two addresses.
    #[error("duplicate peer name {0}")]
    DuplicateName(String),
    /// The same address was given two names.
    #[error("duplicate peer address {0}")]
    DuplicateAddr(Endpoint),
    /// A name the arrangement's codec rejects.
    #[error("unrecognized peer name {name:?} on line {line}")]
    BadName { name: String, line: usize },
    /// A line that is not `name host:port`.
    #[error("malformed cluster entry on line {0}: expected `name host:port`")]
    Malformed(usize),
    /// An address that does not resolve.
    #[error("cannot resolve {addr}: {source}")]
    Resolve { addr: String, source: io::Error },
}

/// Bijective mapping between peer names and datagram endpoints.
pub struct Cluster<N> {
    by_name: HashMap<N, Endpoint>,
    by_addr: HashMap<Endpoint, N>,
}

impl<N> Default for Cluster<N> {
    fn default() -> Self {
        Self {
            by_name: HashMap::new(),
            by_addr: HashMap::new(),
        }
    }
}

impl<N: Clone + Eq + Hash + fmt::Debug> Cluster<N> {
    /// Creates an empty cluster map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a peer, rejecting duplicates in either direction.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::DuplicateName`] or
    /// [`ClusterError::DuplicateAddr`] if either key is already mapped.
    pub fn insert(&mut self, name: N, addr: Endpoint) -> Result<(), ClusterError> {
        if self.by_name.contains_key(&name) {
            return Err(ClusterError::DuplicateName(format!("{name:?}")));
        }
        if self.by_addr.contains_key(&addr) {
            return Err(ClusterError::DuplicateAddr(addr));
        }
        self.by_name.insert(name.clone(), addr);
        self.by_addr.insert(addr, name);
        Ok(())
    }

    /// Looks up a peer's datagram address.
    #[must_use]
    pub fn addr_of(&self, name: &N) -> Option<Endpoint> {
        self.by_name.get(name).copied()
    }

    /// Identifies the peer bound to a source address.
    #[must_use]
    pub fn name_of(&self, addr: Endpoint) -> Option<&N> {
        self.by_addr.get(&addr)
    }

    /// Whether a name is part of the cluster.
    #[must_use]
    pub fn contains(&self, name: &N) -> bool {
        self.by_name.contains_key(name)
    }

    /// Iterates over the peer names, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &N> {
        self.by_name.keys()
    }

    /// Number of peers in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Parses a cluster map from its text form.
///
/// One peer per line as `name host:port`; blank lines and `#` comments are
/// ignored. Names go through the supplied decoder (normally the
/// arrangement's name codec), hosts through the system resolver.
///
/// # Errors
///
/// Returns the first malformed line, rejected name, unresolvable address,
/// or duplicate entry.
pub fn parse_cluster<N, F>(decode_name: F, text: &str) -> Result<Cluster<N>, ClusterError>
where
    N: Clone + Eq + Hash + fmt::Debug,
    F: Fn(&str) -> Option<N>,
{
    let mut cluster = Cluster::new();
    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let entry = raw.split('#').next().unwrap_or("").trim();
        if entry.is_empty() {
            continue;
        }

        let mut fields = entry.split_whitespace();
        let (name_text, addr_text) = match (fields.next(), fields.next(), fields.next()) {
            (Some(name), Some(addr), None) => (name, addr),
            _ => return Err(ClusterError::Malformed(line)),
        };

        let name = decode_name(name_text).ok_or_else(|| ClusterError::BadName {
            name: name_text.to_owned(),
            line,
        })?;
        let addr = Endpoint::resolve(addr_text).map_err(|source| ClusterError::Resolve {
            addr: addr_text.to_owned(),
            source,
        })?;
        cluster.insert(name, addr)?;
    }
    Ok(cluster)
}
