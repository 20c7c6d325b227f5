//! Runtime shim for verified distributed-system nodes.
//!
//! A node's protocol logic arrives as an *arrangement*: a deterministic
//! handler (see [`Arrangement`]) produced by a verification framework that
//! knows nothing about sockets, timeouts, or scheduling. This crate gives
//! that handler a live environment:
//!
//! - unordered peer-to-peer messaging over UDP datagrams,
//! - length-framed request/response streams for clients over TCP,
//! - periodic timer callbacks with handler-supplied intervals,
//!
//! all driven by a single-threaded readiness loop ([`Runtime`]) so that
//! every handler invocation is serialized, exactly as the handler's
//! semantics assume.

pub mod arrangement;
pub mod chunk;
pub mod cluster;
pub mod net;
pub mod runtime;
pub mod trace;

pub use arrangement::{Arrangement, Step, TimeoutTask};
pub use cluster::{parse_cluster, Cluster, ClusterError};
pub use net::Endpoint;
pub use runtime::{NodeError, Runtime, RuntimeConfig};
pub use trace::init_tracing;
