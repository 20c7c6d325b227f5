//! The contract between the shim and the verified handler it hosts.
//!
//! An *arrangement* is the node's entire protocol logic, produced by a
//! verification framework as a deterministic state machine: one input, one
//! state transition, one batch of outputs. The shim never inspects any of
//! it — messages, inputs, outputs, and state are opaque associated types,
//! and the arrangement supplies its own wire codecs.
//!
//! Handlers take the state by value and hand back a [`Step`]; the runtime
//! threads that state through a single-threaded loop, so every invocation
//! observes the effects of every earlier one.

use std::fmt;
use std::hash::Hash;
use std::time::Duration;

/// The result of one handler invocation: client responses to send, peer
/// messages to transmit, and the successor state.
pub struct Step<A: Arrangement + ?Sized> {
    /// Responses addressed to clients (each carries its own target id).
    pub outputs: Vec<A::Output>,
    /// The successor handler state.
    pub state: A::State,
    /// Messages to transmit, one datagram each.
    pub sends: Vec<(A::Name, A::Msg)>,
}

impl<A: Arrangement + ?Sized> Step<A> {
    /// A step with no outputs and no sends.
    #[must_use]
    pub fn new(state: A::State) -> Self {
        Self {
            outputs: Vec::new(),
            state,
            sends: Vec::new(),
        }
    }

    /// Adds a client response to the step.
    #[must_use]
    pub fn output(mut self, output: A::Output) -> Self {
        self.outputs.push(output);
        self
    }

    /// Adds a peer message to the step.
    #[must_use]
    pub fn send(mut self, to: A::Name, msg: A::Msg) -> Self {
        self.sends.push((to, msg));
        self
    }
}

/// A periodic timer declared by the arrangement.
///
/// The interval function is consulted again after every firing, under the
/// post-dispatch state, so back-off and jitter schemes fall out naturally.
pub struct TimeoutTask<A: Arrangement + ?Sized> {
    /// Short name used in log lines.
    pub label: &'static str,
    /// Invoked when the timer fires.
    pub handler: fn(&A, &A::Name, A::State) -> Step<A>,
    /// Produces the delay until the next firing.
    pub interval: fn(&A, &A::Name, &A::State) -> Duration,
}

impl<A: Arrangement + ?Sized> Clone for TimeoutTask<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A: Arrangement + ?Sized> Copy for TimeoutTask<A> {}

/// A hosted node: deterministic handlers plus the codecs for everything
/// that crosses a socket.
///
/// The handler is assumed total over its declared inputs — it returns a
/// [`Step`] for every input the deserializers accept and never panics.
pub trait Arrangement {
    /// Peer identity; the key of the cluster map.
    type Name: Clone + Eq + Hash + fmt::Debug;
    /// The handler state threaded through the event loop.
    type State;
    /// A decoded client request.
    type Input;
    /// A client response, self-addressed via [`Arrangement::serialize_output`].
    type Output;
    /// A peer-to-peer message.
    type Msg;
    /// Opaque per-connection identifier, fresh on every accept.
    type ClientId: Clone + Eq + Hash;

    /// Produces the initial state for this node.
    fn init(&self, me: &Self::Name) -> Self::State;

    /// Handles one client request.
    fn on_input(&self, me: &Self::Name, input: Self::Input, state: Self::State) -> Step<Self>;

    /// Handles one peer message.
    fn on_peer(
        &self,
        me: &Self::Name,
        src: &Self::Name,
        msg: Self::Msg,
        state: Self::State,
    ) -> Step<Self>;

    /// Encodes a peer message for the wire.
    fn serialize_msg(&self, msg: &Self::Msg) -> Vec<u8>;

    /// Decodes a peer message; `None` drops the datagram.
    fn deserialize_msg(&self, bytes: &[u8]) -> Option<Self::Msg>;

    /// Decodes a client request; `None` disconnects the client.
    ///
    /// The connection's id is supplied so the input can carry its origin
    /// through the handler and back out via an output.
    fn deserialize_input(&self, bytes: &[u8], client: &Self::ClientId) -> Option<Self::Input>;

    /// Encodes a client response and names the connection it belongs to.
    fn serialize_output(&self, output: &Self::Output) -> (Self::ClientId, Vec<u8>);

    /// Renders a name for configuration and log output.
    fn serialize_name(&self, name: &Self::Name) -> String;

    /// Parses a name from configuration text; `None` rejects the entry.
    fn deserialize_name(&self, text: &str) -> Option<Self::Name>;

    /// Mints a fresh client id. The one stateful operation in the contract.
    fn create_client_id(&mut self) -> Self::ClientId;

    /// Renders a client id for log output.
    fn serialize_client_id(&self, client: &Self::ClientId) -> String;

    /// The periodic timers this node runs. Consulted once at startup.
    fn timeout_tasks(&self) -> Vec<TimeoutTask<Self>> {
        Vec::new()
    }

    /// Whether the debug observer hooks below should be invoked.
    fn debug(&self) -> bool {
        false
    }

    /// Observes a decoded client request. Pure observer.
    fn debug_input(&self, me: &Self::Name, input: &Self::Input) {
        let _ = (me, input);
    }

    /// Observes a received peer message. Pure observer.
    fn debug_recv(&self, me: &Self::Name, src: &Self::Name, msg: &Self::Msg) {
        let _ = (me, src, msg);
    }

    /// Observes a peer message about to be sent. Pure observer.
    fn debug_send(&self, me: &Self::Name, dst: &Self::Name, msg: &Self::Msg) {
        let _ = (me, dst, msg);
    }
}
