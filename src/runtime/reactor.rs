//! The event loop: poll for readiness, dispatch tasks, deliver handler
//! results, retire dead connections.
//!
//! One iteration drains the retire list, sleeps until a socket is ready or
//! the earliest timer is due (never longer than the polling cap), then
//! sweeps a snapshot of the task map taken in insertion order. Ready tasks
//! run their read path, expired tasks their wake path; each threads the
//! handler state through by value and reports whether it is finished.
//!
//! Fairness comes from the snapshot-and-sweep discipline: every task that
//! was ready when the sweep began gets exactly one dispatch this
//! iteration, so a continuously busy socket cannot starve the others.
//!
//! Readiness notifications are edge-style, so each dispatch drains its
//! source — accepts, datagrams, or framed chunks — until it would block.

use std::collections::{BTreeMap, HashSet};
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use minstant::Instant;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, trace, warn};

use crate::arrangement::{Arrangement, Step, TimeoutTask};
use crate::chunk::{self, ChunkError};
use crate::net::{Endpoint, Listener, UdpSocket};
use crate::runtime::env::Env;
use crate::runtime::task::{Flow, Task, TaskKind};
use crate::runtime::{NodeError, RuntimeConfig, MAX_DATAGRAM_SIZE};

const PEER_TOKEN: Token = Token(0);
const LISTENER_TOKEN: Token = Token(1);
const FIRST_DYNAMIC_TOKEN: usize = 2;

const EVENTS_CAPACITY: usize = 128;

/// The reactor hosting one arrangement.
///
/// Single-threaded: the runtime owns the environment and the handler
/// state, and every handler invocation happens on the loop's thread, one
/// after another.
pub struct Runtime<A: Arrangement> {
    arrangement: A,
    env: Env<A::Name, A::ClientId>,
    poll: Poll,
    events: Events,
    /// Task map keyed by token. Tokens are allocated monotonically, so
    /// ordered iteration is insertion order.
    tasks: BTreeMap<Token, Task>,
    timers: Vec<TimeoutTask<A>>,
    /// Tokens whose tasks are torn down at the top of the next iteration.
    retire: Vec<Token>,
    next_token: usize,
    poll_cap: Duration,
    shutdown: Arc<AtomicBool>,
    /// Present between construction and `run`.
    state: Option<A::State>,
}

impl<A: Arrangement> Runtime<A> {
    /// Binds the node's sockets, arms its timers, and prepares the loop.
    ///
    /// # Errors
    ///
    /// Fails if the local name is not in the cluster map, if either socket
    /// cannot be bound, or if readiness infrastructure cannot be set up.
    pub fn new(arrangement: A, config: RuntimeConfig<A::Name>) -> Result<Self, NodeError> {
        let RuntimeConfig {
            me,
            cluster,
            client_bind,
            poll_cap,
        } = config;

        let peer_addr = cluster
            .addr_of(&me)
            .ok_or_else(|| NodeError::NotInCluster(arrangement.serialize_name(&me)))?;
        let mut peer = UdpSocket::bind(peer_addr)
            .map_err(|source| NodeError::BindPeer {
                addr: peer_addr,
                source,
            })?;
        if let Err(e) = peer.set_recv_buffer_size(4 * MAX_DATAGRAM_SIZE) {
            warn!(error = %e, "could not size peer receive buffer");
        }
        let mut listener = Listener::bind(client_bind).map_err(|source| NodeError::BindListener {
            addr: client_bind,
            source,
        })?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut peer, PEER_TOKEN, Interest::READABLE)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let mut tasks = BTreeMap::new();
        tasks.insert(PEER_TOKEN, Task::peer_recv(PEER_TOKEN));
        tasks.insert(LISTENER_TOKEN, Task::listener(LISTENER_TOKEN));

        let state = arrangement.init(&me);
        let timers = arrangement.timeout_tasks();
        let mut next_token = FIRST_DYNAMIC_TOKEN;
        let now = Instant::now();
        for (index, timer) in timers.iter().enumerate() {
            let token = Token(next_token);
            next_token += 1;
            let due = now + (timer.interval)(&arrangement, &me, &state);
            trace!(timer = timer.label, "timer armed");
            tasks.insert(token, Task::timer(token, index, due));
        }

        let client_addr = listener.local_addr()?;
        info!(
            node = %arrangement.serialize_name(&me),
            peer = %peer_addr,
            clients = %client_addr,
            timers = timers.len(),
            "node up"
        );

        Ok(Self {
            arrangement,
            env: Env::new(me, cluster, peer, listener),
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            tasks,
            timers,
            retire: Vec::new(),
            next_token,
            poll_cap,
            shutdown: Arc::new(AtomicBool::new(false)),
            state: Some(state),
        })
    }

    /// The flag that stops [`Runtime::run`]; checked once per iteration.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// The address clients should connect to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn client_addr(&self) -> io::Result<Endpoint> {
        self.env.listener.local_addr()
    }

    /// The address peer datagrams arrive on.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn peer_addr(&self) -> io::Result<Endpoint> {
        self.env.peer.local_addr()
    }

    /// Runs the loop until the shutdown flag is raised, then finalizes
    /// every remaining task and returns the final handler state.
    pub fn run(mut self) -> A::State {
        let mut state = self.state.take().expect("state armed at construction");
        info!("event loop running");
        while !self.shutdown.load(Ordering::Relaxed) {
            state = self.tick(state);
        }
        self.teardown();
        info!("event loop stopped");
        state
    }

    /// One loop iteration.
    fn tick(&mut self, mut state: A::State) -> A::State {
        self.drain_retired();

        let timeout = self.poll_timeout();
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() != ErrorKind::Interrupted {
                warn!(error = %e, "readiness poll failed");
            }
            return state;
        }

        let ready: HashSet<Token> = self.events.iter().map(|event| event.token()).collect();
        let now = Instant::now();
        let snapshot: Vec<Token> = self.tasks.keys().copied().collect();

        for token in snapshot {
            // Absent means finalized earlier in this sweep.
            let Some(mut task) = self.tasks.remove(&token) else {
                continue;
            };

            let flow = if task.select_on && ready.contains(&token) {
                let (flow, next) = self.process_read(&task, state);
                state = next;
                Some(flow)
            } else if task.due(now) {
                let (flow, next) = self.process_wake(&mut task, state);
                state = next;
                Some(flow)
            } else {
                None
            };

            match flow {
                Some(flow) => {
                    for spawned in flow.spawned {
                        self.tasks.insert(spawned.token, spawned);
                    }
                    if flow.finished {
                        self.finalize(&task);
                    } else {
                        self.tasks.insert(token, task);
                    }
                }
                None => {
                    self.tasks.insert(token, task);
                }
            }
        }

        state
    }

    /// Sleep until the earliest timer deadline, capped by the polling cap.
    fn poll_timeout(&self) -> Duration {
        let now = Instant::now();
        let mut timeout = self.poll_cap;
        for task in self.tasks.values() {
            if let Some(due) = task.wake_at {
                let wait = if due <= now {
                    Duration::ZERO
                } else {
                    due - now
                };
                timeout = timeout.min(wait);
            }
        }
        timeout
    }

    fn process_read(&mut self, task: &Task, state: A::State) -> (Flow, A::State) {
        match task.kind {
            TaskKind::Listener => self.accept_clients(state),
            TaskKind::PeerRecv => self.read_peer(state),
            TaskKind::ClientRead => self.read_client(task.token, state),
            // Timers own no socket and are never selected on.
            TaskKind::Timer(_) => (Flow::keep(), state),
        }
    }

    fn process_wake(&mut self, task: &mut Task, state: A::State) -> (Flow, A::State) {
        match task.kind {
            TaskKind::Timer(index) => self.fire_timer(task, index, state),
            _ => {
                task.wake_at = None;
                (Flow::keep(), state)
            }
        }
    }

    /// Accepts connections until the listener runs dry. Each new client
    /// gets a fresh id from the arrangement and a read task of its own.
    fn accept_clients(&mut self, state: A::State) -> (Flow, A::State) {
        let mut flow = Flow::keep();
        loop {
            match self.env.listener.try_accept() {
                Ok(Some((mut stream, from))) => {
                    let id = self.arrangement.create_client_id();
                    let token = self.alloc_token();
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(%from, error = %e, "could not watch new client; dropping connection");
                        continue;
                    }
                    info!(
                        client = %self.arrangement.serialize_client_id(&id),
                        %from,
                        "client connected"
                    );
                    self.env.bind_client(token, stream, id);
                    flow.spawned.push(Task::client_read(token));
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
        (flow, state)
    }

    /// Receives datagrams until the socket runs dry, resolving each source
    /// address against the cluster map before handing the payload to the
    /// handler.
    fn read_peer(&mut self, mut state: A::State) -> (Flow, A::State) {
        loop {
            let received = self.env.peer.try_recv_from(&mut self.env.recv_buf);
            match received {
                Ok(Some((len, from))) => {
                    let Some(src) = self.env.cluster.name_of(from).cloned() else {
                        debug!(%from, "datagram from unknown sender; dropped");
                        continue;
                    };
                    let Some(msg) = self.arrangement.deserialize_msg(&self.env.recv_buf[..len])
                    else {
                        warn!(src = ?src, len, "undecodable datagram; dropped");
                        continue;
                    };
                    if self.arrangement.debug() {
                        self.arrangement.debug_recv(&self.env.me, &src, &msg);
                    }
                    trace!(src = ?src, len, "peer message");
                    let step = self.arrangement.on_peer(&self.env.me, &src, msg, state);
                    state = self.deliver(step);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "peer receive failed");
                    break;
                }
            }
        }
        (Flow::keep(), state)
    }

    /// Reads framed requests from one client until its stream runs dry.
    /// Any framing or decode failure finishes the task.
    fn read_client(&mut self, token: Token, mut state: A::State) -> (Flow, A::State) {
        loop {
            let (received, id) = match self.env.client(token) {
                Some(conn) => (chunk::recv_chunk(&mut conn.stream), conn.id.clone()),
                // Torn down mid-sweep by a failed send.
                None => return (Flow::done(), state),
            };
            match received {
                Ok(Some(bytes)) => {
                    let Some(input) = self.arrangement.deserialize_input(&bytes, &id) else {
                        warn!(
                            client = %self.arrangement.serialize_client_id(&id),
                            "could not deserialize input; closing connection"
                        );
                        return (Flow::done(), state);
                    };
                    if self.arrangement.debug() {
                        self.arrangement.debug_input(&self.env.me, &input);
                    }
                    let step = self.arrangement.on_input(&self.env.me, input, state);
                    state = self.deliver(step);
                }
                Ok(None) => return (Flow::keep(), state),
                Err(ChunkError::Closed) => {
                    info!(
                        client = %self.arrangement.serialize_client_id(&id),
                        "client closed connection"
                    );
                    return (Flow::done(), state);
                }
                Err(e) => {
                    warn!(
                        client = %self.arrangement.serialize_client_id(&id),
                        error = %e,
                        "client read failed; closing connection"
                    );
                    return (Flow::done(), state);
                }
            }
        }
    }

    /// Fires one timer and re-arms it with a freshly computed interval, so
    /// adaptive or randomized schedules take the post-dispatch state into
    /// account.
    fn fire_timer(&mut self, task: &mut Task, index: usize, state: A::State) -> (Flow, A::State) {
        let TimeoutTask {
            label,
            handler,
            interval,
        } = self.timers[index];
        trace!(timer = label, "timer fired");
        let step = handler(&self.arrangement, &self.env.me, state);
        let state = self.deliver(step);
        task.wake_at = Some(Instant::now() + interval(&self.arrangement, &self.env.me, &state));
        (Flow::keep(), state)
    }

    /// Sends a step's outputs to their clients and its messages to their
    /// peers, returning the successor state.
    ///
    /// Output delivery is best-effort: a missing route drops the output, a
    /// failed send additionally schedules the owning client for teardown.
    /// Peer sends are fire-and-forget; the handler is built against a
    /// lossy link.
    fn deliver(&mut self, step: Step<A>) -> A::State {
        let Step {
            outputs,
            state,
            sends,
        } = step;

        for output in outputs {
            let (client, bytes) = self.arrangement.serialize_output(&output);
            let Some(token) = self.env.route(&client) else {
                warn!(
                    client = %self.arrangement.serialize_client_id(&client),
                    "no connection for output; dropped"
                );
                continue;
            };
            let sent = match self.env.client(token) {
                Some(conn) => chunk::send_chunk(&mut conn.stream, &bytes),
                None => continue,
            };
            if let Err(e) = sent {
                warn!(
                    client = %self.arrangement.serialize_client_id(&client),
                    error = %e,
                    "output send failed; scheduling disconnect"
                );
                self.retire.push(token);
            }
        }

        for (dest, msg) in sends {
            if self.arrangement.debug() {
                self.arrangement.debug_send(&self.env.me, &dest, &msg);
            }
            let bytes = self.arrangement.serialize_msg(&msg);
            let Some(addr) = self.env.cluster.addr_of(&dest) else {
                warn!(dest = ?dest, "destination missing from cluster map; message dropped");
                continue;
            };
            match self.env.peer.try_send_to(&bytes, addr) {
                Ok(Some(_)) => trace!(dest = ?dest, len = bytes.len(), "peer message sent"),
                Ok(None) => warn!(dest = ?dest, "peer socket busy; message dropped"),
                Err(e) => warn!(dest = ?dest, error = %e, "peer send failed; message dropped"),
            }
        }

        state
    }

    /// Finalizes every task still installed at shutdown: client
    /// connections, the listener, the peer socket, and the timers all go
    /// through the same once-only finalize as a task that finished on its
    /// own.
    fn teardown(&mut self) {
        let remaining: Vec<Token> = self.tasks.keys().copied().collect();
        self.retire.extend(remaining);
        self.drain_retired();
    }

    /// Tears down every task scheduled for deferred retirement. Runs
    /// before polling, so a task retired mid-sweep is never dispatched in
    /// a later iteration.
    fn drain_retired(&mut self) {
        while let Some(token) = self.retire.pop() {
            if let Some(task) = self.tasks.remove(&token) {
                self.finalize(&task);
            }
        }
    }

    /// Releases whatever the task owned. Runs exactly once per task, right
    /// as it leaves the task map.
    fn finalize(&mut self, task: &Task) {
        match task.kind {
            TaskKind::ClientRead => {
                if let Some(mut conn) = self.env.drop_client(task.token) {
                    if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
                        debug!(error = %e, "client stream deregistration failed");
                    }
                    info!(
                        client = %self.arrangement.serialize_client_id(&conn.id),
                        "client disconnected"
                    );
                }
            }
            TaskKind::Listener => {
                let _ = self.poll.registry().deregister(&mut self.env.listener);
                info!("client listener retired");
            }
            TaskKind::PeerRecv => {
                let _ = self.poll.registry().deregister(&mut self.env.peer);
                info!("peer socket retired");
            }
            TaskKind::Timer(index) => {
                trace!(timer = self.timers[index].label, "timer retired");
            }
        }
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }
}
