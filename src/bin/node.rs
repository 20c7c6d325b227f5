//! Plinth node daemon.
//!
//! Hosts a small max-merge counter arrangement: clients increment or read
//! a `u64`, and a gossip timer floods the current value to every peer so
//! the cluster converges on the maximum. Useful as a smoke test for a
//! cluster and as the reference for wiring a real arrangement to the
//! runtime.
//!
//! # Usage
//!
//! ```sh
//! plinth-node --me alpha \
//!     --node alpha=127.0.0.1:9001 --node beta=127.0.0.1:9002 \
//!     --client-port 7000
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: graceful shutdown

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use plinth::{
    init_tracing, parse_cluster, Arrangement, Cluster, Endpoint, Runtime, RuntimeConfig, Step,
    TimeoutTask,
};

const DEFAULT_CLIENT_PORT: u16 = 7000;
const DEFAULT_POLL_CAP_MS: u64 = 1000;

/// Gossip period base and jitter, in milliseconds. Jitter keeps a cluster
/// started in lockstep from flooding in lockstep forever.
const GOSSIP_BASE_MS: u64 = 800;
const GOSSIP_JITTER_MS: u64 = 400;

/// A client request against the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum CounterRequest {
    /// Add one and report the new value.
    Incr,
    /// Report the current value.
    Read,
}

/// A decoded request together with the connection it came from.
#[derive(Debug, Clone, Copy)]
struct CounterInput {
    client: ClientHandle,
    request: CounterRequest,
}

/// A reply addressed back to its connection.
#[derive(Debug, Clone, Copy)]
struct CounterReply {
    client: ClientHandle,
    value: u64,
}

/// Peer gossip: the sender's current counter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Gossip {
    Counter(u64),
}

/// Per-connection identifier: a process-local sequence number plus a
/// random nonce so ids stay distinguishable across restarts in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ClientHandle {
    seq: u32,
    nonce: u32,
}

/// The max-merge counter arrangement.
struct MaxCounter {
    /// Every peer name in the cluster, this node included.
    peers: Vec<String>,
    debug: bool,
    next_client: u32,
}

impl MaxCounter {
    fn new(peers: Vec<String>, debug: bool) -> Self {
        Self {
            peers,
            debug,
            next_client: 0,
        }
    }

    /// Gossip timer body: flood the current value to every other peer.
    fn gossip(&self, me: &String, state: u64) -> Step<Self> {
        let mut step = Step::new(state);
        for peer in &self.peers {
            if peer != me {
                step = step.send(peer.clone(), Gossip::Counter(state));
            }
        }
        step
    }

    fn gossip_interval(&self, _me: &String, _state: &u64) -> Duration {
        Duration::from_millis(GOSSIP_BASE_MS + rand::random::<u64>() % GOSSIP_JITTER_MS)
    }
}

impl Arrangement for MaxCounter {
    type Name = String;
    type State = u64;
    type Input = CounterInput;
    type Output = CounterReply;
    type Msg = Gossip;
    type ClientId = ClientHandle;

    fn init(&self, _me: &String) -> u64 {
        0
    }

    fn on_input(&self, _me: &String, input: CounterInput, state: u64) -> Step<Self> {
        let value = match input.request {
            CounterRequest::Incr => state + 1,
            CounterRequest::Read => state,
        };
        Step::new(value).output(CounterReply {
            client: input.client,
            value,
        })
    }

    fn on_peer(&self, _me: &String, _src: &String, msg: Gossip, state: u64) -> Step<Self> {
        let Gossip::Counter(seen) = msg;
        Step::new(state.max(seen))
    }

    fn serialize_msg(&self, msg: &Gossip) -> Vec<u8> {
        postcard::to_allocvec(msg).expect("gossip always serializes")
    }

    fn deserialize_msg(&self, bytes: &[u8]) -> Option<Gossip> {
        postcard::from_bytes(bytes).ok()
    }

    fn deserialize_input(&self, bytes: &[u8], client: &ClientHandle) -> Option<CounterInput> {
        let request = postcard::from_bytes::<CounterRequest>(bytes).ok()?;
        Some(CounterInput {
            client: *client,
            request,
        })
    }

    fn serialize_output(&self, output: &CounterReply) -> (ClientHandle, Vec<u8>) {
        let bytes = postcard::to_allocvec(&output.value).expect("reply always serializes");
        (output.client, bytes)
    }

    fn serialize_name(&self, name: &String) -> String {
        name.clone()
    }

    fn deserialize_name(&self, text: &str) -> Option<String> {
        (!text.is_empty()).then(|| text.to_owned())
    }

    fn create_client_id(&mut self) -> ClientHandle {
        let seq = self.next_client;
        self.next_client += 1;
        ClientHandle {
            seq,
            nonce: rand::random(),
        }
    }

    fn serialize_client_id(&self, client: &ClientHandle) -> String {
        format!("{}-{:08x}", client.seq, client.nonce)
    }

    fn timeout_tasks(&self) -> Vec<TimeoutTask<Self>> {
        vec![TimeoutTask {
            label: "gossip",
            handler: MaxCounter::gossip,
            interval: MaxCounter::gossip_interval,
        }]
    }

    fn debug(&self) -> bool {
        self.debug
    }

    fn debug_input(&self, me: &String, input: &CounterInput) {
        eprintln!("[{me}] input {:?} from {:?}", input.request, input.client);
    }

    fn debug_recv(&self, me: &String, src: &String, msg: &Gossip) {
        eprintln!("[{me}] recv {msg:?} from {src}");
    }

    fn debug_send(&self, me: &String, dst: &String, msg: &Gossip) {
        eprintln!("[{me}] send {msg:?} to {dst}");
    }
}

struct Options {
    me: String,
    cluster: Cluster<String>,
    client_port: u16,
    poll_cap: Duration,
    debug: bool,
}

fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("plinth-node: {message}");
            eprintln!("run with --help for usage");
            std::process::exit(2);
        }
    };

    let peers: Vec<String> = options.cluster.names().cloned().collect();
    let arrangement = MaxCounter::new(peers, options.debug);

    let mut config = RuntimeConfig::new(options.me, options.cluster, options.client_port);
    config.poll_cap = options.poll_cap;

    let runtime = match Runtime::new(arrangement, config) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("plinth-node: {e}");
            std::process::exit(1);
        }
    };

    setup_signal_handlers(runtime.shutdown_flag());

    // Runs until a shutdown signal raises the flag.
    let _state = runtime.run();
    eprintln!("plinth-node: stopped");
}

/// Raises the runtime's shutdown flag on SIGTERM or SIGINT.
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) {
    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(e) => {
            eprintln!("plinth-node: cannot install signal handlers: {e}");
            std::process::exit(1);
        }
    };
    std::thread::Builder::new()
        .name("signal-handler".into())
        .spawn(move || {
            if signals.forever().next().is_some() {
                eprintln!("\nplinth-node: received shutdown signal");
                shutdown.store(true, Ordering::Relaxed);
            }
        })
        .expect("failed to spawn signal handler thread");
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut me: Option<String> = None;
    let mut entries: Vec<(String, String)> = Vec::new();
    let mut cluster_file: Option<String> = None;
    let mut client_port = DEFAULT_CLIENT_PORT;
    let mut poll_cap_ms = DEFAULT_POLL_CAP_MS;
    let mut debug = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--me" | "-m" => {
                i += 1;
                let value = args.get(i).ok_or("missing value for --me")?;
                me = Some(value.clone());
            }
            "--node" | "-n" => {
                i += 1;
                let value = args.get(i).ok_or("missing value for --node")?;
                let (name, addr) = value
                    .split_once('=')
                    .ok_or_else(|| format!("--node expects name=host:port, got {value}"))?;
                entries.push((name.to_owned(), addr.to_owned()));
            }
            "--cluster" | "-c" => {
                i += 1;
                let value = args.get(i).ok_or("missing value for --cluster")?;
                cluster_file = Some(value.clone());
            }
            "--client-port" | "-p" => {
                i += 1;
                let value = args.get(i).ok_or("missing value for --client-port")?;
                client_port = value
                    .parse()
                    .map_err(|e| format!("bad --client-port {value}: {e}"))?;
            }
            "--poll-cap-ms" => {
                i += 1;
                let value = args.get(i).ok_or("missing value for --poll-cap-ms")?;
                poll_cap_ms = value
                    .parse()
                    .map_err(|e| format!("bad --poll-cap-ms {value}: {e}"))?;
            }
            "--debug" | "-d" => debug = true,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(format!("unknown argument: {arg}")),
        }
        i += 1;
    }

    let me = me.ok_or("--me is required")?;

    let mut cluster = match cluster_file {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| format!("cannot read cluster file {path}: {e}"))?;
            parse_cluster(|name| (!name.is_empty()).then(|| name.to_owned()), &text)
                .map_err(|e| e.to_string())?
        }
        None => Cluster::new(),
    };
    for (name, addr) in entries {
        let endpoint =
            Endpoint::resolve(&addr).map_err(|e| format!("cannot resolve {addr}: {e}"))?;
        cluster
            .insert(name, endpoint)
            .map_err(|e| e.to_string())?;
    }
    if cluster.is_empty() {
        return Err("no peers given; use --node or --cluster".to_owned());
    }

    Ok(Options {
        me,
        cluster,
        client_port,
        poll_cap: Duration::from_millis(poll_cap_ms),
        debug,
    })
}

fn print_usage() {
    eprintln!(
        r#"plinth-node - hosts the max-merge counter on a cluster node

USAGE:
    plinth-node --me <NAME> [OPTIONS]

OPTIONS:
    -m, --me <NAME>             This node's name (required, must be in the cluster)
    -n, --node <NAME=ADDR>      Add a peer entry (can be repeated)
    -c, --cluster <FILE>        Load peers from a file of `name host:port` lines
    -p, --client-port <PORT>    Client listener port (default: 7000)
        --poll-cap-ms <MS>      Longest sleep per loop iteration (default: 1000)
    -d, --debug                 Print every input and peer message to stderr
    -h, --help                  Print this help message

SIGNALS:
    SIGTERM, SIGINT             Graceful shutdown

EXAMPLE:
    plinth-node --me alpha --node alpha=127.0.0.1:9001 --node beta=127.0.0.1:9002
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(peers: &[&str]) -> MaxCounter {
        MaxCounter::new(peers.iter().map(|p| (*p).to_owned()).collect(), false)
    }

    #[test]
    fn request_codec_roundtrip() {
        let node = counter(&["alpha"]);
        let id = ClientHandle { seq: 0, nonce: 1 };
        for request in [CounterRequest::Incr, CounterRequest::Read] {
            let bytes = postcard::to_allocvec(&request).unwrap();
            let input = node.deserialize_input(&bytes, &id).unwrap();
            assert_eq!(input.request, request);
            assert_eq!(input.client, id);
        }
    }

    #[test]
    fn gossip_codec_roundtrip() {
        let node = counter(&["alpha"]);
        let msg = Gossip::Counter(42);
        let bytes = node.serialize_msg(&msg);
        assert_eq!(node.deserialize_msg(&bytes), Some(msg));
    }

    #[test]
    fn garbage_input_is_rejected() {
        let node = counter(&["alpha"]);
        let id = ClientHandle { seq: 0, nonce: 1 };
        assert!(node.deserialize_input(&[0xff, 0xff, 0xff], &id).is_none());
    }

    #[test]
    fn incr_bumps_and_replies() {
        let node = counter(&["alpha"]);
        let id = ClientHandle { seq: 3, nonce: 9 };
        let input = CounterInput {
            client: id,
            request: CounterRequest::Incr,
        };

        let step = node.on_input(&"alpha".to_owned(), input, 6);
        assert_eq!(step.state, 7);
        assert_eq!(step.outputs.len(), 1);
        assert_eq!(step.outputs[0].client, id);
        assert_eq!(step.outputs[0].value, 7);
        assert!(step.sends.is_empty());
    }

    #[test]
    fn peer_gossip_merges_by_max() {
        let node = counter(&["alpha", "beta"]);
        let me = "alpha".to_owned();
        let src = "beta".to_owned();

        let step = node.on_peer(&me, &src, Gossip::Counter(10), 4);
        assert_eq!(step.state, 10);

        let step = node.on_peer(&me, &src, Gossip::Counter(2), 4);
        assert_eq!(step.state, 4);
    }

    #[test]
    fn gossip_skips_self() {
        let node = counter(&["alpha", "beta", "gamma"]);
        let step = node.gossip(&"beta".to_owned(), 5);

        assert_eq!(step.state, 5);
        assert_eq!(step.sends.len(), 2);
        assert!(step.sends.iter().all(|(name, _)| name != "beta"));
        assert!(step
            .sends
            .iter()
            .all(|(_, msg)| *msg == Gossip::Counter(5)));
    }

    #[test]
    fn client_ids_are_fresh() {
        let mut node = counter(&["alpha"]);
        let a = node.create_client_id();
        let b = node.create_client_id();
        assert_ne!(a.seq, b.seq);
    }

    #[test]
    fn parse_args_builds_cluster_from_flags() {
        let args: Vec<String> = [
            "plinth-node",
            "--me",
            "alpha",
            "--node",
            "alpha=127.0.0.1:9001",
            "--node",
            "beta=127.0.0.1:9002",
            "--client-port",
            "7100",
        ]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();

        let options = parse_args(&args).unwrap();
        assert_eq!(options.me, "alpha");
        assert_eq!(options.client_port, 7100);
        assert_eq!(options.cluster.len(), 2);
        assert_eq!(
            options.cluster.addr_of(&"beta".to_owned()),
            Some(Endpoint::localhost(9002))
        );
    }

    #[test]
    fn parse_args_requires_me_and_peers() {
        let args = vec!["plinth-node".to_owned()];
        assert!(parse_args(&args).is_err());

        let args: Vec<String> = ["plinth-node", "--me", "alpha"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        assert!(parse_args(&args).is_err());
    }
}
