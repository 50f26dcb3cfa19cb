//! Dht node.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, Sender, TryRecvError};
use tracing::{debug, info};

use crate::common::{DhtTime, Id, Node, StoredValue};
use crate::rpc::{Config, Info, QueryId, QueryOutcome, Rpc};
use crate::{Error, Result};

#[derive(Debug, Clone)]
/// Ephemeral Dht node.
pub struct Dht(pub(crate) Sender<ActorMessage>);

#[derive(Debug, Default, Clone)]
/// A builder for [Dht]
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set this node's [Id], instead of a random one.
    pub fn node_id(&mut self, node_id: Id) -> &mut Self {
        self.0.node_id = Some(node_id);

        self
    }

    /// Set a specific port to listen on, instead of an OS assigned one.
    pub fn port(&mut self, port: u16) -> &mut Self {
        self.0.port = Some(port);

        self
    }

    /// Set the interface to bind to, defaults to `0.0.0.0`.
    pub fn interface(&mut self, interface: Ipv4Addr) -> &mut Self {
        self.0.interface = interface;

        self
    }

    /// Set the peers to bootstrap from.
    pub fn initial_peers(&mut self, initial_peers: &[SocketAddrV4]) -> &mut Self {
        self.0.initial_peers = initial_peers.to_vec();

        self
    }

    /// Set [Config::bucket_size]
    pub fn bucket_size(&mut self, bucket_size: usize) -> &mut Self {
        self.0.bucket_size = bucket_size;

        self
    }

    /// Set [Config::num_replicas]
    pub fn num_replicas(&mut self, num_replicas: usize) -> &mut Self {
        self.0.num_replicas = Some(num_replicas);

        self
    }

    /// Set [Config::depth_modulo]
    pub fn depth_modulo(&mut self, depth_modulo: usize) -> &mut Self {
        self.0.depth_modulo = depth_modulo;

        self
    }

    /// Set [Config::alpha]
    pub fn alpha(&mut self, alpha: usize) -> &mut Self {
        self.0.alpha = alpha;

        self
    }

    /// Set [Config::max_rounds]
    pub fn max_rounds(&mut self, max_rounds: usize) -> &mut Self {
        self.0.max_rounds = Some(max_rounds);

        self
    }

    /// Set [Config::wait_timeout]
    pub fn wait_timeout(&mut self, wait_timeout: Duration) -> &mut Self {
        self.0.wait_timeout = wait_timeout;

        self
    }

    /// Set [Config::staleness_timeout], `None` disables bucket refreshes.
    pub fn staleness_timeout(&mut self, staleness_timeout: Option<Duration>) -> &mut Self {
        self.0.staleness_timeout = staleness_timeout;

        self
    }

    /// Set [Config::bootstrap_timeout]
    pub fn bootstrap_timeout(&mut self, bootstrap_timeout: Duration) -> &mut Self {
        self.0.bootstrap_timeout = Some(bootstrap_timeout);

        self
    }

    /// Set [Config::max_stored_values]
    pub fn max_stored_values(&mut self, max_stored_values: usize) -> &mut Self {
        self.0.max_stored_values = max_stored_values;

        self
    }

    /// Seed the node's random source, for reproducible ids and refresh targets.
    pub fn seed(&mut self, seed: u64) -> &mut Self {
        self.0.seed = Some(seed);

        self
    }

    /// Create a Dht node.
    pub fn build(&self) -> Result<Dht> {
        Dht::new(self.0.clone())
    }
}

impl Dht {
    /// Create a new Dht node.
    ///
    /// Could return an error if it failed to bind to the specified
    /// port or other io errors while binding the udp socket,
    /// or if the config is invalid.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let (sender, receiver) = flume::unbounded();

        thread::Builder::new()
            .name("Ephemeral Dht actor thread".to_string())
            .spawn(move || run(config, receiver))?;

        let (tx, rx) = flume::bounded(1);

        sender
            .send(ActorMessage::Check(tx))
            .map_err(|_| Error::Static("actor thread unexpectedly shutdown"))?;

        rx.recv()
            .map_err(|_| Error::Static("actor thread unexpectedly shutdown"))??;

        Ok(Dht(sender))
    }

    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.send(ActorMessage::Info(sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Wait until bootstrapping is done.
    ///
    /// Returns true if any initial peer responded, or if there were none to contact.
    pub fn bootstrapped(&self) -> Result<bool, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<bool>(1);

        self.send(ActorMessage::Bootstrapped(sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Snapshot of the nodes in the routing table.
    pub fn routing_table(&self) -> Result<Vec<Node>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<Node>>(1);

        self.send(ActorMessage::RoutingTable(sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop.
    pub fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv();
    }

    /// Get the value stored under `key`, from this node or the network.
    ///
    /// Returns the value with the latest expiration found, `None` if there is none.
    pub fn get(&self, key: Id) -> Result<Option<StoredValue>, DhtWasShutdown> {
        self.get_sufficient(key, f64::NEG_INFINITY)
    }

    /// Same as [Dht::get] but only values expiring after `sufficient_time` end
    /// the lookup early.
    pub fn get_sufficient(
        &self,
        key: Id,
        sufficient_time: DhtTime,
    ) -> Result<Option<StoredValue>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Option<StoredValue>>(1);

        self.send(ActorMessage::Get(key, sufficient_time, sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Store `value` under `key` until `expiration_time`, locally and at the
    /// nodes closest to `key`.
    ///
    /// Returns true if any node, including this one, accepted the value.
    /// Nodes reject values expiring no later than the one they already hold.
    pub fn set(
        &self,
        key: Id,
        value: Bytes,
        expiration_time: DhtTime,
    ) -> Result<bool, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<bool>(1);

        self.send(ActorMessage::Set(key, value, expiration_time, sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Lookup the `k` nodes closest to `target`.
    pub fn find_nearest_nodes(&self, target: Id, k: usize) -> Result<Vec<Node>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<Node>>(1);

        self.send(ActorMessage::FindNearestNodes(target, k, sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Lookup a random id within every stale bucket.
    ///
    /// Returns the number of lookups started.
    pub fn refresh_stale_buckets(&self) -> Result<usize, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<usize>(1);

        self.send(ActorMessage::RefreshStaleBuckets(sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Ping a node, returns the [Id] it reports or `None` if it did not respond.
    pub fn ping(&self, address: SocketAddrV4) -> Result<Option<Id>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Option<Id>>(1);

        self.send(ActorMessage::Ping(address, sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Private Methods ===

    pub(crate) fn send(&self, message: ActorMessage) -> Result<(), DhtWasShutdown> {
        self.0.send(message).map_err(|_| DhtWasShutdown)
    }
}

fn run(config: Config, receiver: Receiver<ActorMessage>) {
    let mut rpc = match Rpc::new(config) {
        Ok(rpc) => rpc,
        Err(err) => {
            if let Ok(ActorMessage::Check(sender)) = receiver.recv() {
                let _ = sender.send(Err(err));
            }

            return;
        }
    };

    let address = rpc.local_addr();
    info!(?address, "Ephemeral DHT listening");

    let mut senders: HashMap<QueryId, ResponseSender> = HashMap::new();
    let mut bootstrap_waiters: Vec<Sender<bool>> = Vec::new();

    loop {
        match receiver.try_recv() {
            Ok(actor_message) => match actor_message {
                ActorMessage::Check(sender) => {
                    let _ = sender.send(Ok(()));
                }
                ActorMessage::Shutdown(sender) => {
                    drop(receiver);
                    let _ = sender.send(());
                    break;
                }
                ActorMessage::Info(sender) => {
                    let _ = sender.send(rpc.info());
                }
                ActorMessage::Bootstrapped(sender) => match rpc.bootstrapped() {
                    Some(bootstrapped) => {
                        let _ = sender.send(bootstrapped);
                    }
                    None => bootstrap_waiters.push(sender),
                },
                ActorMessage::RoutingTable(sender) => {
                    let _ = sender.send(rpc.routing_table().to_owned_nodes());
                }
                ActorMessage::RefreshStaleBuckets(sender) => {
                    let _ = sender.send(rpc.refresh_stale_buckets());
                }
                ActorMessage::Get(key, sufficient_time, sender) => {
                    let query_id = rpc.get(key, sufficient_time);
                    senders.insert(query_id, ResponseSender::Value(sender));
                }
                ActorMessage::Set(key, value, expiration_time, sender) => {
                    let query_id = rpc.set(key, value, expiration_time);
                    senders.insert(query_id, ResponseSender::Stored(sender));
                }
                ActorMessage::FindNearestNodes(target, k, sender) => {
                    let query_id = rpc.find_nearest_nodes(target, k);
                    senders.insert(query_id, ResponseSender::Nodes(sender));
                }
                ActorMessage::Ping(address, sender) => {
                    let query_id = rpc.ping(address);
                    senders.insert(query_id, ResponseSender::Pong(sender));
                }
            },
            Err(TryRecvError::Disconnected) => {
                // Node was dropped, kill this thread.
                debug!("ephemeral_dht::Dht's actor thread was shutdown after Drop.");
                break;
            }
            Err(TryRecvError::Empty) => {
                // No op
            }
        }

        let report = rpc.tick();

        for (query_id, outcome) in report.done {
            if let Some(sender) = senders.remove(&query_id) {
                send(sender, outcome);
            }
        }

        if let Some(bootstrapped) = rpc.bootstrapped() {
            for sender in bootstrap_waiters.drain(..) {
                let _ = sender.send(bootstrapped);
            }
        }
    }
}

fn send(sender: ResponseSender, outcome: QueryOutcome) {
    match (sender, outcome) {
        (ResponseSender::Value(s), QueryOutcome::Value(r)) => {
            let _ = s.send(r);
        }
        (ResponseSender::Stored(s), QueryOutcome::Stored(r)) => {
            let _ = s.send(r);
        }
        (ResponseSender::Nodes(s), QueryOutcome::Nodes(r)) => {
            let _ = s.send(r);
        }
        (ResponseSender::Pong(s), QueryOutcome::Pong(r)) => {
            let _ = s.send(r);
        }
        _ => {}
    }
}

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Check(Sender<Result<()>>),
    Shutdown(Sender<()>),
    Info(Sender<Info>),
    Bootstrapped(Sender<bool>),
    RoutingTable(Sender<Vec<Node>>),
    RefreshStaleBuckets(Sender<usize>),
    Get(Id, DhtTime, Sender<Option<StoredValue>>),
    Set(Id, Bytes, DhtTime, Sender<bool>),
    FindNearestNodes(Id, usize, Sender<Vec<Node>>),
    Ping(SocketAddrV4, Sender<Option<Id>>),
}

#[derive(Debug)]
enum ResponseSender {
    Value(Sender<Option<StoredValue>>),
    Stored(Sender<bool>),
    Nodes(Sender<Vec<Node>>),
    Pong(Sender<Option<Id>>),
}

/// Create a testnet of Dht nodes to run tests against instead of the real network.
#[derive(Debug)]
pub struct Testnet {
    pub bootstrap: Vec<SocketAddrV4>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    /// Start `count` nodes on localhost, each bootstrapping off the first one.
    ///
    /// Returns once every node finished bootstrapping.
    pub fn new(count: usize) -> Result<Testnet> {
        let mut nodes: Vec<Dht> = vec![];
        let mut bootstrap = vec![];

        for _ in 0..count {
            let node = Dht::builder()
                .interface(Ipv4Addr::LOCALHOST)
                .initial_peers(&bootstrap)
                .build()?;

            node.bootstrapped()
                .map_err(|_| Error::Static("testnet node was shutdown"))?;

            if bootstrap.is_empty() {
                let info = node
                    .info()
                    .map_err(|_| Error::Static("testnet node was shutdown"))?;

                bootstrap.push(info.local_addr());
            }

            nodes.push(node)
        }

        Ok(Self { bootstrap, nodes })
    }
}

#[derive(thiserror::Error, Debug)]
/// Indicates that the Dht's actor thread was shutdown, probably after calling [Dht::shutdown].
#[error("The Dht was shutdown")]
pub struct DhtWasShutdown;

#[cfg(test)]
mod test {
    use super::*;

    fn localhost() -> DhtBuilder {
        let mut builder = Dht::builder();
        builder.interface(Ipv4Addr::LOCALHOST);
        builder
    }

    #[test]
    fn shutdown() {
        let mut dht = Dht::builder().build().unwrap();

        dht.shutdown();

        assert!(matches!(dht.info(), Err(DhtWasShutdown)));
        assert!(matches!(dht.get(Id::random()), Err(DhtWasShutdown)));
    }

    #[test]
    fn invalid_config() {
        let result = Dht::builder().bucket_size(0).build();

        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn bind_twice() {
        let a = localhost().build().unwrap();
        let port = a.info().unwrap().local_addr().port();

        let result = localhost().port(port).build();

        assert!(matches!(result, Err(Error::IO(_))));
    }

    #[test]
    fn isolated_node() {
        let dht = localhost().build().unwrap();

        assert!(dht.bootstrapped().unwrap());
        assert_eq!(dht.get(Id::from_key("expert.3")).unwrap(), None);
        assert!(dht.find_nearest_nodes(Id::random(), 5).unwrap().is_empty());
        assert!(dht.routing_table().unwrap().is_empty());
    }

    #[test]
    fn set_get_locally() {
        let dht = localhost().build().unwrap();
        let key = Id::from_key("expert.3");

        assert!(dht.set(key, "v1".into(), 1e12).unwrap());
        assert!(!dht.set(key, "v2".into(), 1e11).unwrap());

        assert_eq!(
            dht.get(key).unwrap(),
            Some(StoredValue::new("v1".into(), 1e12))
        );
        assert_eq!(dht.info().unwrap().stored_values(), 1);
    }

    #[test]
    fn mutual_registration_after_bootstrap() {
        let a = localhost().build().unwrap();
        let a_info = a.info().unwrap();

        let b = localhost()
            .initial_peers(&[a_info.local_addr()])
            .build()
            .unwrap();

        assert!(b.bootstrapped().unwrap());

        let b_id = *b.info().unwrap().id();

        assert!(b.routing_table().unwrap().iter().any(|n| n.id == *a_info.id()));
        assert!(a.routing_table().unwrap().iter().any(|n| n.id == b_id));
    }

    #[test]
    fn ping() {
        let a = localhost().build().unwrap();
        let b = localhost().build().unwrap();
        let a_info = a.info().unwrap();

        assert_eq!(b.ping(a_info.local_addr()).unwrap(), Some(*a_info.id()));
    }

    #[test]
    fn unreachable_initial_peer() {
        let mut a = localhost().build().unwrap();
        let address = a.info().unwrap().local_addr();
        a.shutdown();

        let b = localhost()
            .initial_peers(&[address])
            .wait_timeout(Duration::from_millis(200))
            .build()
            .unwrap();

        assert!(!b.bootstrapped().unwrap());
        assert_eq!(b.ping(address).unwrap(), None);
    }

    #[test]
    fn explicit_node_id() {
        let id = Id::random();
        let dht = localhost().node_id(id).build().unwrap();

        assert_eq!(*dht.info().unwrap().id(), id);
    }
}
