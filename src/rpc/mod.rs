//! K-RPC style protocol: lookups, storage and routing table upkeep driven by [Rpc::tick].

mod bootstrap;
mod closest_nodes;
pub(crate) mod config;
mod handle_request;
mod handle_response;
mod info;
mod iterative_query;
mod maintenance;
pub(crate) mod socket;
mod store_query;

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::num::NonZeroUsize;
use std::time::Instant;

use bytes::Bytes;
use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, error, warn};

use crate::common::{
    get_dht_time, DhtTime, Id, LocalStorage, MessageType, Node, RequestSpecific,
    RequestTypeSpecific, RoutingTable, StoreRequestArguments, StoredValue,
};
use crate::{Error, Result};

use bootstrap::Bootstrap;
use iterative_query::{IterativeQuery, QuerySettings};
use maintenance::Maintenance;
use socket::{KrpcSocket, Transport};
use store_query::StoreQuery;

pub use closest_nodes::ClosestNodes;
pub use config::{Config, DEFAULT_ALPHA, DEFAULT_WAIT_TIMEOUT};
pub use info::Info;
pub use socket::MAX_THREAD_BLOCK_DURATION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Handle to an operation started on [Rpc], its outcome is reported by [Rpc::tick].
pub struct QueryId(u64);

#[derive(Debug, Clone, PartialEq)]
/// Outcome of an operation started on [Rpc].
pub enum QueryOutcome {
    /// Closest nodes found by [Rpc::find_nearest_nodes].
    Nodes(Vec<Node>),
    /// Best value found by [Rpc::get].
    Value(Option<StoredValue>),
    /// Whether any node, including this one, accepted a [Rpc::set].
    Stored(bool),
    /// Id reported by a node answering [Rpc::ping], `None` if it timed out.
    Pong(Option<Id>),
}

/// Results from a single [Rpc::tick] call.
#[derive(Debug, Clone, Default)]
pub struct RpcTickReport {
    /// Operations that finished during this tick.
    pub done: Vec<(QueryId, QueryOutcome)>,
}

#[derive(Debug)]
/// What to do with the results of a lookup once it is done.
enum Lookup {
    FindNode,
    Get {
        local: Option<StoredValue>,
    },
    Set {
        request: StoreRequestArguments,
        local_accepted: bool,
    },
    Refresh,
    Bootstrap,
}

#[derive(Debug)]
enum Store {
    Set { local_accepted: bool },
    /// Fire and forget, nobody waits for the outcome.
    Cache,
}

#[derive(Debug)]
enum BootstrapState {
    NotStarted,
    Pinging(Bootstrap),
    Lookup { responded: bool },
    Done(bool),
}

#[derive(Debug)]
/// A node's protocol state: its routing table, local store, and every
/// operation in flight, advanced without blocking by [Rpc::tick].
pub struct Rpc {
    socket: KrpcSocket,

    // Routing
    routing_table: RoutingTable,
    maintenance: Maintenance,

    storage: LocalStorage,

    // Options
    settings: QuerySettings,
    num_replicas: usize,
    initial_peers: Vec<SocketAddrV4>,
    bootstrap_timeout: std::time::Duration,

    rng: StdRng,
    next_query_id: u64,

    bootstrap: BootstrapState,

    iterative_queries: HashMap<QueryId, (IterativeQuery, Lookup)>,
    store_queries: HashMap<QueryId, (StoreQuery, Store)>,
    /// Explicit pings by transaction_id.
    pings: HashMap<u32, QueryId>,
    /// Transaction_id of the pending liveness ping to a least recently seen node.
    liveness_pings: HashMap<Id, u32>,

    /// Outcomes reported on the next tick.
    done: Vec<(QueryId, QueryOutcome)>,
}

impl Rpc {
    /// Creates a new Rpc, binding its UDP socket.
    ///
    /// Does not send anything, bootstrapping starts on the first [Rpc::tick].
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let id = config
            .node_id
            .unwrap_or_else(|| Id::random_from(&mut rng));

        let socket = KrpcSocket::new(&config)?;

        let capacity = NonZeroUsize::new(config.max_stored_values)
            .ok_or(Error::InvalidConfig("max_stored_values must be at least 1"))?;

        Ok(Rpc {
            socket,

            routing_table: RoutingTable::new(id)
                .with_bucket_size(config.bucket_size)
                .with_depth_modulo(config.depth_modulo)
                .with_staleness_timeout(config.staleness_timeout),
            maintenance: Maintenance::new(config.staleness_timeout),

            storage: LocalStorage::new(capacity),

            settings: QuerySettings {
                k: config.bucket_size,
                alpha: config.alpha,
                max_rounds: config.max_rounds,
                round_timeout: config.wait_timeout,
            },
            num_replicas: config.num_replicas(),
            bootstrap_timeout: config.bootstrap_timeout(),
            initial_peers: config.initial_peers,

            rng,
            next_query_id: 0,

            bootstrap: BootstrapState::NotStarted,

            iterative_queries: HashMap::new(),
            store_queries: HashMap::new(),
            pings: HashMap::new(),
            liveness_pings: HashMap::new(),

            done: Vec::new(),
        })
    }

    // === Getters ===

    /// Returns the node's Id
    pub fn id(&self) -> &Id {
        self.routing_table.id()
    }

    /// Returns the address the server is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.socket.local_addr()
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn storage(&self) -> &LocalStorage {
        &self.storage
    }

    /// `None` while bootstrapping, then whether any initial peer responded.
    ///
    /// A node without initial peers is the first of its network and counts as bootstrapped.
    pub fn bootstrapped(&self) -> Option<bool> {
        match self.bootstrap {
            BootstrapState::Done(bootstrapped) => Some(bootstrapped),
            _ => None,
        }
    }

    /// Returns a thread safe and lightweight summary of this node's
    /// information and statistics.
    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Public Methods ===

    /// Advances bootstrapping, maintenance and in-flight operations by one step,
    /// and handles at most one incoming message.
    ///
    /// Call in a loop; delays degrade query completion and routing table quality.
    pub fn tick(&mut self) -> RpcTickReport {
        let now = Instant::now();

        if let BootstrapState::NotStarted = self.bootstrap {
            self.start_bootstrap(now);
        }

        self.handle_timeouts();

        self.tick_bootstrap(now);

        self.tick_iterative_queries(now);
        self.tick_store_queries();

        self.periodic_maintenance();

        if let Some((message, from)) = self.socket.recv_from() {
            match message.message_type {
                MessageType::Request(request_specific) => {
                    self.handle_request(from, message.transaction_id, request_specific);
                }
                MessageType::Response(_) => self.handle_response(from, message),
            }
        }

        RpcTickReport {
            done: std::mem::take(&mut self.done),
        }
    }

    /// Lookup the `k` nodes closest to `target`.
    pub fn find_nearest_nodes(&mut self, target: Id, k: usize) -> QueryId {
        let settings = QuerySettings {
            k: k.max(1),
            ..self.settings
        };

        let query = IterativeQuery::find_node(*self.id(), target, settings);

        self.start_lookup(query, Lookup::FindNode)
    }

    /// Get the value stored under `key`.
    ///
    /// Answers from the local store if it holds a value expiring after
    /// `sufficient_time`, otherwise looks the value up on the network, finishing
    /// early as soon as a sufficient one is found, and returns the latest
    /// expiring of the local and remote values.
    pub fn get(&mut self, key: Id, sufficient_time: DhtTime) -> QueryId {
        let local = self.storage.get(&key, get_dht_time());

        if let Some(value) = &local {
            if value.expiration_time > sufficient_time {
                let query_id = self.next_query_id();
                self.done
                    .push((query_id, QueryOutcome::Value(Some(value.clone()))));

                return query_id;
            }
        }

        let query = IterativeQuery::find_value(*self.id(), key, sufficient_time, self.settings);

        self.start_lookup(query, Lookup::Get { local })
    }

    /// Store a value locally and at the `num_replicas` nodes closest to `key`.
    pub fn set(&mut self, key: Id, value: Bytes, expiration_time: DhtTime) -> QueryId {
        let local_accepted = self
            .storage
            .put(key, value.clone(), expiration_time, get_dht_time());

        // Converge on enough nodes to replicate to.
        let settings = QuerySettings {
            k: self.settings.k.max(self.num_replicas),
            ..self.settings
        };
        let query = IterativeQuery::find_node(*self.id(), key, settings);

        self.start_lookup(
            query,
            Lookup::Set {
                request: StoreRequestArguments {
                    key,
                    value,
                    expiration_time,
                },
                local_accepted,
            },
        )
    }

    /// Ping a node, its outcome is the Id it reports.
    pub fn ping(&mut self, address: SocketAddrV4) -> QueryId {
        let query_id = self.next_query_id();

        let tid = self.socket.request(
            address,
            RequestSpecific {
                requester_id: *self.id(),
                request_type: RequestTypeSpecific::Ping,
            },
        );

        self.pings.insert(tid, query_id);

        query_id
    }

    /// Lookup a random id within every stale bucket, returns the number of lookups started.
    pub fn refresh_stale_buckets(&mut self) -> usize {
        let targets = self.routing_table.refresh_targets(&mut self.rng);

        for target in &targets {
            let query = IterativeQuery::find_node(*self.id(), *target, self.settings);
            self.start_lookup(query, Lookup::Refresh);
        }

        if !targets.is_empty() {
            debug!(buckets = targets.len(), "Refreshing stale buckets");
        }

        targets.len()
    }

    // === Private Methods ===

    fn next_query_id(&mut self) -> QueryId {
        let query_id = QueryId(self.next_query_id);
        self.next_query_id = self.next_query_id.wrapping_add(1);
        query_id
    }

    /// Seed a lookup with the closest nodes from the routing table, and send its first round.
    fn start_lookup(&mut self, mut query: IterativeQuery, lookup: Lookup) -> QueryId {
        let query_id = self.next_query_id();
        let target = query.target();
        let k = query.settings().k;

        for node in self.routing_table.nearest_neighbors(&target, k, None) {
            query.add_candidate(node);
        }

        query.tick(&mut self.socket, Instant::now());

        self.iterative_queries.insert(query_id, (query, lookup));

        query_id
    }

    fn start_bootstrap(&mut self, now: Instant) {
        let requester_id = *self.id();

        let bootstrap = Bootstrap::start(
            &mut self.socket,
            requester_id,
            &self.initial_peers,
            self.settings.round_timeout,
            self.bootstrap_timeout,
            now,
        );

        self.bootstrap = BootstrapState::Pinging(bootstrap);
    }

    fn tick_bootstrap(&mut self, now: Instant) {
        let BootstrapState::Pinging(bootstrap) = &mut self.bootstrap else {
            return;
        };

        if !bootstrap.tick(&mut self.socket, now) {
            return;
        }

        let responded = bootstrap.responded() > 0;

        if !responded && bootstrap.peers() > 0 {
            warn!(
                peers = bootstrap.peers(),
                "No initial peer responded, running as an isolated node"
            );
        }

        self.bootstrap = BootstrapState::Lookup {
            responded: responded || self.initial_peers.is_empty(),
        };

        debug!(node_id = ?self.id(), "Bootstrapping the routing table");

        let query = IterativeQuery::find_node(*self.id(), *self.id(), self.settings);
        self.start_lookup(query, Lookup::Bootstrap);
    }

    /// Requests that timed out in the socket count as failures of the peers they were sent to.
    fn handle_timeouts(&mut self) {
        for (tid, address) in self.socket.cleanup() {
            self.routing_table.register_request_to(address, None, false);

            if let Some(query_id) = self.pings.remove(&tid) {
                self.done.push((query_id, QueryOutcome::Pong(None)));
            }
        }
    }

    /// Advance all lookups, and finish the done ones.
    fn tick_iterative_queries(&mut self, now: Instant) {
        let mut done = Vec::new();

        for (query_id, (query, _)) in self.iterative_queries.iter_mut() {
            let finished = query.tick(&mut self.socket, now);

            for node in query.take_stragglers() {
                self.routing_table
                    .register_request_to(node.address, Some(node.id), false);
            }

            if finished {
                done.push(*query_id);
            }
        }

        for query_id in done {
            if let Some((query, lookup)) = self.iterative_queries.remove(&query_id) {
                self.finish_lookup(query_id, query, lookup);
            }
        }
    }

    fn finish_lookup(&mut self, query_id: QueryId, query: IterativeQuery, lookup: Lookup) {
        match lookup {
            Lookup::FindNode => {
                self.done
                    .push((query_id, QueryOutcome::Nodes(query.results())));
            }
            Lookup::Get { local } => {
                let remote = query.value().cloned();

                if let Some(value) = &remote {
                    self.cache(query.target(), value, &query.outdated_responders());
                }

                let best = match (local, remote) {
                    (Some(local), Some(remote)) => {
                        if remote.expiration_time > local.expiration_time {
                            Some(remote)
                        } else {
                            Some(local)
                        }
                    }
                    (local, remote) => local.or(remote),
                };

                self.done.push((query_id, QueryOutcome::Value(best)));
            }
            Lookup::Set {
                request,
                local_accepted,
            } => {
                let nodes = query
                    .results()
                    .into_iter()
                    .take(self.num_replicas)
                    .collect::<Vec<_>>();

                if nodes.is_empty() {
                    self.done
                        .push((query_id, QueryOutcome::Stored(local_accepted)));
                    return;
                }

                let mut store_query = StoreQuery::new(*self.id(), request);
                store_query.start(&mut self.socket, &nodes);

                self.store_queries
                    .insert(query_id, (store_query, Store::Set { local_accepted }));
            }
            Lookup::Refresh => {}
            Lookup::Bootstrap => {
                let responded = matches!(
                    self.bootstrap,
                    BootstrapState::Lookup { responded: true }
                );

                self.bootstrap = BootstrapState::Done(responded);
                self.log_bootstrap(self.id());
            }
        }
    }

    /// Store the best value found by a lookup at the responders that had none or an older one.
    fn cache(&mut self, key: Id, value: &StoredValue, nodes: &[Node]) {
        if nodes.is_empty() {
            return;
        }

        debug!(?key, nodes = nodes.len(), "Caching value at outdated responders");

        let mut store_query = StoreQuery::new(
            *self.id(),
            StoreRequestArguments {
                key,
                value: value.value.clone(),
                expiration_time: value.expiration_time,
            },
        );
        store_query.start(&mut self.socket, nodes);

        let query_id = self.next_query_id();
        self.store_queries
            .insert(query_id, (store_query, Store::Cache));
    }

    /// Advance all store queries, and report the done ones.
    fn tick_store_queries(&mut self) {
        let mut done = Vec::new();

        for (query_id, (query, _)) in self.store_queries.iter_mut() {
            if query.tick(&self.socket) {
                done.push(*query_id);
            }
        }

        for query_id in done {
            if let Some((query, Store::Set { local_accepted })) =
                self.store_queries.remove(&query_id)
            {
                let accepted = local_accepted || query.stored_at() > 0;
                self.done.push((query_id, QueryOutcome::Stored(accepted)));
            }
        }
    }

    /// Ping least recently seen nodes of full buckets, refresh stale buckets,
    /// and drop expired records.
    fn periodic_maintenance(&mut self) {
        let socket = &self.socket;
        self.liveness_pings.retain(|_, tid| socket.inflight(*tid));

        for node in self.routing_table.take_nodes_to_ping() {
            if self.liveness_pings.contains_key(&node.id) {
                continue;
            }

            let tid = self.socket.request(
                node.address,
                RequestSpecific {
                    requester_id: *self.id(),
                    request_type: RequestTypeSpecific::Ping,
                },
            );

            self.liveness_pings.insert(node.id, tid);
        }

        let decisions = self.maintenance.decisions();

        if decisions.should_refresh_stale_buckets {
            self.refresh_stale_buckets();
        }

        if decisions.should_cleanup_storage {
            let removed = self.storage.remove_expired(get_dht_time());

            if removed > 0 {
                debug!(removed, "Dropped expired records");
            }
        }
    }

    /// Check if routing table is empty and log an error if so.
    fn log_bootstrap(&self, self_id: &Id) {
        let table_size = self.routing_table.size();
        if table_size == 0 {
            if self.initial_peers.is_empty() {
                debug!(?self_id, "First node of the network, routing table is empty");
            } else {
                error!("Could not bootstrap the routing table");
            }
        } else {
            debug!(?self_id, table_size, "Populated the routing table");
        }
    }
}
