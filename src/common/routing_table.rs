//! Kademlia routing table with bucket splitting and replacement caches.

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::common::{Id, Node, ID_BITS};

/// K = the default maximum size of a k-bucket.
pub const DEFAULT_BUCKET_SIZE: usize = 20;
/// Buckets whose depth is not a multiple of this are split even when they do
/// not cover the local id.
pub const DEFAULT_DEPTH_MODULO: usize = 5;
/// A bucket that saw no activity for this long is refreshed.
pub const DEFAULT_STALENESS_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
/// Kademlia routing table.
///
/// Buckets are kept sorted by their lower bound and together cover the
/// whole id space exactly once.
pub struct RoutingTable {
    id: Id,
    bucket_size: usize,
    depth_modulo: usize,
    staleness_timeout: Option<Duration>,
    buckets: Vec<KBucket>,
    nodes_to_ping: Vec<Node>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id and default parameters.
    pub fn new(id: Id) -> Self {
        RoutingTable {
            id,
            bucket_size: DEFAULT_BUCKET_SIZE,
            depth_modulo: DEFAULT_DEPTH_MODULO,
            staleness_timeout: Some(DEFAULT_STALENESS_TIMEOUT),
            buckets: vec![KBucket::new(Id::MIN, 0, DEFAULT_BUCKET_SIZE, Instant::now())],
            nodes_to_ping: Vec::new(),
        }
    }

    /// Set the maximum number of nodes per bucket.
    ///
    /// Must be called before any node is added.
    pub fn with_bucket_size(mut self, bucket_size: usize) -> Self {
        self.bucket_size = bucket_size;
        for bucket in self.buckets.iter_mut() {
            bucket.capacity = bucket_size;
        }
        self
    }

    pub fn with_depth_modulo(mut self, depth_modulo: usize) -> Self {
        self.depth_modulo = depth_modulo.max(1);
        self
    }

    /// Set the staleness timeout, `None` means buckets never become stale.
    pub fn with_staleness_timeout(mut self, staleness_timeout: Option<Duration>) -> Self {
        self.staleness_timeout = staleness_timeout;
        self
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    pub fn staleness_timeout(&self) -> Option<Duration> {
        self.staleness_timeout
    }

    /// Returns the buckets sorted by their lower bound.
    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    // === Public Methods ===

    /// Record an inbound request from `node`.
    ///
    /// A peer that sends us a request is alive, so it is inserted or refreshed.
    pub fn register_request_from(&mut self, node: Node) -> bool {
        self.observe(node, Instant::now())
    }

    /// Record the outcome of a request we sent to `address`.
    ///
    /// If the peer responded it is inserted or refreshed under the id it
    /// reported. Otherwise it is flagged as failed, or evicted in favour of
    /// the most recent replacement candidate of its bucket.
    pub fn register_request_to(&mut self, address: SocketAddrV4, id: Option<Id>, responded: bool) {
        match (id, responded) {
            (Some(id), true) => {
                self.observe(Node::new(id, address), Instant::now());
            }
            (_, true) => {}
            (id, false) => {
                let id = id.or_else(|| {
                    self.nodes()
                        .find(|node| node.address == address)
                        .map(|node| node.id)
                });

                if let Some(id) = id {
                    self.nodes_to_ping.retain(|node| node.id != id);

                    let index = self.bucket_index(&id);
                    self.buckets[index].fail(&id);
                }
            }
        }
    }

    /// Returns up to `k` known peers sorted by ascending xor distance to
    /// `target`, never including `exclude` nor peers that failed to respond.
    pub fn nearest_neighbors(&self, target: &Id, k: usize, exclude: Option<&Id>) -> Vec<Node> {
        let mut nearest = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.nodes.iter())
            .filter(|entry| !entry.failed && Some(&entry.node.id) != exclude)
            .map(|entry| entry.node)
            .collect::<Vec<_>>();

        // Xor is injective, so equal distances only happen for equal ids.
        nearest.sort_by_key(|node| (node.id.xor(target), node.id));
        nearest.truncate(k);

        nearest
    }

    /// Returns `true` if `id` is one of the active nodes of this table.
    pub fn contains(&self, id: &Id) -> bool {
        self.get(id).is_some()
    }

    /// Returns the active node with the given `id`.
    pub fn get(&self, id: &Id) -> Option<&Node> {
        self.buckets[self.bucket_index(id)]
            .nodes
            .iter()
            .find(|entry| &entry.node.id == id)
            .map(|entry| &entry.node)
    }

    /// Drain the least recently seen nodes of full buckets, that should be
    /// pinged to decide whether a replacement candidate takes their place.
    pub fn take_nodes_to_ping(&mut self) -> Vec<Node> {
        std::mem::take(&mut self.nodes_to_ping)
    }

    /// One random id within the range of every stale bucket.
    pub fn refresh_targets<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Vec<Id> {
        self.refresh_targets_at(Instant::now(), rng)
    }

    pub(crate) fn refresh_targets_at<R: Rng + ?Sized>(
        &mut self,
        now: Instant,
        rng: &mut R,
    ) -> Vec<Id> {
        let Some(staleness_timeout) = self.staleness_timeout else {
            return Vec::new();
        };

        let mut targets = Vec::new();

        for bucket in self.buckets.iter_mut() {
            if now.saturating_duration_since(bucket.last_updated) > staleness_timeout {
                targets.push(Id::random_with_prefix(&bucket.lower, bucket.depth, rng));
                bucket.last_updated = now;
            }
        }

        targets
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    /// Return the number of nodes in this routing table.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    /// Returns an iterator over the active nodes in this routing table.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.nodes.iter().map(|entry| &entry.node))
    }

    /// Export an owned vector of nodes from this routing table.
    pub fn to_owned_nodes(&self) -> Vec<Node> {
        self.nodes().copied().collect()
    }

    // === Private Methods ===

    fn observe(&mut self, node: Node, now: Instant) -> bool {
        if node.id == self.id {
            // Do not add self to the routing_table
            return false;
        }

        self.nodes_to_ping.retain(|pending| pending.id != node.id);

        loop {
            let index = self.bucket_index(&node.id);
            let bucket = &mut self.buckets[index];

            if bucket.try_add(node, now) {
                return true;
            }

            if self.should_split(index) {
                self.split(index, now);
                continue;
            }

            let bucket = &mut self.buckets[index];
            bucket.add_replacement(node);

            if let Some(lru) = bucket.least_recently_seen() {
                if !self.nodes_to_ping.iter().any(|pending| pending.id == lru.id) {
                    self.nodes_to_ping.push(lru);
                }
            }

            return false;
        }
    }

    fn should_split(&self, index: usize) -> bool {
        let bucket = &self.buckets[index];

        bucket.depth < ID_BITS
            && (bucket.covers(&self.id) || bucket.depth % self.depth_modulo != 0)
    }

    fn split(&mut self, index: usize, now: Instant) {
        let (left, right) = self.buckets.remove(index).split(now);

        self.buckets.insert(index, right);
        self.buckets.insert(index, left);
    }

    fn bucket_index(&self, id: &Id) -> usize {
        self.buckets
            .partition_point(|bucket| &bucket.lower <= id)
            .saturating_sub(1)
    }

    #[cfg(test)]
    fn replacements_len(&self) -> usize {
        self.buckets.iter().map(|b| b.replacements.len()).sum()
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    node: Node,
    failed: bool,
}

/// A range of the id space `[lower, lower + 2^(160 - depth))` holding at most
/// `capacity` nodes, least recently seen first.
#[derive(Debug, Clone)]
pub struct KBucket {
    lower: Id,
    depth: usize,
    capacity: usize,
    nodes: Vec<Entry>,
    /// Candidates waiting for an active node to fail, most recent last.
    replacements: Vec<Node>,
    last_updated: Instant,
}

impl KBucket {
    fn new(lower: Id, depth: usize, capacity: usize, now: Instant) -> Self {
        KBucket {
            lower,
            depth,
            capacity,
            nodes: Vec::with_capacity(capacity),
            replacements: Vec::new(),
            last_updated: now,
        }
    }

    // === Getters ===

    /// Smallest id covered by this bucket.
    pub fn lower(&self) -> &Id {
        &self.lower
    }

    /// Largest id covered by this bucket.
    pub fn upper(&self) -> Id {
        let mut upper = self.lower;
        for index in self.depth..ID_BITS {
            upper = upper.with_bit(index, true);
        }
        upper
    }

    /// Number of leading bits shared by every id in this bucket.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }

    pub fn replacements(&self) -> &[Node] {
        &self.replacements
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().map(|entry| &entry.node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns `true` if `id` falls within this bucket's range.
    pub fn covers(&self, id: &Id) -> bool {
        self.lower.common_prefix_len(id) >= self.depth
    }

    // === Private Methods ===

    /// Insert or refresh `incoming`, returns `false` if the bucket is full.
    fn try_add(&mut self, incoming: Node, now: Instant) -> bool {
        if let Some(index) = self.nodes.iter().position(|e| e.node.id == incoming.id) {
            // Refresh, possibly updating the address, and move to the end.
            self.nodes.remove(index);
        } else if self.nodes.len() >= self.capacity {
            match self.nodes.iter().position(|e| e.failed) {
                Some(index) => {
                    self.nodes.remove(index);
                }
                None => return false,
            }
        }

        self.replacements.retain(|node| node.id != incoming.id);
        self.nodes.push(Entry {
            node: incoming,
            failed: false,
        });
        self.last_updated = now;

        true
    }

    fn add_replacement(&mut self, incoming: Node) {
        self.replacements.retain(|node| node.id != incoming.id);
        self.replacements.push(incoming);

        if self.replacements.len() > self.capacity {
            self.replacements.remove(0);
        }
    }

    fn least_recently_seen(&self) -> Option<Node> {
        self.nodes.first().map(|entry| entry.node)
    }

    fn fail(&mut self, id: &Id) {
        if let Some(index) = self.nodes.iter().position(|e| &e.node.id == id) {
            match self.replacements.pop() {
                Some(replacement) => {
                    self.nodes.remove(index);
                    self.nodes.push(Entry {
                        node: replacement,
                        failed: false,
                    });
                }
                None => self.nodes[index].failed = true,
            }
        } else {
            self.replacements.retain(|node| &node.id != id);
        }
    }

    fn split(self, now: Instant) -> (KBucket, KBucket) {
        let depth = self.depth + 1;

        let mut left = KBucket::new(self.lower, depth, self.capacity, now);
        let mut right = KBucket::new(
            self.lower.with_bit(self.depth, true),
            depth,
            self.capacity,
            now,
        );

        for entry in self.nodes {
            if left.covers(&entry.node.id) {
                left.nodes.push(entry);
            } else {
                right.nodes.push(entry);
            }
        }

        // Oldest first, so the most recent candidates are promoted or kept last.
        for node in self.replacements {
            let half = if left.covers(&node.id) {
                &mut left
            } else {
                &mut right
            };

            if half.nodes.len() < half.capacity {
                half.nodes.push(Entry {
                    node,
                    failed: false,
                });
            } else {
                half.add_replacement(node);
            }
        }

        (left, right)
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::net::SocketAddrV4;
    use std::str::FromStr;
    use std::time::{Duration, Instant};

    use rand::{rngs::StdRng, SeedableRng};

    use crate::common::{Id, Node, RoutingTable, ID_SIZE};

    fn successor(id: &Id) -> Option<Id> {
        let mut bytes = id.0;
        for i in (0..ID_SIZE).rev() {
            let (byte, overflow) = bytes[i].overflowing_add(1);
            bytes[i] = byte;
            if !overflow {
                return Some(Id(bytes));
            }
        }
        None
    }

    fn assert_coverage(table: &RoutingTable) {
        let buckets = table.buckets();

        assert_eq!(buckets[0].lower(), &Id::MIN);
        assert_eq!(buckets[buckets.len() - 1].upper(), Id::MAX);

        for pair in buckets.windows(2) {
            assert_eq!(successor(&pair[0].upper()).as_ref(), Some(pair[1].lower()));
        }

        for bucket in buckets {
            for node in bucket.nodes() {
                assert!(bucket.covers(node.id()));
            }
        }
    }

    /// An id of the form `prefix || random`, where prefix is the first byte.
    fn id_with_first_byte(byte: u8) -> Id {
        let mut id = Id::random();
        id.0[0] = byte;
        id
    }

    #[test]
    fn table_is_empty() {
        let mut table = RoutingTable::new(Id::random());
        assert!(table.is_empty());

        table.register_request_from(Node::random());
        assert!(!table.is_empty());
    }

    #[test]
    fn contains() {
        let mut table = RoutingTable::new(Id::random());

        let node = Node::random();

        assert!(!table.contains(node.id()));

        table.register_request_from(node);
        assert!(table.contains(node.id()));
    }

    #[test]
    fn buckets_are_sets() {
        let mut table = RoutingTable::new(Id::random());

        let node1 = Node::random();
        let node2 = Node::new(*node1.id(), SocketAddrV4::new([127, 0, 0, 1].into(), 6881));

        table.register_request_from(node1);
        table.register_request_from(node2);

        assert_eq!(table.size(), 1);
        assert_eq!(table.get(node1.id()).unwrap().address(), node2.address());
    }

    #[test]
    fn should_not_add_self() {
        let mut table = RoutingTable::new(Id::random());
        let node = Node::new(*table.id(), SocketAddrV4::new(0.into(), 0));

        assert!(!table.register_request_from(node));
        table.register_request_to(node.address(), Some(node.id), true);

        assert!(table.is_empty())
    }

    #[test]
    fn refresh_moves_to_most_recent() {
        let mut table = RoutingTable::new(Id::random());

        let first = Node::unique(1);
        let second = Node::unique(2);

        table.register_request_from(first);
        table.register_request_from(second);
        table.register_request_to(first.address(), Some(first.id), true);

        let order = table.nodes().map(|n| n.id).collect::<Vec<_>>();
        assert_eq!(order, vec![second.id, first.id]);
    }

    #[test]
    fn full_bucket_keeps_replacement() {
        let k = 4;
        let mut table = RoutingTable::new(Id::MIN)
            .with_bucket_size(k)
            .with_depth_modulo(1);

        // All in the upper half, far from our own id.
        for i in 0..=k {
            table.register_request_from(Node::new(
                id_with_first_byte(0x80 | i as u8),
                SocketAddrV4::new([127, 0, 0, 1].into(), i as u16),
            ));
        }

        assert_eq!(table.size(), k);
        assert_eq!(table.replacements_len(), 1);

        let far = table
            .buckets()
            .iter()
            .find(|b| b.covers(&id_with_first_byte(0x80)))
            .unwrap();
        assert_eq!(far.depth(), 1);
        assert_eq!(far.len(), k);

        // Least recently seen node is scheduled for a liveness check.
        let to_ping = table.take_nodes_to_ping();
        assert_eq!(to_ping.len(), 1);
        assert_eq!(to_ping[0].address().port(), 0);
        assert!(table.take_nodes_to_ping().is_empty());
    }

    #[test]
    fn unresponsive_node_is_replaced() {
        let k = 2;
        let mut table = RoutingTable::new(Id::MIN)
            .with_bucket_size(k)
            .with_depth_modulo(1);

        let nodes = (0..=k)
            .map(|i| {
                Node::new(
                    id_with_first_byte(0xf0 | i as u8),
                    SocketAddrV4::new([127, 0, 0, 1].into(), 100 + i as u16),
                )
            })
            .collect::<Vec<_>>();

        for node in &nodes {
            table.register_request_from(*node);
        }

        assert!(!table.contains(&nodes[k].id));

        table.register_request_to(nodes[0].address(), Some(nodes[0].id), false);

        assert!(!table.contains(&nodes[0].id));
        assert!(table.contains(&nodes[k].id));
        assert_eq!(table.replacements_len(), 0);
    }

    #[test]
    fn unresponsive_node_without_replacement_is_flagged() {
        let mut table = RoutingTable::new(Id::random());

        let node = Node::unique(1);
        table.register_request_from(node);

        // Identified by address only.
        table.register_request_to(node.address(), None, false);

        assert!(table.contains(node.id()));
        assert!(table.nearest_neighbors(node.id(), 20, None).is_empty());

        // Hearing back clears the flag.
        table.register_request_to(node.address(), Some(node.id), true);
        assert_eq!(table.nearest_neighbors(node.id(), 20, None), vec![node]);
    }

    #[test]
    fn flagged_node_is_evicted_for_responsive_one() {
        let k = 2;
        let mut table = RoutingTable::new(Id::MIN)
            .with_bucket_size(k)
            .with_depth_modulo(1);

        let a = Node::new(id_with_first_byte(0xa0), SocketAddrV4::new(0.into(), 1));
        let b = Node::new(id_with_first_byte(0xb0), SocketAddrV4::new(0.into(), 2));
        let c = Node::new(id_with_first_byte(0xc0), SocketAddrV4::new(0.into(), 3));

        table.register_request_from(a);
        table.register_request_from(b);
        table.register_request_to(a.address(), Some(a.id), false);

        table.register_request_from(c);

        assert!(!table.contains(&a.id));
        assert!(table.contains(&b.id));
        assert!(table.contains(&c.id));
    }

    #[test]
    fn buckets_cover_id_space() {
        let mut table = RoutingTable::new(Id::random()).with_bucket_size(4);

        assert_coverage(&table);

        for i in 0..500 {
            table.register_request_from(Node::unique(i));
        }

        assert!(table.buckets().len() > 1);
        assert_coverage(&table);
    }

    #[test]
    fn nearest_neighbors_are_sorted() {
        let mut table = RoutingTable::new(Id::random());

        for i in 0..200 {
            table.register_request_from(Node::unique(i));
        }

        for _ in 0..20 {
            let target = Id::random();
            let nearest = table.nearest_neighbors(&target, 20, None);

            assert_eq!(nearest.len(), 20.min(table.size()));

            for pair in nearest.windows(2) {
                assert!(pair[0].id.xor(&target) <= pair[1].id.xor(&target));
            }

            // No known node is closer than the last one returned.
            let farthest = nearest[nearest.len() - 1].id.xor(&target);
            let closer = table
                .nodes()
                .filter(|n| n.id.xor(&target) < farthest)
                .count();
            assert_eq!(closer, nearest.len() - 1);
        }
    }

    #[test]
    fn nearest_neighbors_exclude() {
        let mut table = RoutingTable::new(Id::random());

        let target = Node::unique(1);
        table.register_request_from(target);
        table.register_request_from(Node::unique(2));

        let nearest = table.nearest_neighbors(target.id(), 20, None);
        assert_eq!(nearest[0], target);

        let nearest = table.nearest_neighbors(target.id(), 20, Some(target.id()));
        assert_eq!(nearest.len(), 1);
        assert_ne!(nearest[0], target);
    }

    #[test]
    fn closest() {
        let ids = [
            "fb449c17f6c34fadea26a5a83e1952e815e001ea",
            "e63b72f95aacee40ad087f83afb475645739f669",
            "58c65677e3833cb0f15733a6363cc4cb1352f90a",
            "fd042ff1404b495720ad8345404ff5f25acd02a8",
            "dbed34a2c8db568fe59c10adcca9e81825b3dcfd",
            "079d40b746b5721f59972ebde423429739844914",
            "94d2037bbc534a5f1d672ce3e3350576c2b78ed1",
            "b48d0aeb94cd3766f23d2ac098bbccf01485dc20",
        ];

        let local_id = Id::from_str("ba3042eb2d373b19e7c411ce6826e31b37be0b2e").unwrap();
        let mut table = RoutingTable::new(local_id);

        for (i, id) in ids.iter().enumerate() {
            table.register_request_from(Node::new(
                Id::from_str(id).unwrap(),
                SocketAddrV4::new((i as u32).into(), i as u16),
            ));
        }

        let closest = table
            .nearest_neighbors(&local_id, 3, None)
            .iter()
            .map(|n| n.id.to_string())
            .collect::<Vec<_>>();

        assert_eq!(
            closest,
            vec![
                "b48d0aeb94cd3766f23d2ac098bbccf01485dc20",
                "94d2037bbc534a5f1d672ce3e3350576c2b78ed1",
                "fb449c17f6c34fadea26a5a83e1952e815e001ea",
            ]
        );
    }

    #[test]
    fn stale_buckets_get_one_target_each() {
        let timeout = Duration::from_secs(600);
        let mut rng = StdRng::seed_from_u64(1);

        let mut table = RoutingTable::new(Id::random())
            .with_bucket_size(2)
            .with_depth_modulo(1)
            .with_staleness_timeout(Some(timeout));

        // We add to Instant::now() instead of subtracting, because on Windows
        // Instant can be close to its internal epoch and subtraction overflows.
        let start = Instant::now();

        let nodes = (0..50).map(Node::unique).collect::<Vec<_>>();
        for node in &nodes {
            table.observe(*node, start);
        }

        let fresh = *table.nodes().next().unwrap();
        table.observe(fresh, start + Duration::from_secs(500));

        let fresh_bucket = table
            .buckets()
            .iter()
            .position(|b| b.covers(&fresh.id))
            .unwrap();

        let now = start + Duration::from_secs(700);
        let targets = table.refresh_targets_at(now, &mut rng);

        assert_eq!(targets.len(), table.buckets().len() - 1);

        let mut refreshed = HashSet::new();
        for target in &targets {
            let index = table
                .buckets()
                .iter()
                .position(|b| b.covers(target))
                .unwrap();

            assert_ne!(index, fresh_bucket);
            assert!(refreshed.insert(index), "two targets in one bucket");
        }

        // Refreshed buckets are no longer stale.
        assert!(table.refresh_targets_at(now, &mut rng).is_empty());
    }

    #[test]
    fn staleness_can_be_disabled() {
        let mut table = RoutingTable::new(Id::random()).with_staleness_timeout(None);

        let future = Instant::now() + Duration::from_secs(100_000);

        assert!(table
            .refresh_targets_at(future, &mut rand::thread_rng())
            .is_empty());
    }
}
