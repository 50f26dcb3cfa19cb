//! Manage iterative queries and their corresponding request/response.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::{socket::Transport, ClosestNodes};
use crate::common::{
    DhtTime, FindNodeRequestArguments, FindValueRequestArguments, Id, Node, RequestSpecific,
    RequestTypeSpecific, StoredValue,
};

#[derive(Debug, Clone, Copy)]
/// Parameters shared by every lookup a node runs.
pub(crate) struct QuerySettings {
    /// Number of closest nodes a lookup converges on.
    pub k: usize,
    /// Concurrent requests per round.
    pub alpha: usize,
    pub max_rounds: Option<usize>,
    /// Time a round waits for its responses.
    pub round_timeout: Duration,
}

/// An iterative process of concurrently sending a request to the `alpha` closest
/// unvisited nodes to the target, merging closer nodes discovered in the responses,
/// and repeating this process until a round brings no closer node, the `k` closest
/// candidates were all visited, or the round budget is spent.
#[derive(Debug)]
pub(crate) struct IterativeQuery {
    request: RequestSpecific,
    settings: QuerySettings,
    candidates: ClosestNodes,
    responded: usize,
    visited: HashSet<Id>,
    failed: HashSet<Id>,
    round: Option<Round>,
    rounds: usize,
    sufficient_time: DhtTime,
    value: Option<StoredValue>,
    responder_values: Vec<(Node, Option<DhtTime>)>,
    stragglers: Vec<Node>,
    done: bool,
}

#[derive(Debug)]
struct Round {
    inflight: Vec<(u32, Node)>,
    deadline: Instant,
    best_before: Option<Id>,
}

impl IterativeQuery {
    /// Lookup the nodes closest to `target`.
    pub fn find_node(requester_id: Id, target: Id, settings: QuerySettings) -> Self {
        Self::new(
            requester_id,
            target,
            RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }),
            settings,
        )
    }

    /// Lookup a value stored under `key`, finishing early once a value
    /// expiring after `sufficient_time` is found.
    pub fn find_value(
        requester_id: Id,
        key: Id,
        sufficient_time: DhtTime,
        settings: QuerySettings,
    ) -> Self {
        let mut query = Self::new(
            requester_id,
            key,
            RequestTypeSpecific::FindValue(FindValueRequestArguments { key }),
            settings,
        );
        query.sufficient_time = sufficient_time;

        query
    }

    fn new(
        requester_id: Id,
        target: Id,
        request_type: RequestTypeSpecific,
        settings: QuerySettings,
    ) -> Self {
        trace!(?target, ?request_type, "New Query");

        Self {
            request: RequestSpecific {
                requester_id,
                request_type,
            },
            settings,

            candidates: ClosestNodes::new(target),
            responded: 0,

            visited: HashSet::new(),
            failed: HashSet::new(),

            round: None,
            rounds: 0,

            sufficient_time: f64::NEG_INFINITY,
            value: None,
            responder_values: Vec::new(),
            stragglers: Vec::new(),

            done: false,
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.candidates.target()
    }

    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    /// Number of rounds sent so far.
    #[cfg(test)]
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// The value with the latest expiration seen so far.
    pub fn value(&self) -> Option<&StoredValue> {
        self.value.as_ref()
    }

    /// Up to `k` closest nodes found, excluding those that failed to respond.
    pub fn results(&self) -> Vec<Node> {
        self.candidates
            .nodes()
            .iter()
            .filter(|node| !self.failed.contains(&node.id))
            .take(self.settings.k)
            .copied()
            .collect()
    }

    /// Responders of a value lookup that returned no value, or one older than the best.
    pub fn outdated_responders(&self) -> Vec<Node> {
        let best = match &self.value {
            Some(value) => value.expiration_time,
            None => return Vec::new(),
        };

        self.responder_values
            .iter()
            .filter(|(_, expiration_time)| expiration_time.map_or(true, |time| time < best))
            .map(|(node, _)| *node)
            .collect()
    }

    // === Public Methods ===

    /// Nodes that did not respond before their round's deadline, since the last call.
    pub fn take_stragglers(&mut self) -> Vec<Node> {
        std::mem::take(&mut self.stragglers)
    }

    /// Add a candidate node to query in the next rounds.
    pub fn add_candidate(&mut self, node: Node) {
        if node.id == self.request.requester_id {
            return;
        }

        self.candidates.add(node);
    }

    /// Return true if a response (by transaction_id) is expected by this query.
    pub fn inflight(&self, transaction_id: u32) -> bool {
        self.round
            .as_ref()
            .map(|round| round.inflight.iter().any(|(tid, _)| *tid == transaction_id))
            .unwrap_or(false)
    }

    /// Handle a response to one of this query's requests.
    ///
    /// Returns false if the transaction_id does not belong to this query.
    pub fn response<T: Transport>(
        &mut self,
        transport: &mut T,
        transaction_id: u32,
        from: Node,
        nodes: &[Node],
        value: Option<StoredValue>,
    ) -> bool {
        let Some(round) = self.round.as_mut() else {
            return false;
        };
        let Some(position) = round
            .inflight
            .iter()
            .position(|(tid, _)| *tid == transaction_id)
        else {
            return false;
        };

        round.inflight.swap_remove(position);

        self.responded += 1;

        for node in nodes {
            self.add_candidate(*node);
        }

        if let RequestTypeSpecific::FindValue(_) = self.request.request_type {
            self.responder_values
                .push((from, value.as_ref().map(|v| v.expiration_time)));

            if let Some(value) = value {
                let sufficient = value.expiration_time > self.sufficient_time;

                if self
                    .value
                    .as_ref()
                    .map_or(true, |best| value.expiration_time > best.expiration_time)
                {
                    self.value = Some(value);
                }

                if sufficient {
                    self.finish(transport);
                }
            }
        }

        true
    }

    /// Advance the query, sending a new round of requests when the current one is over.
    ///
    /// Returns true if it is done.
    pub fn tick<T: Transport>(&mut self, transport: &mut T, now: Instant) -> bool {
        if self.done {
            return true;
        }

        if let Some(round) = self.round.as_mut() {
            let failed = &mut self.failed;

            round.inflight.retain(|(tid, node)| {
                if transport.inflight(*tid) {
                    true
                } else {
                    failed.insert(node.id);
                    false
                }
            });

            if !round.inflight.is_empty() && now < round.deadline {
                return false;
            }

            for (tid, node) in round.inflight.drain(..) {
                transport.cancel(tid);
                self.failed.insert(node.id);
                self.stragglers.push(node);
            }

            let best_before = round.best_before;
            self.round = None;

            if !improves(&self.target(), self.best_candidate(), best_before) {
                self.finish(transport);
                return true;
            }
        }

        if self
            .settings
            .max_rounds
            .map_or(false, |max_rounds| self.rounds >= max_rounds)
        {
            self.finish(transport);
            return true;
        }

        let to_visit = self
            .candidates
            .nodes()
            .iter()
            .filter(|node| !self.failed.contains(&node.id))
            .take(self.settings.k)
            .filter(|node| !self.visited.contains(&node.id))
            .take(self.settings.alpha)
            .copied()
            .collect::<Vec<_>>();

        if to_visit.is_empty() {
            self.finish(transport);
            return true;
        }

        let best_before = self.best_candidate();
        let mut inflight = Vec::with_capacity(to_visit.len());

        for node in to_visit {
            let tid = transport.request(node.address, self.request.clone());
            self.visited.insert(node.id);
            inflight.push((tid, node));
        }

        self.rounds += 1;
        self.round = Some(Round {
            inflight,
            deadline: now + self.settings.round_timeout,
            best_before,
        });

        false
    }

    // === Private Methods ===

    /// Closest candidate that has not failed to respond.
    fn best_candidate(&self) -> Option<Id> {
        self.candidates
            .nodes()
            .iter()
            .find(|node| !self.failed.contains(&node.id))
            .map(|node| node.id)
    }

    fn finish<T: Transport>(&mut self, transport: &mut T) {
        if let Some(round) = self.round.take() {
            for (tid, _) in round.inflight {
                transport.cancel(tid);
            }
        }

        self.done = true;

        debug!(
            target = ?self.target(),
            rounds = self.rounds,
            candidates = self.candidates.len(),
            visited = self.visited.len(),
            failed = self.failed.len(),
            responded = self.responded,
            "Done query"
        );
    }
}

/// Whether `after` is strictly closer to `target` than `before`.
fn improves(target: &Id, after: Option<Id>, before: Option<Id>) -> bool {
    match (after, before) {
        (Some(after), Some(before)) => after.xor(target) < before.xor(target),
        (Some(_), None) => true,
        (None, _) => false,
    }
}
