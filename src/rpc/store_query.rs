use tracing::{debug, trace};

use crate::common::{Id, Node, RequestSpecific, RequestTypeSpecific, StoreRequestArguments};

use super::socket::Transport;

#[derive(Debug)]
/// Once a lookup for the key is done, we store the record at the closest nodes
/// using this StoreQuery, that keeps track of the accepting nodes.
pub(crate) struct StoreQuery {
    requester_id: Id,
    request: StoreRequestArguments,
    inflight_requests: Vec<u32>,
    /// Nodes that accepted the record
    stored_at: usize,
    /// Nodes that responded, whether they accepted or not
    responses: usize,
}

impl StoreQuery {
    pub fn new(requester_id: Id, request: StoreRequestArguments) -> Self {
        Self {
            requester_id,
            request,
            inflight_requests: Vec::new(),
            stored_at: 0,
            responses: 0,
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.request.key
    }

    /// Number of nodes that accepted the record so far.
    pub fn stored_at(&self) -> usize {
        self.stored_at
    }

    // === Public Methods ===

    /// Send the store request to every node.
    pub fn start<T: Transport>(&mut self, transport: &mut T, nodes: &[Node]) {
        trace!(target = ?self.target(), nodes = nodes.len(), "StoreQuery start");

        for node in nodes {
            let tid = transport.request(
                node.address,
                RequestSpecific {
                    requester_id: self.requester_id,
                    request_type: RequestTypeSpecific::Store(self.request.clone()),
                },
            );

            self.inflight_requests.push(tid);
        }
    }

    pub fn inflight(&self, tid: u32) -> bool {
        self.inflight_requests.contains(&tid)
    }

    /// Handle a store response, returns false if the tid does not belong to this query.
    pub fn response(&mut self, tid: u32, accepted: bool) -> bool {
        let Some(position) = self.inflight_requests.iter().position(|t| *t == tid) else {
            return false;
        };

        self.inflight_requests.swap_remove(position);
        self.responses += 1;

        if accepted {
            self.stored_at += 1;
        }

        true
    }

    /// Returns true once every request was answered or timed out.
    pub fn tick<T: Transport>(&mut self, transport: &T) -> bool {
        self.inflight_requests.retain(|tid| transport.inflight(*tid));

        let done = self.inflight_requests.is_empty();

        if done {
            debug!(
                target = ?self.target(),
                stored_at = self.stored_at,
                responses = self.responses,
                "Done store query"
            );
        }

        done
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::net::SocketAddrV4;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<(u32, SocketAddrV4)>,
        inflight: HashSet<u32>,
    }

    impl Transport for Recorder {
        fn request(&mut self, address: SocketAddrV4, _request: RequestSpecific) -> u32 {
            let tid = self.sent.len() as u32;
            self.sent.push((tid, address));
            self.inflight.insert(tid);
            tid
        }

        fn inflight(&self, transaction_id: u32) -> bool {
            self.inflight.contains(&transaction_id)
        }

        fn cancel(&mut self, transaction_id: u32) {
            self.inflight.remove(&transaction_id);
        }
    }

    fn query() -> StoreQuery {
        StoreQuery::new(
            Id::random(),
            StoreRequestArguments {
                key: Id::random(),
                value: "v".into(),
                expiration_time: 100.0,
            },
        )
    }

    #[test]
    fn count_accepting_nodes() {
        let mut transport = Recorder::default();
        let mut query = query();

        let nodes = (1..=3).map(Node::unique).collect::<Vec<_>>();
        query.start(&mut transport, &nodes);

        assert_eq!(transport.sent.len(), 3);
        assert!(!query.tick(&transport));

        for (tid, accepted) in [(0, true), (1, false), (2, true)] {
            transport.inflight.remove(&tid);
            assert!(query.response(tid, accepted));
        }

        assert!(!query.response(7, true));
        assert!(query.tick(&transport));
        assert_eq!(query.stored_at(), 2);
    }

    #[test]
    fn timed_out_requests_finish_the_query() {
        let mut transport = Recorder::default();
        let mut query = query();

        query.start(&mut transport, &[Node::unique(1), Node::unique(2)]);

        transport.inflight.clear();

        assert!(query.tick(&transport));
        assert_eq!(query.stored_at(), 0);
    }
}
