//! Two phase contact of the initial peers.

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::common::{Id, RequestSpecific, RequestTypeSpecific};

use super::socket::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for any initial peer, until `wait_timeout` after the start.
    AwaitingFirst,
    /// Someone answered, wait for the rest until `bootstrap_timeout` after the start.
    AwaitingRest,
    Done,
}

#[derive(Debug)]
/// Pings every initial peer, the responses are recorded in the routing table
/// by the caller like any other response.
pub(crate) struct Bootstrap {
    phase: Phase,
    first_deadline: Instant,
    rest_deadline: Instant,
    pings: Vec<(u32, SocketAddrV4)>,
    peers: usize,
    responded: usize,
}

impl Bootstrap {
    pub fn start<T: Transport>(
        transport: &mut T,
        requester_id: Id,
        peers: &[SocketAddrV4],
        wait_timeout: Duration,
        bootstrap_timeout: Duration,
        now: Instant,
    ) -> Self {
        let pings = peers
            .iter()
            .map(|address| {
                let tid = transport.request(
                    *address,
                    RequestSpecific {
                        requester_id,
                        request_type: RequestTypeSpecific::Ping,
                    },
                );

                (tid, *address)
            })
            .collect::<Vec<_>>();

        debug!(peers = peers.len(), "Bootstrap started");

        Self {
            phase: if pings.is_empty() {
                Phase::Done
            } else {
                Phase::AwaitingFirst
            },
            first_deadline: now + wait_timeout,
            rest_deadline: now + bootstrap_timeout,
            pings,
            peers: peers.len(),
            responded: 0,
        }
    }

    // === Getters ===

    /// Number of initial peers that responded.
    pub fn responded(&self) -> usize {
        self.responded
    }

    /// Number of initial peers contacted.
    pub fn peers(&self) -> usize {
        self.peers
    }

    // === Public Methods ===

    /// Returns false if the tid is not one of the bootstrap pings.
    pub fn response(&mut self, tid: u32) -> bool {
        let Some(position) = self.pings.iter().position(|(t, _)| *t == tid) else {
            return false;
        };

        self.pings.swap_remove(position);
        self.responded += 1;

        true
    }

    /// Returns true when the ping phases are over.
    pub fn tick<T: Transport>(&mut self, transport: &mut T, now: Instant) -> bool {
        self.pings.retain(|(tid, _)| transport.inflight(*tid));

        if self.phase == Phase::AwaitingFirst && self.responded > 0 {
            self.phase = Phase::AwaitingRest;
        }

        let deadline = match self.phase {
            Phase::AwaitingFirst => self.first_deadline,
            Phase::AwaitingRest => self.rest_deadline,
            Phase::Done => return true,
        };

        if self.pings.is_empty() || now >= deadline {
            for (tid, address) in self.pings.drain(..) {
                debug!(?address, "Stop waiting for initial peer");
                transport.cancel(tid);
            }

            self.phase = Phase::Done;
            debug!(
                peers = self.peers,
                responded = self.responded,
                "Bootstrap pings done"
            );

            return true;
        }

        false
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        next_tid: u32,
        inflight: HashSet<u32>,
    }

    impl Transport for Recorder {
        fn request(&mut self, _address: SocketAddrV4, _request: RequestSpecific) -> u32 {
            let tid = self.next_tid;
            self.next_tid += 1;
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

    const WAIT: Duration = Duration::from_secs(5);
    const BOOTSTRAP: Duration = Duration::from_secs(8);

    fn peers(count: u16) -> Vec<SocketAddrV4> {
        (1..=count)
            .map(|port| SocketAddrV4::new([127, 0, 0, 1].into(), port))
            .collect()
    }

    #[test]
    fn no_initial_peers() {
        let mut transport = Recorder::default();
        let now = Instant::now();

        let mut bootstrap = Bootstrap::start(&mut transport, Id::random(), &[], WAIT, BOOTSTRAP, now);

        assert!(bootstrap.tick(&mut transport, now));
        assert_eq!(bootstrap.peers(), 0);
    }

    #[test]
    fn wait_for_the_rest_after_first_response() {
        let mut transport = Recorder::default();
        let now = Instant::now();

        let mut bootstrap =
            Bootstrap::start(&mut transport, Id::random(), &peers(3), WAIT, BOOTSTRAP, now);

        assert!(!bootstrap.tick(&mut transport, now));

        transport.inflight.remove(&0);
        assert!(bootstrap.response(0));

        // Past the first deadline, but someone already answered.
        let later = now + WAIT + Duration::from_secs(1);
        assert!(!bootstrap.tick(&mut transport, later));

        transport.inflight.remove(&1);
        assert!(bootstrap.response(1));

        assert!(bootstrap.tick(&mut transport, now + BOOTSTRAP));
        assert_eq!(bootstrap.responded(), 2);
        assert!(transport.inflight.is_empty(), "straggler is cancelled");
    }

    #[test]
    fn done_when_every_peer_answered() {
        let mut transport = Recorder::default();
        let now = Instant::now();

        let mut bootstrap =
            Bootstrap::start(&mut transport, Id::random(), &peers(2), WAIT, BOOTSTRAP, now);

        for tid in 0..2 {
            transport.inflight.remove(&tid);
            bootstrap.response(tid);
        }

        assert!(bootstrap.tick(&mut transport, now));
        assert_eq!(bootstrap.responded(), 2);
    }

    #[test]
    fn give_up_without_any_response() {
        let mut transport = Recorder::default();
        let now = Instant::now();

        let mut bootstrap =
            Bootstrap::start(&mut transport, Id::random(), &peers(2), WAIT, BOOTSTRAP, now);

        assert!(!bootstrap.tick(&mut transport, now + WAIT - Duration::from_millis(1)));
        assert!(bootstrap.tick(&mut transport, now + WAIT));
        assert_eq!(bootstrap.responded(), 0);
        assert!(transport.inflight.is_empty());
    }
}
