//! UDP socket layer managing incoming/outgoing requests and responses.

use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::common::{Message, MessageType, RequestSpecific, ResponseSpecific};

use super::config::Config;

const VERSION: [u8; 4] = [69, 68, 0, 1]; // "ED" version 01
const MTU: usize = 2048;

/// The maximum duration to backoff checking the [UdpSocket] buffer after it is empty.
/// Lower values increases CPU usage, but reduces latency, and drains the buffer faster,
/// reducing the risk of packet loss.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// Sends requests and keeps track of which of them are still awaiting a response.
///
/// Implemented by [KrpcSocket], and by in memory networks in tests.
pub(crate) trait Transport {
    /// Send a request to the given address and return its transaction_id.
    fn request(&mut self, address: SocketAddrV4, request: RequestSpecific) -> u32;

    /// Returns true if the request is still awaiting a response and did not time out.
    fn inflight(&self, transaction_id: u32) -> bool;

    /// Stop waiting for a response, a late one will be ignored.
    fn cancel(&mut self, transaction_id: u32);
}

/// A UdpSocket wrapper that formats and correlates DHT requests and responses.
#[derive(Debug)]
pub struct KrpcSocket {
    next_tid: u32,
    socket: UdpSocket,
    local_addr: SocketAddrV4,
    inflight_requests: InflightRequestsMap,
}

#[derive(Debug, Clone)]
pub struct InflightRequest {
    to: SocketAddrV4,
    sent_at: Instant,
}

impl KrpcSocket {
    pub(crate) fn new(config: &Config) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(SocketAddrV4::new(
            config.interface,
            config.port.unwrap_or(0),
        ))?;

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "KrpcSocket does not support Ipv6",
                ))
            }
        };

        socket.set_nonblocking(true)?;

        Ok(Self {
            socket,
            next_tid: 0,
            local_addr,
            inflight_requests: InflightRequestsMap::new(config.wait_timeout),
        })
    }

    #[cfg(test)]
    pub(crate) fn localhost() -> Result<Self, std::io::Error> {
        Self::new(&Config {
            interface: std::net::Ipv4Addr::LOCALHOST,
            ..Default::default()
        })
    }

    // === Getters ===

    /// Returns the address the server is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    // === Public Methods ===

    /// Send a response to the given address.
    pub fn response(
        &mut self,
        address: SocketAddrV4,
        transaction_id: u32,
        response: ResponseSpecific,
    ) {
        let message = Message {
            transaction_id,
            version: Some(VERSION.to_vec()),
            message_type: MessageType::Response(response),
        };

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending response message");
        });
    }

    /// Remove requests that timed out without a response, returning their
    /// transaction ids and the addresses they were sent to.
    pub fn cleanup(&mut self) -> Vec<(u32, SocketAddrV4)> {
        self.inflight_requests.cleanup(Instant::now())
    }

    /// Receives a single krpc message on the socket.
    /// On success, returns the dht message and the origin.
    ///
    /// Responses are only returned if they answer an inflight request and
    /// come from the address that request was sent to.
    pub fn recv_from(&mut self) -> Option<(Message, SocketAddrV4)> {
        let mut buf = [0u8; MTU];

        match self.socket.recv_from(&mut buf) {
            Ok((amt, SocketAddr::V4(from))) => {
                let bytes = &buf[..amt];

                if from.port() == 0 {
                    trace!(
                        context = "socket_validation",
                        message = "Response from port 0"
                    );
                    return None;
                }

                match Message::from_bytes(bytes) {
                    Ok(message) => {
                        let should_return = match message.message_type {
                            MessageType::Request(_) => {
                                trace!(
                                    context = "socket_message_receiving",
                                    ?message,
                                    ?from,
                                    "Received request message"
                                );
                                true
                            }
                            MessageType::Response(_) => {
                                trace!(
                                    context = "socket_message_receiving",
                                    ?message,
                                    ?from,
                                    "Received response message"
                                );
                                self.is_expected_response(&message, &from)
                            }
                        };

                        if should_return {
                            return Some((message, from));
                        }
                    }
                    Err(error) => {
                        trace!(
                            context = "socket_error",
                            ?error,
                            ?from,
                            message = ?String::from_utf8_lossy(bytes),
                            "Received invalid message."
                        );
                    }
                }
            }
            Ok((_, SocketAddr::V6(_))) => {
                trace!(
                    context = "socket_validation",
                    message = "Received IPv6 packet"
                );
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(MAX_THREAD_BLOCK_DURATION);
            }
            Err(e) => {
                trace!(
                    context = "socket_error",
                    ?e,
                    "recv_from failed unexpectedly"
                );
            }
        }

        None
    }

    // === Private Methods ===

    fn is_expected_response(&mut self, message: &Message, from: &SocketAddrV4) -> bool {
        match self.inflight_requests.get(message.transaction_id) {
            Some(request) if compare_socket_addr(&request.to, from) => {
                self.inflight_requests.remove(message.transaction_id);
                true
            }
            Some(_) => {
                trace!(
                    context = "socket_validation",
                    message = "Response from wrong address"
                );
                false
            }
            None => {
                trace!(
                    context = "socket_validation",
                    message = "Unexpected response id"
                );
                false
            }
        }
    }

    /// Increments self.next_tid and returns the previous value.
    fn tid(&mut self) -> u32 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        tid
    }

    /// Send a raw dht message
    fn send(&mut self, address: SocketAddrV4, message: Message) -> crate::Result<()> {
        self.socket.send_to(&message.to_bytes()?, address)?;
        trace!(context = "socket_message_sending", message = ?message);
        Ok(())
    }
}

impl Transport for KrpcSocket {
    fn request(&mut self, address: SocketAddrV4, request: RequestSpecific) -> u32 {
        let message = Message {
            transaction_id: self.tid(),
            version: Some(VERSION.to_vec()),
            message_type: MessageType::Request(request),
        };

        let tid = message.transaction_id;
        self.inflight_requests.insert(
            tid,
            InflightRequest {
                to: address,
                sent_at: Instant::now(),
            },
        );
        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending request message");
        });
        tid
    }

    fn inflight(&self, transaction_id: u32) -> bool {
        self.inflight_requests.contains_key(transaction_id)
    }

    fn cancel(&mut self, transaction_id: u32) {
        self.inflight_requests.remove(transaction_id);
    }
}

// Same as SocketAddr::eq but ignores the ip if it is unspecified for testing reasons.
fn compare_socket_addr(a: &SocketAddrV4, b: &SocketAddrV4) -> bool {
    if a.port() != b.port() {
        return false;
    }

    if a.ip().is_unspecified() {
        return true;
    }

    a.ip() == b.ip()
}

#[derive(Debug)]
struct InflightRequestsMap {
    request_timeout: Duration,
    requests: Vec<(u32, InflightRequest)>,
}

impl InflightRequestsMap {
    fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            requests: vec![],
        }
    }

    fn get(&self, key: u32) -> Option<&InflightRequest> {
        self.find_index(key)
            .ok()
            .and_then(|index| self.requests.get(index))
            .map(|(_, request)| request)
    }

    fn contains_key(&self, key: u32) -> bool {
        self.get(key)
            .map(|request| request.sent_at.elapsed() < self.request_timeout)
            .unwrap_or(false)
    }

    fn insert(&mut self, key: u32, inflight_request: InflightRequest) {
        match self.find_index(key) {
            Ok(index) => self.requests[index] = (key, inflight_request),
            Err(index) => self.requests.insert(index, (key, inflight_request)),
        }
    }

    fn remove(&mut self, key: u32) -> Option<InflightRequest> {
        match self.find_index(key) {
            Ok(index) => Some(self.requests.remove(index).1),
            Err(_) => None,
        }
    }

    fn find_index(&self, key: u32) -> Result<usize, usize> {
        self.requests.binary_search_by(|(tid, _)| tid.cmp(&key))
    }

    fn cleanup(&mut self, now: Instant) -> Vec<(u32, SocketAddrV4)> {
        let mut expired = vec![];
        let request_timeout = self.request_timeout;

        self.requests.retain(|(tid, request)| {
            if now.saturating_duration_since(request.sent_at) >= request_timeout {
                expired.push((*tid, request.to));
                false
            } else {
                true
            }
        });

        expired
    }
}
