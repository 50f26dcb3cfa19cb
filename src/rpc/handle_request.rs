use std::net::SocketAddrV4;

use crate::common::{
    get_dht_time, FindNodeRequestArguments, FindNodeResponseArguments, FindValueRequestArguments,
    FindValueResponseArguments, Node, PingResponseArguments, RequestSpecific,
    RequestTypeSpecific, ResponseSpecific, StoreRequestArguments, StoreResponseArguments,
};

use super::Rpc;

impl Rpc {
    /// Handle an inbound request: record the requester in the routing table,
    /// then answer it.
    pub(super) fn handle_request(
        &mut self,
        from: SocketAddrV4,
        transaction_id: u32,
        request_specific: RequestSpecific,
    ) {
        let requester_id = request_specific.requester_id;

        self.routing_table
            .register_request_from(Node::new(requester_id, from));

        let responder_id = *self.id();
        let bucket_size = self.routing_table.bucket_size();

        let response = match request_specific.request_type {
            RequestTypeSpecific::Ping => {
                ResponseSpecific::Ping(PingResponseArguments { responder_id })
            }
            RequestTypeSpecific::Store(StoreRequestArguments {
                key,
                value,
                expiration_time,
            }) => ResponseSpecific::Store(StoreResponseArguments {
                responder_id,
                accepted: self.storage.put(key, value, expiration_time, get_dht_time()),
            }),
            RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }) => {
                ResponseSpecific::FindNode(FindNodeResponseArguments {
                    responder_id,
                    nodes: self.routing_table.nearest_neighbors(
                        &target,
                        bucket_size,
                        Some(&requester_id),
                    ),
                })
            }
            RequestTypeSpecific::FindValue(FindValueRequestArguments { key }) => {
                ResponseSpecific::FindValue(FindValueResponseArguments {
                    responder_id,
                    value: self.storage.get(&key, get_dht_time()),
                    nodes: self.routing_table.nearest_neighbors(
                        &key,
                        bucket_size,
                        Some(&requester_id),
                    ),
                })
            }
        };

        self.socket.response(from, transaction_id, response);
    }
}
