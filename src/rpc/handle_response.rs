use std::net::SocketAddrV4;

use tracing::trace;

use crate::common::{Message, MessageType, Node, ResponseSpecific};

use super::{BootstrapState, QueryOutcome, Rpc};

impl Rpc {
    /// Handle an inbound response: record the responder in the routing table,
    /// then hand the response to the operation waiting for it.
    ///
    /// The socket only returns responses to inflight requests, coming from the
    /// address the request was sent to.
    pub(super) fn handle_response(&mut self, from: SocketAddrV4, message: Message) {
        let transaction_id = message.transaction_id;
        let responder_id = message.get_author_id();

        self.routing_table
            .register_request_to(from, Some(responder_id), true);

        let MessageType::Response(response) = message.message_type else {
            return;
        };

        if let BootstrapState::Pinging(bootstrap) = &mut self.bootstrap {
            if bootstrap.response(transaction_id) {
                return;
            }
        }

        if let Some(query_id) = self.pings.remove(&transaction_id) {
            self.done
                .push((query_id, QueryOutcome::Pong(Some(responder_id))));
            return;
        }

        if let Some((query, _)) = self
            .store_queries
            .values_mut()
            .find(|(query, _)| query.inflight(transaction_id))
        {
            let accepted = match response {
                ResponseSpecific::Store(arguments) => arguments.accepted,
                _ => false,
            };

            query.response(transaction_id, accepted);
            return;
        }

        if let Some((query, _)) = self
            .iterative_queries
            .values_mut()
            .find(|(query, _)| query.inflight(transaction_id))
        {
            let (nodes, value) = match response {
                ResponseSpecific::FindNode(arguments) => (arguments.nodes, None),
                ResponseSpecific::FindValue(arguments) => (arguments.nodes, arguments.value),
                _ => (Vec::new(), None),
            };

            query.response(
                &mut self.socket,
                transaction_id,
                Node::new(responder_id, from),
                &nodes,
                value,
            );
            return;
        }

        trace!(?from, transaction_id, "Response to a maintenance ping");
    }
}
