use std::net::SocketAddrV4;

use crate::Id;

use super::Rpc;

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: SocketAddrV4,
    routing_table_size: usize,
    stored_values: usize,
    bootstrapped: Option<bool>,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// Local UDP Ipv4 socket address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }
    /// Number of nodes in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }
    /// Number of records in the local store, including expired ones not dropped yet.
    pub fn stored_values(&self) -> usize {
        self.stored_values
    }
    /// `None` while bootstrapping, then whether any initial peer responded.
    pub fn bootstrapped(&self) -> Option<bool> {
        self.bootstrapped
    }
}

impl From<&Rpc> for Info {
    fn from(rpc: &Rpc) -> Self {
        Self {
            id: *rpc.id(),
            local_addr: rpc.local_addr(),
            routing_table_size: rpc.routing_table().size(),
            stored_values: rpc.storage().len(),
            bootstrapped: rpc.bootstrapped(),
        }
    }
}
