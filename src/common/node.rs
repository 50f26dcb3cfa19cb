//! Struct and implementation of the Node entry in the Kademlia routing table
use std::net::SocketAddrV4;

use crate::common::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// A peer as known to this node: the [Id] it reported, and the endpoint it
/// was reached at.
pub struct Node {
    pub id: Id,
    pub address: SocketAddrV4,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddrV4) -> Node {
        Node { id, address }
    }

    /// Creates a node with random Id for testing purposes.
    #[cfg(test)]
    pub fn random() -> Node {
        Node {
            id: Id::random(),
            address: SocketAddrV4::new(0.into(), 0),
        }
    }

    /// Create a node with a unique port, for testing purposes.
    #[cfg(test)]
    pub fn unique(i: usize) -> Node {
        Node {
            id: Id::random(),
            address: SocketAddrV4::new([127, 0, 0, 1].into(), i as u16),
        }
    }

    // === Getters ===

    /// Returns the id of this node
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Returns the address of this node
    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }
}
