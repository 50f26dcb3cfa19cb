use std::vec::IntoIter;

use crate::common::{Id, Node};

#[derive(Debug, Clone)]
/// Nodes sorted by their xor distance to a target, one entry per [Id].
pub struct ClosestNodes {
    target: Id,
    nodes: Vec<Node>,
}

impl ClosestNodes {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            nodes: Vec::with_capacity(200),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // === Public Methods ===

    /// Insert a node at its distance rank, returns false if its [Id] is already known.
    pub fn add(&mut self, node: Node) -> bool {
        let target = self.target;

        // Xor with a fixed target is injective, equal distances mean equal ids.
        match self
            .nodes
            .binary_search_by_key(&node.id.xor(&target), |probe| probe.id.xor(&target))
        {
            Ok(_) => false,
            Err(position) => {
                self.nodes.insert(position, node);
                true
            }
        }
    }

    pub fn contains(&self, id: &Id) -> bool {
        let target = self.target;

        self.nodes
            .binary_search_by_key(&id.xor(&target), |probe| probe.id.xor(&target))
            .is_ok()
    }
}

impl IntoIterator for ClosestNodes {
    type Item = Node;
    type IntoIter = IntoIter<Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestNodes {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}
