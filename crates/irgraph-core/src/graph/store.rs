//! Digraph store: vertices, arcs, and the `(tensor, consumer) → arc` index.
//!
//! # Edge Direction
//!
//! Arcs run `producer → consumer`, one per `(tensor, consumer)` pair no matter
//! how many input ports of the consumer read that tensor. Two different
//! tensors between the same pair of nodes give two parallel arcs.

use std::collections::HashMap;

use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};

use crate::ir::{NodePtr, TensorId};

pub(crate) type Digraph = StableDiGraph<NodePtr, TensorId>;

#[derive(Default)]
pub(crate) struct Store {
    digraph: Digraph,
    arcs: HashMap<(TensorId, NodeIndex), EdgeIndex>,
}

impl Store {
    pub(crate) const fn digraph(&self) -> &Digraph {
        &self.digraph
    }

    pub(crate) fn add_vertex(&mut self, node: NodePtr) -> NodeIndex {
        self.digraph.add_node(node)
    }

    /// Drop a vertex together with any arcs still touching it.
    pub(crate) fn remove_vertex(&mut self, vertex: NodeIndex) -> Option<NodePtr> {
        self.arcs.retain(|_, arc| {
            self.digraph
                .edge_endpoints(*arc)
                .is_some_and(|(from, to)| from != vertex && to != vertex)
        });
        self.digraph.remove_node(vertex)
    }

    pub(crate) fn node(&self, vertex: NodeIndex) -> Option<&NodePtr> {
        self.digraph.node_weight(vertex)
    }

    /// Swap the node stored at `vertex`, returning the previous one.
    pub(crate) fn replace_node(&mut self, vertex: NodeIndex, node: NodePtr) -> Option<NodePtr> {
        self.digraph
            .node_weight_mut(vertex)
            .map(|slot| std::mem::replace(slot, node))
    }

    /// Create the arc for `(tensor, consumer)` unless one exists.
    pub(crate) fn connect(
        &mut self,
        tensor: TensorId,
        producer: NodeIndex,
        consumer: NodeIndex,
    ) -> bool {
        if self.arcs.contains_key(&(tensor, consumer)) {
            return false;
        }
        let arc = self.digraph.add_edge(producer, consumer, tensor);
        self.arcs.insert((tensor, consumer), arc);
        true
    }

    /// Remove the arc for `(tensor, consumer)` if present.
    pub(crate) fn disconnect(&mut self, tensor: TensorId, consumer: NodeIndex) -> bool {
        match self.arcs.remove(&(tensor, consumer)) {
            Some(arc) => self.digraph.remove_edge(arc).is_some(),
            None => false,
        }
    }

    pub(crate) fn arc(&self, tensor: TensorId, consumer: NodeIndex) -> Option<EdgeIndex> {
        self.arcs.get(&(tensor, consumer)).copied()
    }

    pub(crate) fn vertex_count(&self) -> usize {
        self.digraph.node_count()
    }

    pub(crate) fn arc_count(&self) -> usize {
        self.digraph.edge_count()
    }

    pub(crate) fn vertices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.digraph.node_indices()
    }

    pub(crate) fn clear(&mut self) {
        self.digraph.clear();
        self.arcs.clear();
    }
}
