//! Walks that look through logical nodes, graph-boundary queries, and
//! path intersections.
//!
//! Logical nodes (reshape, identity, views) have no physical effect, so a
//! pass asking "who really produces this tensor" wants the nearest compute
//! nodes across any chain of logical ones. Shape tensors carry metadata only
//! and never extend a walk.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::Rc;

use super::Graph;
use crate::ir::{Node, NodePtr, Tensor, TensorPtr, TensorType};

impl Graph {
    /// Nearest non-logical producers of `tensor`.
    #[must_use]
    pub fn real_producers(&self, tensor: &Tensor) -> BTreeSet<NodePtr> {
        self.real_producers_except(tensor, |_| false, false)
    }

    /// Nearest non-logical producers of `tensor`, never stepping onto a node
    /// for which `discard` holds. With `include_graph_edges`, a logical node
    /// reading a graph input is reported too.
    #[must_use]
    pub fn real_producers_except(
        &self,
        tensor: &Tensor,
        discard: impl Fn(&NodePtr) -> bool,
        include_graph_edges: bool,
    ) -> BTreeSet<NodePtr> {
        let mut real = BTreeSet::new();
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::new();

        let Some(first) = self.tensor_producer(tensor) else {
            return real;
        };
        if discard(&first) {
            return real;
        }
        if first.is_logical_operation() {
            visited.insert(Rc::clone(&first));
            queue.push_back(first);
        } else {
            real.insert(first);
        }

        while let Some(logical) = queue.pop_front() {
            for input in logical.input_tensors(TensorType::Data) {
                if input.is_shape_tensor() {
                    continue;
                }
                let Some(producer) = self.tensor_producer(&input) else {
                    continue;
                };
                if discard(&producer) {
                    continue;
                }
                if producer.is_logical_operation() {
                    if visited.insert(Rc::clone(&producer)) {
                        queue.push_back(producer);
                    }
                } else {
                    real.insert(producer);
                }
            }
            if include_graph_edges && self.is_input_node(&logical) {
                real.insert(logical);
            }
        }
        real
    }

    /// Nearest non-logical consumers of `tensor`.
    #[must_use]
    pub fn real_consumers(&self, tensor: &Tensor) -> BTreeSet<NodePtr> {
        self.real_consumers_except(tensor, |_| false, false)
    }

    /// Nearest non-logical consumers of `tensor`, skipping shape operations
    /// and any node for which `discard` holds. With `include_graph_edges`, a
    /// logical node writing a graph output is reported too.
    #[must_use]
    pub fn real_consumers_except(
        &self,
        tensor: &Tensor,
        discard: impl Fn(&NodePtr) -> bool,
        include_graph_edges: bool,
    ) -> BTreeSet<NodePtr> {
        let mut real = BTreeSet::new();
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::new();
        let mut boundary = Vec::new();

        let mut visit = |node: NodePtr, queue: &mut VecDeque<NodePtr>| {
            if discard(&node) || node.is_shape_operation() {
                return;
            }
            if node.is_logical_operation() {
                if visited.insert(Rc::clone(&node)) {
                    queue.push_back(node);
                }
            } else {
                real.insert(node);
            }
        };

        for consumer in self.tensor_consumers(tensor) {
            visit(consumer, &mut queue);
        }
        while let Some(logical) = queue.pop_front() {
            for consumer in self.node_consumers(&logical, TensorType::Data, false) {
                visit(consumer, &mut queue);
            }
            if include_graph_edges && self.is_output_node(&logical) {
                boundary.push(logical);
            }
        }
        real.extend(boundary);
        real
    }

    /// Union of the real producers of `node`'s inputs.
    #[must_use]
    pub fn node_real_producers(&self, node: &Node, tensor_type: TensorType) -> BTreeSet<NodePtr> {
        self.node_real_producers_except(node, tensor_type, |_| false)
    }

    #[must_use]
    pub fn node_real_producers_except(
        &self,
        node: &Node,
        tensor_type: TensorType,
        discard: impl Fn(&NodePtr) -> bool,
    ) -> BTreeSet<NodePtr> {
        node.input_tensors(tensor_type)
            .iter()
            .flat_map(|t| self.real_producers_except(t, &discard, false))
            .collect()
    }

    /// Union of the real consumers of `node`'s outputs.
    #[must_use]
    pub fn node_real_consumers(&self, node: &Node, tensor_type: TensorType) -> BTreeSet<NodePtr> {
        node.output_tensors(tensor_type)
            .iter()
            .flat_map(|t| self.real_consumers(t))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Graph boundary
    // -----------------------------------------------------------------------

    /// A tensor nobody in this graph produces.
    #[must_use]
    pub fn is_input_tensor(&self, tensor: &Tensor) -> bool {
        self.producer_vertex(tensor).is_none()
    }

    /// A tensor with no consumers here, unless masked; always true when
    /// enforced.
    #[must_use]
    pub fn is_output_tensor(&self, tensor: &Tensor) -> bool {
        if tensor.is_masked_output() {
            return false;
        }
        tensor.is_enforced_output() || self.number_of_tensor_consumers(tensor) == 0
    }

    #[must_use]
    pub fn is_input_node(&self, node: &Node) -> bool {
        node.input_tensors(TensorType::Data)
            .iter()
            .any(|t| self.is_input_tensor(t))
    }

    #[must_use]
    pub fn is_output_node(&self, node: &Node) -> bool {
        node.output_tensors(TensorType::Data)
            .iter()
            .any(|t| self.is_output_tensor(t))
    }

    #[must_use]
    pub fn graph_inputs(&self) -> Vec<TensorPtr> {
        self.tensors()
            .into_iter()
            .filter(|t| self.is_input_tensor(t))
            .collect()
    }

    #[must_use]
    pub fn graph_outputs(&self) -> Vec<TensorPtr> {
        self.tensors()
            .into_iter()
            .filter(|t| self.is_output_tensor(t))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Intersections
    // -----------------------------------------------------------------------

    /// Every node lying on a path between two nodes of `nodes` (the input
    /// nodes included). Only the topological window spanned by `nodes` is
    /// scanned. Non-members and cyclic graphs give an empty set.
    #[must_use]
    pub fn intersecting_nodes(&self, nodes: &[NodePtr]) -> BTreeSet<NodePtr> {
        let order = self.topo_sorted_nodes();
        // node id → "also reaches an input node"
        let mut marks: HashMap<_, bool> = nodes.iter().map(|n| (n.id(), true)).collect();

        let positions: Vec<usize> = nodes.iter().filter_map(|n| order.position(n.id())).collect();
        let (Some(&start), Some(&end)) = (positions.iter().min(), positions.iter().max()) else {
            tracing::warn!(graph = %self.id, "intersection query with no member nodes");
            return BTreeSet::new();
        };
        let window = &order.nodes()[start..=end];

        for node in window {
            if marks.contains_key(&node.id()) {
                for consumer in self.node_consumers(node, TensorType::All, true) {
                    marks.entry(consumer.id()).or_insert(false);
                }
            }
        }

        let mut result = BTreeSet::new();
        for node in window.iter().rev() {
            if marks.get(&node.id()) != Some(&true) {
                continue;
            }
            result.insert(Rc::clone(node));
            for producer in self.node_producers(node, TensorType::All, true) {
                if let Some(mark) = marks.get_mut(&producer.id()) {
                    *mark = true;
                }
            }
        }
        result
    }
}
