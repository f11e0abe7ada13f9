//! Structural edits: nodes in and out, tensor relationships, rewiring.

use std::collections::BTreeSet;
use std::rc::Rc;

use petgraph::stable_graph::NodeIndex;
use tracing::{debug, trace, warn};

use super::Graph;
use crate::config::CycleCheckLevel;
use crate::error::GraphError;
use crate::ir::{Node, NodePtr, ParamUsage, TensorPtr, TensorType};
use crate::membership::NodeRecord;

impl Graph {
    /// Add `node` and register all of its non-null operands.
    ///
    /// # Errors
    ///
    /// - [`GraphError::AlreadyMember`] if the node is already in this graph.
    /// - [`GraphError::ProducerAlreadyRegistered`] if one of its outputs
    ///   already has a producer here, or appears twice among its outputs.
    pub fn add_node(&mut self, node: &NodePtr) -> Result<(), GraphError> {
        if self.contains_node(node) {
            warn!(graph = %self.id, node = %node, "failed to add node: already a member");
            return Err(GraphError::AlreadyMember {
                graph: self.id,
                node: node.to_string(),
            });
        }

        let outputs = node.output_tensors(TensorType::All);
        let mut seen = BTreeSet::new();
        for t in &outputs {
            let existing = self.tensor_producer(t);
            if existing.is_some() || !seen.insert(t.id()) {
                return Err(GraphError::ProducerAlreadyRegistered {
                    graph: self.id,
                    tensor: t.to_string(),
                    producer: existing.map_or_else(|| node.to_string(), |p| p.to_string()),
                });
            }
        }

        let vertex = self.store.add_vertex(Rc::clone(node));
        node.membership.bind(self.id, NodeRecord { vertex });
        for t in node.input_tensors(TensorType::All) {
            self.link_consumer(&t, vertex);
        }
        for t in &outputs {
            self.link_producer(t, vertex);
        }

        self.caches.note_node(node, true);
        self.nodes_by_id.insert(node.id(), Rc::clone(node));
        self.invalidate();
        trace!(graph = %self.id, node = %node, guid = node.guid(), "node added");

        if self.config.cycle_check == CycleCheckLevel::OnEveryEdit {
            let cycles = self.find_cycles();
            if !cycles.is_empty() {
                tracing::error!(
                    graph = %self.id,
                    node = %node,
                    ?cycles,
                    "cycle introduced by node"
                );
            }
        }
        Ok(())
    }

    /// Remove `node`, optionally handing its consumers to `new_producer`.
    ///
    /// With a replacement producer, every distinct consumer of output `i` of
    /// `node` is rewired once to output `i` of `new_producer` (control
    /// outputs likewise).
    ///
    /// # Errors
    ///
    /// - [`GraphError::NodeNotMember`] if `node` is not in this graph.
    /// - [`GraphError::OutputShapeMismatch`] if `new_producer` has a
    ///   different number of outputs or different unused output slots.
    pub fn remove_node(
        &mut self,
        node: &NodePtr,
        new_producer: Option<&NodePtr>,
    ) -> Result<(), GraphError> {
        let vertex = self.require_member(node)?;

        let mut handover: Vec<(TensorPtr, TensorPtr)> = Vec::new();
        if let Some(replacement) = new_producer {
            let mismatch = || GraphError::OutputShapeMismatch {
                removed: node.to_string(),
                replacement: replacement.to_string(),
            };
            let old_data = node.outputs();
            let new_data = replacement.outputs();
            let old_control = node.control_outputs();
            let new_control = replacement.control_outputs();
            if old_data.len() != new_data.len() || old_control.len() != new_control.len() {
                return Err(mismatch());
            }
            for (old, new) in old_data.into_iter().zip(new_data) {
                match (old, new) {
                    (Some(old), Some(new)) => handover.push((old, new)),
                    (None, None) => {}
                    _ => return Err(mismatch()),
                }
            }
            handover.extend(old_control.into_iter().zip(new_control));
        }

        for t in node.input_tensors(TensorType::All) {
            self.unlink_consumer(&t, vertex);
        }
        for t in node.output_tensors(TensorType::All) {
            self.unlink_producer(&t, vertex);
        }

        let mut rewired: BTreeSet<(crate::ir::TensorId, NodeIndex)> = BTreeSet::new();
        for (old, new) in &handover {
            for consumer_vertex in self.consumer_vertices(old) {
                if !rewired.insert((old.id(), consumer_vertex)) {
                    continue;
                }
                let Some(consumer) = self.node_at(consumer_vertex) else {
                    continue;
                };
                self.unlink_consumer(old, consumer_vertex);
                consumer.replace_tensor(old, new);
                self.link_consumer(new, consumer_vertex);
                trace!(
                    graph = %self.id,
                    consumer = %consumer,
                    from = %old,
                    to = %new,
                    "consumer rewired"
                );
            }
        }

        self.store.remove_vertex(vertex);
        node.membership.release(self.id);
        self.caches.note_node(node, false);
        self.nodes_by_id.remove(&node.id());
        self.invalidate();
        trace!(graph = %self.id, node = %node, "node removed");
        Ok(())
    }

    /// Feed output `output_index` of `from` into input `input_index` of `to`,
    /// detaching whatever `to` read there before.
    ///
    /// # Errors
    ///
    /// - [`GraphError::NodeNotMember`] if either node is not in this graph.
    /// - [`GraphError::PortOutOfRange`] for an unknown port or an unused
    ///   output slot.
    pub fn attach_nodes(
        &mut self,
        from: &NodePtr,
        to: &NodePtr,
        output_index: usize,
        input_index: usize,
    ) -> Result<(), GraphError> {
        self.require_member(from)?;
        let to_vertex = self.require_member(to)?;

        let Some(tensor) = from.output(output_index) else {
            return Err(GraphError::PortOutOfRange {
                node: from.to_string(),
                direction: "output",
                index: output_index,
                len: from.num_outputs(TensorType::Data),
            });
        };
        let inputs = to.num_inputs(TensorType::Data);
        if input_index >= inputs {
            return Err(GraphError::PortOutOfRange {
                node: to.to_string(),
                direction: "input",
                index: input_index,
                len: inputs,
            });
        }

        if let Some(old) = to.input(input_index) {
            self.unlink_consumer(&old, to_vertex);
            to.replace_input(input_index, Some(Rc::clone(&tensor)));
            // The same tensor may still feed another port of `to`.
            if to.param_usage(&old) == ParamUsage::Consumer {
                self.link_consumer(&old, to_vertex);
            }
        } else {
            to.replace_input(input_index, Some(Rc::clone(&tensor)));
        }
        self.link_consumer(&tensor, to_vertex);
        self.invalidate();
        trace!(
            graph = %self.id,
            from = %from,
            to = %to,
            output_index,
            input_index,
            "nodes attached"
        );
        Ok(())
    }

    /// True if both nodes have the same port counts and exactly the same
    /// tensors in every port list of the selected family.
    #[must_use]
    pub fn have_same_connectivity(a: &Node, b: &Node, tensor_type: TensorType) -> bool {
        let ptr_eq_slots = |x: &[Option<TensorPtr>], y: &[Option<TensorPtr>]| {
            x.len() == y.len()
                && x.iter().zip(y).all(|(p, q)| match (p, q) {
                    (Some(p), Some(q)) => Rc::ptr_eq(p, q),
                    (None, None) => true,
                    _ => false,
                })
        };
        let ptr_eq_list = |x: &[TensorPtr], y: &[TensorPtr]| {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| Rc::ptr_eq(p, q))
        };

        a.num_inputs(tensor_type) == b.num_inputs(tensor_type)
            && a.num_outputs(tensor_type) == b.num_outputs(tensor_type)
            && (!tensor_type.includes_data()
                || (ptr_eq_slots(&a.inputs(), &b.inputs())
                    && ptr_eq_slots(&a.outputs(), &b.outputs())))
            && (!tensor_type.includes_control()
                || (ptr_eq_list(&a.control_inputs(), &b.control_inputs())
                    && ptr_eq_list(&a.control_outputs(), &b.control_outputs())))
    }

    /// Put `new` at `old`'s vertex. Arcs and tensor records are untouched.
    ///
    /// # Errors
    ///
    /// - [`GraphError::ConnectivityMismatch`] if the operand lists differ.
    /// - [`GraphError::NodeNotMember`] if `old` is not in this graph.
    /// - [`GraphError::AlreadyMember`] if `new` already is.
    pub fn replace_semantic_nodes(
        &mut self,
        old: &NodePtr,
        new: &NodePtr,
    ) -> Result<(), GraphError> {
        if !Self::have_same_connectivity(old, new, TensorType::All) {
            return Err(GraphError::ConnectivityMismatch {
                old: old.to_string(),
                new: new.to_string(),
            });
        }
        let vertex = self.require_member(old)?;
        if self.contains_node(new) {
            return Err(GraphError::AlreadyMember {
                graph: self.id,
                node: new.to_string(),
            });
        }

        old.membership.release(self.id);
        self.nodes_by_id.remove(&old.id());
        self.caches.note_node(old, false);

        new.membership.bind(self.id, NodeRecord { vertex });
        self.nodes_by_id.insert(new.id(), Rc::clone(new));
        self.caches.note_node(new, true);
        self.store.replace_node(vertex, Rc::clone(new));

        self.invalidate();
        trace!(graph = %self.id, old = %old, new = %new, "semantic node replaced");
        Ok(())
    }

    /// Register `node` as producer or consumer of `tensor`. The role is taken
    /// from the node's ports when `usage` is `None`.
    ///
    /// # Errors
    ///
    /// - [`GraphError::NodeNotMember`] if `node` is not in this graph.
    /// - [`GraphError::RelationshipMismatch`] if `tensor` is not in one of
    ///   `node`'s ports for the requested role.
    /// - [`GraphError::ProducerAlreadyRegistered`] for a second producer.
    pub fn add_relationship(
        &mut self,
        tensor: &TensorPtr,
        node: &NodePtr,
        usage: Option<ParamUsage>,
    ) -> Result<(), GraphError> {
        let vertex = self.require_member(node)?;
        let usage = usage.unwrap_or_else(|| node.param_usage(tensor));
        if !holds_port(node, tensor, usage) {
            return Err(GraphError::RelationshipMismatch {
                node: node.to_string(),
                tensor: tensor.to_string(),
                role: usage.as_str(),
            });
        }
        if usage == ParamUsage::Producer {
            if let Some(existing) = self.tensor_producer(tensor) {
                return Err(GraphError::ProducerAlreadyRegistered {
                    graph: self.id,
                    tensor: tensor.to_string(),
                    producer: existing.to_string(),
                });
            }
            self.link_producer(tensor, vertex);
        } else {
            self.link_consumer(tensor, vertex);
        }
        self.invalidate();
        Ok(())
    }

    /// Exact inverse of [`Graph::add_relationship`].
    ///
    /// # Errors
    ///
    /// - [`GraphError::NodeNotMember`] / [`GraphError::TensorNotMember`] for
    ///   objects outside this graph.
    /// - [`GraphError::RelationshipMismatch`] if `node` does not hold the
    ///   implied role for `tensor`.
    pub fn remove_relationship(
        &mut self,
        tensor: &TensorPtr,
        node: &NodePtr,
        usage: Option<ParamUsage>,
    ) -> Result<(), GraphError> {
        let vertex = self.require_member(node)?;
        if !self.contains_tensor(tensor) {
            return Err(GraphError::TensorNotMember {
                graph: self.id,
                tensor: tensor.to_string(),
            });
        }
        let usage = usage.unwrap_or_else(|| node.param_usage(tensor));
        let holds_role = match usage {
            ParamUsage::Producer => self.producer_vertex(tensor) == Some(vertex),
            ParamUsage::Consumer => self.consumer_vertices(tensor).contains(&vertex),
            ParamUsage::Unused => false,
        };
        if !holds_role {
            return Err(GraphError::RelationshipMismatch {
                node: node.to_string(),
                tensor: tensor.to_string(),
                role: usage.as_str(),
            });
        }
        if usage == ParamUsage::Producer {
            self.unlink_producer(tensor, vertex);
        } else {
            self.unlink_consumer(tensor, vertex);
        }
        self.invalidate();
        Ok(())
    }

    /// Remove every node, releasing this graph's token entries.
    pub fn clear(&mut self) {
        self.release_tokens();
        self.store.clear();
        self.nodes_by_id.clear();
        self.caches.clear();
        self.dirty = true;
    }

    // -----------------------------------------------------------------------
    // Internal bookkeeping
    // -----------------------------------------------------------------------

    pub(crate) fn invalidate(&mut self) {
        self.caches.invalidate();
        self.dirty = true;
    }

    fn require_member(&self, node: &Node) -> Result<NodeIndex, GraphError> {
        self.vertex_of(node).ok_or_else(|| GraphError::NodeNotMember {
            graph: self.id,
            node: node.to_string(),
        })
    }

    fn link_consumer(&mut self, tensor: &TensorPtr, vertex: NodeIndex) {
        let producer = tensor.membership.update(self.id, |r| {
            r.consumers.insert(vertex);
            r.producer
        });
        if let Some(producer) = producer {
            self.store.connect(tensor.id(), producer, vertex);
        }
        self.caches.note_tensor(tensor, true);
        if self.debug_mode {
            debug!(graph = %self.id, tensor = %tensor, ?vertex, "consumer registered");
        }
    }

    fn link_producer(&mut self, tensor: &TensorPtr, vertex: NodeIndex) {
        let consumers: Vec<NodeIndex> = tensor.membership.update(self.id, |r| {
            r.producer = Some(vertex);
            r.consumers.iter().copied().collect()
        });
        for consumer in consumers {
            self.store.connect(tensor.id(), vertex, consumer);
        }
        self.caches.note_tensor(tensor, true);
        if self.debug_mode {
            debug!(graph = %self.id, tensor = %tensor, ?vertex, "producer registered");
        }
    }

    fn unlink_consumer(&mut self, tensor: &TensorPtr, vertex: NodeIndex) {
        let detached = tensor.membership.modify(self.id, |r| {
            r.consumers.remove(&vertex);
            r.is_detached()
        });
        self.store.disconnect(tensor.id(), vertex);
        if detached == Some(true) {
            self.forget_tensor(tensor);
        }
        if self.debug_mode {
            debug!(graph = %self.id, tensor = %tensor, ?vertex, "consumer unregistered");
        }
    }

    fn unlink_producer(&mut self, tensor: &TensorPtr, vertex: NodeIndex) {
        let outcome = tensor.membership.modify(self.id, |r| {
            if r.producer == Some(vertex) {
                r.producer = None;
            }
            (r.consumers.iter().copied().collect::<Vec<_>>(), r.is_detached())
        });
        let Some((consumers, detached)) = outcome else {
            return;
        };
        for consumer in consumers {
            self.store.disconnect(tensor.id(), consumer);
        }
        if detached {
            self.forget_tensor(tensor);
        }
        if self.debug_mode {
            debug!(graph = %self.id, tensor = %tensor, ?vertex, "producer unregistered");
        }
    }

    fn forget_tensor(&self, tensor: &TensorPtr) {
        tensor.membership.release(self.id);
        self.caches.note_tensor(tensor, false);
    }
}

/// True if `tensor` sits in one of `node`'s ports of the given role.
fn holds_port(node: &Node, tensor: &TensorPtr, usage: ParamUsage) -> bool {
    let ports = match usage {
        ParamUsage::Producer => node.output_tensors(TensorType::All),
        ParamUsage::Consumer => node.input_tensors(TensorType::All),
        ParamUsage::Unused => return false,
    };
    ports.iter().any(|t| Rc::ptr_eq(t, tensor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::graph::same_node;
    use crate::ir::Tensor;

    fn chain() -> (Graph, Vec<NodePtr>, Vec<TensorPtr>) {
        let t: Vec<TensorPtr> = (0..4).map(|i| Tensor::new(format!("t{i}"))).collect();
        let a = Node::compute("a", "relu", &[&t[0]], &[&t[1]]);
        let b = Node::compute("b", "relu", &[&t[1]], &[&t[2]]);
        let c = Node::compute("c", "relu", &[&t[2]], &[&t[3]]);
        let mut g = Graph::new();
        for n in [&a, &b, &c] {
            g.add_node(n).expect("add");
        }
        (g, vec![a, b, c], t)
    }

    #[test]
    fn re_adding_a_member_fails_without_change() {
        let (mut g, nodes, _) = chain();
        g.set_dirty(false);
        let err = g.add_node(&nodes[0]).expect_err("duplicate add");
        assert_eq!(err.code(), ErrorCode::AlreadyMember);
        assert!(!g.is_dirty());
        assert_eq!(g.num_nodes(), 3);
    }

    #[test]
    fn second_producer_is_rejected_before_mutation() {
        let (mut g, _, t) = chain();
        let rogue = Node::compute("rogue", "const", &[], &[&t[2]]);
        let err = g.add_node(&rogue).expect_err("double producer");
        assert_eq!(err.code(), ErrorCode::ProducerConflict);
        assert!(!g.contains_node(&rogue));
        assert!(rogue.graph_ids().is_empty());
    }

    #[test]
    fn duplicate_output_tensor_is_rejected() {
        let mut g = Graph::new();
        let t = Tensor::new("t");
        let n = Node::builder("split", "split").output(&t).output(&t).build();
        assert!(g.add_node(&n).is_err());
        assert!(g.is_empty());
    }

    #[test]
    fn removal_detaches_and_releases_tokens() {
        let (mut g, nodes, t) = chain();
        g.remove_node(&nodes[1], None).expect("remove");
        assert!(!g.contains_node(&nodes[1]));
        assert!(g.tensor_producer(&t[2]).is_none());
        assert_eq!(g.number_of_tensor_consumers(&t[1]), 0);
        assert!(g.contains_tensor(&t[2]), "still consumed by c");
        assert!(nodes[1].graph_ids().is_empty());
        assert_eq!(g.store.arc_count(), 0);
    }

    #[test]
    fn removing_non_member_is_an_error() {
        let mut g = Graph::new();
        let n = Node::builder("ghost", "relu").build();
        let err = g.remove_node(&n, None).expect_err("not a member");
        assert_eq!(err.code(), ErrorCode::NotAMember);
    }

    #[test]
    fn replacement_producer_must_match_outputs() {
        let (mut g, nodes, t) = chain();
        let wide = Node::builder("wide", "split")
            .output(&Tensor::new("w0"))
            .output(&Tensor::new("w1"))
            .build();
        let err = g.remove_node(&nodes[1], Some(&wide)).expect_err("shape mismatch");
        assert_eq!(err.code(), ErrorCode::OutputShapeMismatch);
        assert!(g.contains_node(&nodes[1]));
        assert!(same_node(g.tensor_producer(&t[2]).as_ref(), Some(&nodes[1])));
    }

    #[test]
    fn attach_nodes_moves_one_input() {
        let (mut g, nodes, t) = chain();
        g.attach_nodes(&nodes[0], &nodes[2], 0, 0).expect("attach");
        assert!(Rc::ptr_eq(&nodes[2].input(0).expect("input"), &t[1]));
        assert_eq!(g.number_of_tensor_consumers(&t[1]), 2);
        assert_eq!(g.number_of_tensor_consumers(&t[2]), 0);
        assert!(g.is_ancestor(&nodes[0], &nodes[2]));
        assert!(!g.is_ancestor(&nodes[1], &nodes[2]));
    }

    #[test]
    fn attach_keeps_tensor_used_at_other_port() {
        let mut g = Graph::new();
        let x = Tensor::new("x");
        let y = Tensor::new("y");
        let src = Node::compute("src", "const", &[], &[&y]);
        let sq = Node::compute("sq", "mul", &[&x, &x], &[&Tensor::new("out")]);
        g.add_node(&src).expect("add");
        g.add_node(&sq).expect("add");

        g.attach_nodes(&src, &sq, 0, 1).expect("attach");
        assert_eq!(g.number_of_tensor_consumers(&x), 1);
        assert_eq!(g.number_of_tensor_consumers(&y), 1);
    }

    #[test]
    fn attach_rejects_bad_ports() {
        let (mut g, nodes, _) = chain();
        let err = g.attach_nodes(&nodes[0], &nodes[2], 3, 0).expect_err("bad output");
        assert_eq!(err.code(), ErrorCode::PortOutOfRange);
        let err = g.attach_nodes(&nodes[0], &nodes[2], 0, 5).expect_err("bad input");
        assert_eq!(err.code(), ErrorCode::PortOutOfRange);
    }

    #[test]
    fn semantic_replacement_keeps_vertex() {
        let (mut g, nodes, t) = chain();
        let twin = Node::compute("b2", "gelu", &[&t[1]], &[&t[2]]);
        g.replace_semantic_nodes(&nodes[1], &twin).expect("replace");

        assert!(!g.contains_node(&nodes[1]));
        assert!(g.contains_node(&twin));
        assert!(same_node(g.tensor_producer(&t[2]).as_ref(), Some(&twin)));
        assert!(g.is_ancestor(&nodes[0], &nodes[2]));
        assert_eq!(g.number_of_paths(&nodes[0], &nodes[2], TensorType::All), Ok(1));
    }

    #[test]
    fn semantic_replacement_requires_same_operands() {
        let (mut g, nodes, t) = chain();
        let other = Node::compute("b2", "relu", &[&t[0]], &[&t[2]]);
        let err = g.replace_semantic_nodes(&nodes[1], &other).expect_err("mismatch");
        assert_eq!(err.code(), ErrorCode::ConnectivityMismatch);
    }

    #[test]
    fn relationship_roles_are_checked() {
        let (mut g, nodes, t) = chain();
        let err = g
            .remove_relationship(&t[1], &nodes[1], Some(ParamUsage::Producer))
            .expect_err("b does not produce t1");
        assert_eq!(err.code(), ErrorCode::RelationshipMismatch);

        g.remove_relationship(&t[1], &nodes[1], None).expect("consumer role");
        assert_eq!(g.number_of_tensor_consumers(&t[1]), 0);
        g.add_relationship(&t[1], &nodes[1], None).expect("re-add");
        assert_eq!(g.number_of_tensor_consumers(&t[1]), 1);

        let stranger = Tensor::new("stranger");
        let err = g.add_relationship(&stranger, &nodes[1], None).expect_err("unused");
        assert_eq!(err.code(), ErrorCode::RelationshipMismatch);
    }

    #[test]
    fn explicit_role_must_match_node_ports() {
        let (mut g, nodes, t) = chain();
        let stranger = Tensor::new("stranger");
        g.set_dirty(false);

        for usage in [ParamUsage::Consumer, ParamUsage::Producer] {
            let err = g
                .add_relationship(&stranger, &nodes[1], Some(usage))
                .expect_err("stranger is not an operand of b");
            assert_eq!(err.code(), ErrorCode::RelationshipMismatch);
        }
        let err = g
            .add_relationship(&t[1], &nodes[1], Some(ParamUsage::Producer))
            .expect_err("b reads t1, it does not write it");
        assert_eq!(err.code(), ErrorCode::RelationshipMismatch);

        assert!(!g.is_dirty());
        assert!(!g.contains_tensor(&stranger));
        assert_eq!(g.number_of_tensor_consumers(&stranger), 0);
        assert!(same_node(g.tensor_producer(&t[1]).as_ref(), Some(&nodes[0])));

        g.remove_node(&nodes[1], None).expect("remove");
        drop(g);
        assert!(stranger.graph_ids().is_empty());
    }

    #[test]
    fn every_mutation_sets_dirty_flag() {
        let (mut g, nodes, _) = chain();
        g.set_dirty(false);
        g.remove_node(&nodes[2], None).expect("remove");
        assert!(g.is_dirty());
        g.set_dirty(false);
        g.clear();
        assert!(g.is_dirty());
        assert!(g.is_empty());
        assert!(nodes[0].graph_ids().is_empty());
    }
}
