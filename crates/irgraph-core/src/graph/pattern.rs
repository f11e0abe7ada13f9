//! Structural comparison between graphs: isomorphism and pattern search.
//!
//! Both algorithms are greedy. Isomorphism pairs roots first-fit and then
//! pairs consumers first-fit; pattern search walks backwards from a single
//! leaf and never backtracks. Either can miss a match an exhaustive search
//! would find.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use tracing::debug;

use super::Graph;
use crate::error::GraphError;
use crate::ir::{NodePtr, TensorPtr, TensorType};

/// Pattern node → host node.
pub type PatternMatch = BTreeMap<NodePtr, NodePtr>;

impl Graph {
    /// Greedy structural equality starting from the root nodes.
    #[must_use]
    pub fn isomorphic_to(&self, other: &Self) -> bool {
        let mine = self.root_nodes();
        let mut theirs = other.root_nodes();
        if mine.len() != theirs.len() {
            return false;
        }

        for root in &mine {
            let Some(pos) = theirs
                .iter()
                .position(|candidate| self.compare_subgraphs_from_node(root, other, candidate))
            else {
                return false;
            };
            theirs.remove(pos);
        }
        true
    }

    /// True if the subgraph hanging off `mine` here matches the one hanging
    /// off `theirs` in `other`, pairing consumers first-fit.
    #[must_use]
    pub fn compare_subgraphs_from_node(
        &self,
        mine: &NodePtr,
        other: &Self,
        theirs: &NodePtr,
    ) -> bool {
        if !mine.is_equivalent(theirs) {
            return false;
        }

        let my_outputs = mine.outputs();
        let their_outputs = theirs.outputs();
        for (i, output) in my_outputs.iter().enumerate() {
            let my_consumers = output
                .as_ref()
                .map(|t| self.tensor_consumers(t))
                .unwrap_or_default();
            let mut their_consumers = their_outputs
                .get(i)
                .and_then(Option::as_ref)
                .map(|t| other.tensor_consumers(t))
                .unwrap_or_default();

            for consumer in &my_consumers {
                let found = their_consumers.iter().position(|candidate| {
                    consumer.is_equivalent(candidate)
                        && self.compare_subgraphs_from_node(consumer, other, candidate)
                });
                match found {
                    Some(pos) => {
                        their_consumers.remove(pos);
                    }
                    None => return false,
                }
            }
        }
        true
    }

    /// Match `pattern` backwards from `pattern_leaf` against this graph from
    /// `graph_leaf`.
    ///
    /// A pattern input without a producer matches anything. A pattern input
    /// with a producer requires a host producer on the same input port,
    /// feeding it from the same output port, with `match_fn` accepting the
    /// pair. Any mismatch gives an empty match.
    #[must_use]
    pub fn pattern_search(
        &self,
        graph_leaf: &NodePtr,
        pattern: &Self,
        pattern_leaf: &NodePtr,
        match_fn: &dyn Fn(&NodePtr, &NodePtr) -> bool,
    ) -> PatternMatch {
        let mut found = PatternMatch::new();
        found.insert(Rc::clone(pattern_leaf), Rc::clone(graph_leaf));
        let mut pending = vec![(Rc::clone(pattern_leaf), Rc::clone(graph_leaf))];

        while let Some((pattern_node, graph_node)) = pending.pop() {
            for index in 0..pattern_node.num_inputs(TensorType::Data) {
                let pattern_tensor = pattern_node.input(index);
                let Some(pattern_producer) =
                    pattern_tensor.as_ref().and_then(|t| pattern.tensor_producer(t))
                else {
                    continue;
                };
                let graph_tensor = graph_node.input(index);
                let graph_producer = graph_tensor.as_ref().and_then(|t| self.tensor_producer(t));

                let (Some(pattern_tensor), Some(graph_tensor), Some(graph_producer)) =
                    (pattern_tensor, graph_tensor, graph_producer)
                else {
                    return PatternMatch::new();
                };
                if !matching_connectivity(
                    &pattern_producer,
                    &graph_producer,
                    &pattern_tensor,
                    &graph_tensor,
                    match_fn,
                ) {
                    return PatternMatch::new();
                }

                found
                    .entry(Rc::clone(&pattern_producer))
                    .or_insert_with(|| Rc::clone(&graph_producer));
                pending.push((pattern_producer, graph_producer));
            }
        }
        found
    }

    /// Every occurrence of `pattern` in this graph, one map per host leaf.
    ///
    /// # Errors
    ///
    /// [`GraphError::InvalidPattern`] unless all of the pattern's outputs are
    /// produced by one node.
    pub fn find_matches(
        &self,
        pattern: &Self,
        match_fn: impl Fn(&NodePtr, &NodePtr) -> bool,
    ) -> Result<Vec<PatternMatch>, GraphError> {
        let leaf = single_output_node(pattern)?;
        let matches: Vec<PatternMatch> = self
            .nodes()
            .into_iter()
            .filter(|n| match_fn(&leaf, n))
            .map(|n| self.pattern_search(&n, pattern, &leaf, &match_fn))
            .filter(|m| !m.is_empty())
            .collect();
        debug!(graph = %self.id, pattern = %pattern.id, count = matches.len(), "pattern matches");
        Ok(matches)
    }

    /// Host leaves of every occurrence of `pattern`.
    ///
    /// # Errors
    ///
    /// [`GraphError::InvalidPattern`] unless all of the pattern's outputs are
    /// produced by one node.
    pub fn match_pattern_with_single_output_node(
        &self,
        pattern: &Self,
        match_fn: impl Fn(&NodePtr, &NodePtr) -> bool,
    ) -> Result<BTreeSet<NodePtr>, GraphError> {
        let leaf = single_output_node(pattern)?;
        Ok(self
            .nodes()
            .into_iter()
            .filter(|n| match_fn(&leaf, n))
            .filter(|n| !self.pattern_search(n, pattern, &leaf, &match_fn).is_empty())
            .collect())
    }

    /// True if every graph output has the same producer.
    #[must_use]
    pub fn is_single_producer_for_all_outputs(&self) -> bool {
        single_output_node(self).is_ok()
    }
}

fn matching_connectivity(
    pattern_node: &NodePtr,
    graph_node: &NodePtr,
    pattern_tensor: &TensorPtr,
    graph_tensor: &TensorPtr,
    match_fn: &dyn Fn(&NodePtr, &NodePtr) -> bool,
) -> bool {
    pattern_node.output_index_of(pattern_tensor) == graph_node.output_index_of(graph_tensor)
        && match_fn(pattern_node, graph_node)
}

fn single_output_node(pattern: &Graph) -> Result<NodePtr, GraphError> {
    let outputs = pattern.graph_outputs();
    let mut leaf: Option<NodePtr> = None;
    for output in &outputs {
        let Some(producer) = pattern.tensor_producer(output) else {
            return Err(GraphError::InvalidPattern {
                reason: format!("output {output} has no producer"),
            });
        };
        match &leaf {
            None => leaf = Some(producer),
            Some(existing) if Rc::ptr_eq(existing, &producer) => {}
            Some(existing) => {
                return Err(GraphError::InvalidPattern {
                    reason: format!("outputs produced by both {existing} and {producer}"),
                });
            }
        }
    }
    leaf.ok_or_else(|| GraphError::InvalidPattern {
        reason: "pattern has no outputs".to_string(),
    })
}
