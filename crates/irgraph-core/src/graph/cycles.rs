//! Whole-graph structural checks and cycle reporting.
//!
//! Acyclicity is a precondition of the order-dependent queries but is never
//! enforced on edits; these helpers exist to diagnose a graph that broke it.

use std::collections::HashSet;

use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::stable_graph::NodeIndex;
use petgraph::unionfind::UnionFind;
use petgraph::visit::{EdgeRef, IntoEdgeReferences, NodeIndexable};
use petgraph::Direction;
use tracing::error;

use super::Graph;
use super::store::Digraph;
use crate::ir::TensorType;

/// One strongly connected component with more than one node, or a node
/// feeding itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Display names of the member nodes, ordered by node id.
    pub members: Vec<String>,
    /// `(producer, consumer)` arcs whose removal makes the component acyclic.
    pub suggested_breaks: Vec<(String, String)>,
}

impl Graph {
    #[must_use]
    pub fn is_acyclic_graph(&self) -> bool {
        !is_cyclic_directed(self.store.digraph())
    }

    /// True if the graph is connected when arc direction is ignored. An empty
    /// graph counts as connected.
    #[must_use]
    pub fn is_connected_graph(&self) -> bool {
        let graph = self.store.digraph();
        let mut sets = UnionFind::<usize>::new(graph.node_bound());
        for arc in graph.edge_references() {
            sets.union(arc.source().index(), arc.target().index());
        }
        let mut roots = self.store.vertices().map(|v| sets.find(v.index()));
        roots
            .next()
            .is_none_or(|first| roots.all(|root| root == first))
    }

    /// Every arc is the indexed arc of one of its consumer's input tensors.
    #[must_use]
    pub fn validate_connections(&self) -> bool {
        let graph = self.store.digraph();
        for arc in graph.edge_references() {
            let Some(consumer) = self.node_at(arc.target()) else {
                continue;
            };
            let indexed = consumer
                .input_tensors(TensorType::All)
                .iter()
                .any(|t| self.store.arc(t.id(), arc.target()) == Some(arc.id()));
            if !indexed {
                let producer = self
                    .node_at(arc.source())
                    .map_or_else(|| "null".to_string(), |p| p.to_string());
                error!(
                    graph = %self.id,
                    %producer,
                    consumer = %consumer,
                    "node is the target of an arc missing from the arc index"
                );
                return false;
            }
        }
        true
    }

    /// Every cycle currently present, ordered by member names.
    #[must_use]
    pub fn find_cycles(&self) -> Vec<CycleReport> {
        let graph = self.store.digraph();
        let mut reports: Vec<CycleReport> = tarjan_scc(graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .is_some_and(|&v| graph.find_edge(v, v).is_some())
            })
            .map(|mut component| {
                component.sort_unstable_by_key(|&v| self.node_at(v).map(|n| n.id()));
                let members = component.iter().map(|&v| self.vertex_name(v)).collect();
                let suggested_breaks = self.back_edges(graph, &component);
                CycleReport {
                    members,
                    suggested_breaks,
                }
            })
            .collect();
        reports.sort_unstable_by(|a, b| a.members.cmp(&b.members));
        reports
    }

    /// Iterative DFS restricted to one component; arcs to a vertex on the
    /// current DFS path are back edges.
    fn back_edges(&self, graph: &Digraph, component: &[NodeIndex]) -> Vec<(String, String)> {
        let members: HashSet<NodeIndex> = component.iter().copied().collect();
        let successors = |v: NodeIndex| -> Vec<NodeIndex> {
            let mut next: Vec<NodeIndex> = graph
                .neighbors_directed(v, Direction::Outgoing)
                .filter(|n| members.contains(n))
                .collect();
            next.sort_unstable();
            next.dedup();
            next
        };

        let mut visited = HashSet::new();
        let mut on_path = HashSet::new();
        let mut breaks = Vec::new();

        for &start in component {
            if !visited.insert(start) {
                continue;
            }
            on_path.insert(start);
            let mut stack = vec![(start, successors(start), 0_usize)];
            while let Some((current, next, cursor)) = stack.last_mut() {
                if let Some(&neighbor) = next.get(*cursor) {
                    *cursor += 1;
                    if on_path.contains(&neighbor) {
                        breaks.push((self.vertex_name(*current), self.vertex_name(neighbor)));
                    } else if visited.insert(neighbor) {
                        on_path.insert(neighbor);
                        stack.push((neighbor, successors(neighbor), 0));
                    }
                } else {
                    on_path.remove(current);
                    stack.pop();
                }
            }
        }
        breaks
    }

    fn vertex_name(&self, vertex: NodeIndex) -> String {
        self.node_at(vertex)
            .map_or_else(|| format!("#{}", vertex.index()), |n| n.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Node, Tensor};

    #[test]
    fn chain_is_acyclic_and_connected() {
        let x = Tensor::new("x");
        let y = Tensor::new("y");
        let z = Tensor::new("z");
        let mut g = Graph::new();
        g.add_node(&Node::compute("a", "relu", &[&x], &[&y])).expect("add");
        g.add_node(&Node::compute("b", "relu", &[&y], &[&z])).expect("add");

        assert!(g.is_acyclic_graph());
        assert!(g.is_connected_graph());
        assert!(g.validate_connections());
        assert!(g.find_cycles().is_empty());
    }

    #[test]
    fn disjoint_islands_are_not_connected() {
        let mut g = Graph::new();
        assert!(g.is_connected_graph());
        g.add_node(&Node::compute("a", "relu", &[&Tensor::new("x")], &[&Tensor::new("y")]))
            .expect("add");
        g.add_node(&Node::compute("b", "relu", &[&Tensor::new("u")], &[&Tensor::new("v")]))
            .expect("add");
        assert!(!g.is_connected_graph());
    }

    #[test]
    fn two_node_cycle_is_reported_with_break() {
        let x = Tensor::new("x");
        let y = Tensor::new("y");
        let a = Node::compute("a", "relu", &[&x], &[&y]);
        let b = Node::compute("b", "relu", &[&y], &[&x]);
        let mut g = Graph::new();
        g.add_node(&a).expect("add");
        g.add_node(&b).expect("add");

        assert!(!g.is_acyclic_graph());
        let cycles = g.find_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].members, vec![a.to_string(), b.to_string()]);
        assert_eq!(cycles[0].suggested_breaks.len(), 1);
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let t = Tensor::new("state");
        let n = Node::compute("acc", "accumulate", &[&t], &[&t]);
        let mut g = Graph::new();
        g.add_node(&n).expect("add");
        let cycles = g.find_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].suggested_breaks, vec![(n.to_string(), n.to_string())]);
    }
}
