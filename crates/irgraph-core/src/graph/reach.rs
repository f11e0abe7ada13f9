//! Order-dependent queries: topological order, ancestry, path counts and the
//! connectivity matrix.
//!
//! # Algorithms
//!
//! | Query | Method | Cost |
//! |-------|--------|------|
//! | `topo_sorted_nodes` | petgraph `toposort` | O(V+E) once per mutation |
//! | `is_ancestor` | per-source DFS, resumed until the target is seen | amortised O(V+E) |
//! | `number_of_paths` | reverse DP over the window `[source, target]` | O(V+E), memoised |
//! | `are_connected` | bit lookup when the matrix exists, else path count | O(1) / as above |
//! | `build_connectivity_map` | forward OR-propagation of ancestor rows | O(V·(V+E)/64) |

use std::rc::Rc;

use fixedbitset::FixedBitSet;
use petgraph::algo::toposort;
use petgraph::visit::{Dfs, VisitMap};
use tracing::{debug, error, instrument};

use super::Graph;
use super::cache::{ConnectivityMap, PathKey, TopoOrder};
use crate::config::CycleCheckLevel;
use crate::error::GraphError;
use crate::ir::{Node, NodeId, TensorType};

impl Graph {
    /// Nodes in a topological order, cached until the next mutation.
    ///
    /// A cyclic graph yields an empty order and an error log.
    #[must_use]
    pub fn topo_sorted_nodes(&self) -> Rc<TopoOrder> {
        if let Some(order) = self.caches.topo.borrow().as_ref() {
            return Rc::clone(order);
        }

        let order = match toposort(self.store.digraph(), None) {
            Ok(vertices) => TopoOrder::new(
                vertices
                    .into_iter()
                    .filter_map(|v| self.node_at(v))
                    .collect(),
            ),
            Err(cycle) => {
                let culprit = self.node_at(cycle.node_id());
                if self.config.cycle_check != CycleCheckLevel::Off {
                    let cycles = self.find_cycles();
                    error!(graph = %self.id, ?cycles, "cycle members");
                }
                error!(
                    graph = %self.id,
                    node = ?culprit.map(|n| n.to_string()),
                    "found cycle in graph"
                );
                return Rc::new(TopoOrder::default());
            }
        };

        let order = Rc::new(order);
        *self.caches.topo.borrow_mut() = Some(Rc::clone(&order));
        if self.debug_mode {
            let names: Vec<String> = order.nodes().iter().map(ToString::to_string).collect();
            debug!(graph = %self.id, order = ?names, "topological order rebuilt");
        }
        order
    }

    /// Snapshot the cached topological order.
    pub fn store_topological_sort(&mut self) {
        let current = self.caches.topo.borrow().clone();
        *self.caches.stored_topo.borrow_mut() = current;
    }

    /// Reinstate the snapshot taken by [`Graph::store_topological_sort`].
    /// The snapshot is consumed; keeping it consistent with the graph is the
    /// caller's job.
    pub fn restore_topological_sort(&mut self) {
        let stored = self.caches.stored_topo.borrow_mut().take();
        *self.caches.topo.borrow_mut() = stored;
    }

    /// True if `target` is reachable from `source` (or they are the same
    /// node). False whenever either node is not a member.
    #[must_use]
    pub fn is_ancestor(&self, source: &Node, target: &Node) -> bool {
        let (Some(from), Some(to)) = (self.vertex_of(source), self.vertex_of(target)) else {
            return false;
        };
        if from == to {
            return true;
        }

        let graph = self.store.digraph();
        let mut cache = self.caches.reachability.borrow_mut();
        let search = cache
            .entry(source.id())
            .or_insert_with(|| Dfs::new(graph, from));
        while !search.discovered.is_visited(&to) {
            if search.next(graph).is_none() {
                break;
            }
        }
        search.discovered.is_visited(&to)
    }

    /// Number of distinct node paths from `source` to `target` through
    /// tensors of `tensor_type`. Saturates at `u64::MAX`.
    ///
    /// # Errors
    ///
    /// [`GraphError::NodeNotMember`] if either node is not in this graph.
    pub fn number_of_paths(
        &self,
        source: &Node,
        target: &Node,
        tensor_type: TensorType,
    ) -> Result<u64, GraphError> {
        self.require_query_member(source)?;
        self.require_query_member(target)?;

        let key = PathKey {
            source: source.id(),
            target: target.id(),
            tensor_type,
        };
        if let Some(count) = self.caches.path_counts.borrow().get(&key) {
            return Ok(*count);
        }
        self.count_and_cache(source, target, tensor_type);
        Ok(self
            .caches
            .path_counts
            .borrow()
            .get(&key)
            .copied()
            .unwrap_or(0))
    }

    /// # Errors
    ///
    /// [`GraphError::NodeNotMember`] if either node is not in this graph.
    pub fn are_connected(
        &self,
        source: &Node,
        target: &Node,
        tensor_type: TensorType,
    ) -> Result<bool, GraphError> {
        self.require_query_member(source)?;
        self.require_query_member(target)?;

        let from_matrix = self
            .caches
            .connectivity
            .borrow()
            .as_ref()
            .filter(|m| m.tensor_type == tensor_type)
            .and_then(|m| m.connected(source.id(), target.id()));
        match from_matrix {
            Some(connected) => Ok(connected),
            None => Ok(self.number_of_paths(source, target, tensor_type)? > 0),
        }
    }

    /// Build the ancestor bit-matrix for `tensor_type`, replacing a matrix
    /// built for another type. No-op if one for this type already exists.
    #[instrument(skip(self), fields(graph = %self.id))]
    pub fn build_connectivity_map(&self, tensor_type: TensorType) {
        let built = self
            .caches
            .connectivity
            .borrow()
            .as_ref()
            .is_some_and(|m| m.tensor_type == tensor_type);
        if built {
            return;
        }

        let order = self.topo_sorted_nodes();
        let n = order.len();
        let mut rows: Vec<FixedBitSet> = (0..n)
            .map(|i| {
                let mut row = FixedBitSet::with_capacity(n);
                row.insert(i);
                row
            })
            .collect();

        for (i, node) in order.nodes().iter().enumerate() {
            for producer in self.node_producers(node, tensor_type, true) {
                let Some(p) = order.position(producer.id()) else {
                    continue;
                };
                if p < i {
                    let (done, rest) = rows.split_at_mut(i);
                    rest[0].union_with(&done[p]);
                }
            }
        }

        *self.caches.connectivity.borrow_mut() = Some(ConnectivityMap {
            tensor_type,
            order,
            rows,
        });
    }

    /// The type the cached connectivity matrix was built for, if any.
    #[must_use]
    pub fn connectivity_map_type(&self) -> Option<TensorType> {
        self.caches
            .connectivity
            .borrow()
            .as_ref()
            .map(|m| m.tensor_type)
    }

    /// Reverse sweep from `target` down to `source` over the topological
    /// order: `paths(u) = Σ paths(c)` over consumers `c` of `u`.
    fn count_and_cache(&self, source: &Node, target: &Node, tensor_type: TensorType) {
        let order = self.topo_sorted_nodes();
        let key_for = |node: NodeId| PathKey {
            source: node,
            target: target.id(),
            tensor_type,
        };
        let mut memo = self.caches.path_counts.borrow_mut();

        let (Some(target_pos), Some(source_pos)) =
            (order.position(target.id()), order.position(source.id()))
        else {
            error!(
                graph = %self.id,
                source = %source,
                target = %target,
                "path count without a topological order"
            );
            memo.insert(key_for(source.id()), 0);
            return;
        };
        if source_pos > target_pos {
            memo.insert(key_for(source.id()), 0);
            return;
        }

        memo.insert(key_for(target.id()), 1);
        for node in order.nodes()[source_pos..target_pos].iter().rev() {
            let key = key_for(node.id());
            if memo.contains_key(&key) {
                continue;
            }
            let total = self
                .node_consumers(node, tensor_type, true)
                .iter()
                .filter_map(|c| memo.get(&key_for(c.id())).copied())
                .fold(0_u64, u64::saturating_add);
            memo.insert(key, total);
        }
    }

    fn require_query_member(&self, node: &Node) -> Result<(), GraphError> {
        if self.contains_node(node) {
            Ok(())
        } else {
            Err(GraphError::NodeNotMember {
                graph: self.id,
                node: node.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{NodePtr, Tensor};

    /// `a → b → d`, `a → c → d`, plus `d → e`.
    fn diamond() -> (Graph, Vec<NodePtr>) {
        let t: Vec<_> = (0..6).map(|i| Tensor::new(format!("t{i}"))).collect();
        let a = Node::compute("a", "src", &[&t[0]], &[&t[1]]);
        let b = Node::compute("b", "relu", &[&t[1]], &[&t[2]]);
        let c = Node::compute("c", "neg", &[&t[1]], &[&t[3]]);
        let d = Node::compute("d", "add", &[&t[2], &t[3]], &[&t[4]]);
        let e = Node::compute("e", "relu", &[&t[4]], &[&t[5]]);
        let mut g = Graph::new();
        for n in [&e, &d, &c, &b, &a] {
            g.add_node(n).expect("add");
        }
        (g, vec![a, b, c, d, e])
    }

    /// `count` diamonds joined end to end; returns the join nodes, so there
    /// are `2^k` paths from join 0 to join `k`.
    fn diamond_chain(count: usize) -> (Graph, Vec<NodePtr>) {
        let mut g = Graph::new();
        let mut head = Tensor::new("s0");
        let first = Node::compute("j0", "src", &[], &[&head]);
        g.add_node(&first).expect("add");
        let mut joins = vec![first];
        for k in 1..=count {
            let l = Tensor::new(format!("l{k}"));
            let r = Tensor::new(format!("r{k}"));
            let next = Tensor::new(format!("s{k}"));
            let join = Node::compute(format!("j{k}"), "add", &[&l, &r], &[&next]);
            g.add_node(&Node::compute(format!("left{k}"), "relu", &[&head], &[&l]))
                .expect("add");
            g.add_node(&Node::compute(format!("right{k}"), "neg", &[&head], &[&r]))
                .expect("add");
            g.add_node(&join).expect("add");
            joins.push(join);
            head = next;
        }
        (g, joins)
    }

    #[test]
    fn path_counts_saturate() {
        let (g, joins) = diamond_chain(70);
        assert_eq!(
            g.number_of_paths(&joins[0], &joins[10], TensorType::All),
            Ok(1024)
        );
        assert_eq!(
            g.number_of_paths(&joins[0], &joins[70], TensorType::All),
            Ok(u64::MAX)
        );
        assert_eq!(
            g.are_connected(&joins[0], &joins[70], TensorType::All),
            Ok(true)
        );
    }

    #[test]
    fn topo_order_respects_arcs() {
        let (g, n) = diamond();
        let order = g.topo_sorted_nodes();
        assert_eq!(order.len(), 5);
        let pos = |x: &NodePtr| order.position(x.id()).expect("in order");
        assert!(pos(&n[0]) < pos(&n[1]));
        assert!(pos(&n[2]) < pos(&n[3]));
        assert!(pos(&n[3]) < pos(&n[4]));
    }

    #[test]
    fn ancestry_is_reflexive_and_directed() {
        let (g, n) = diamond();
        assert!(g.is_ancestor(&n[0], &n[0]));
        assert!(g.is_ancestor(&n[0], &n[4]));
        assert!(!g.is_ancestor(&n[4], &n[0]));
        assert!(!g.is_ancestor(&n[1], &n[2]));
        // resumed search for the same source
        assert!(g.is_ancestor(&n[0], &n[3]));
    }

    #[test]
    fn ancestry_of_non_member_is_false() {
        let (g, n) = diamond();
        let stranger = Node::builder("x", "relu").build();
        assert!(!g.is_ancestor(&stranger, &n[0]));
        assert!(!g.is_ancestor(&n[0], &stranger));
    }

    #[test]
    fn path_counts_through_diamond() {
        let (g, n) = diamond();
        assert_eq!(g.number_of_paths(&n[0], &n[4], TensorType::All), Ok(2));
        assert_eq!(g.number_of_paths(&n[0], &n[0], TensorType::All), Ok(1));
        assert_eq!(g.number_of_paths(&n[4], &n[0], TensorType::All), Ok(0));
        assert_eq!(g.number_of_paths(&n[1], &n[2], TensorType::All), Ok(0));
        assert_eq!(g.number_of_paths(&n[1], &n[4], TensorType::All), Ok(1));
        assert_eq!(g.number_of_paths(&n[0], &n[4], TensorType::Control), Ok(0));
    }

    #[test]
    fn path_count_requires_members() {
        let (g, n) = diamond();
        let stranger = Node::builder("x", "relu").build();
        assert!(g.number_of_paths(&stranger, &n[0], TensorType::All).is_err());
        assert!(g.are_connected(&n[0], &stranger, TensorType::All).is_err());
    }

    #[test]
    fn matrix_agrees_with_path_counts() {
        let (g, n) = diamond();
        let before: Vec<bool> = n
            .iter()
            .flat_map(|a| n.iter().map(move |b| (a, b)))
            .map(|(a, b)| g.are_connected(a, b, TensorType::All).expect("members"))
            .collect();

        g.build_connectivity_map(TensorType::All);
        assert_eq!(g.connectivity_map_type(), Some(TensorType::All));
        let after: Vec<bool> = n
            .iter()
            .flat_map(|a| n.iter().map(move |b| (a, b)))
            .map(|(a, b)| g.are_connected(a, b, TensorType::All).expect("members"))
            .collect();
        assert_eq!(before, after);

        g.build_connectivity_map(TensorType::Data);
        assert_eq!(g.connectivity_map_type(), Some(TensorType::Data));
    }

    #[test]
    fn mutation_drops_derived_views() {
        let (mut g, n) = diamond();
        g.build_connectivity_map(TensorType::All);
        assert!(g.is_ancestor(&n[0], &n[4]));
        g.remove_node(&n[3], None).expect("remove");
        assert_eq!(g.connectivity_map_type(), None);
        assert!(!g.is_ancestor(&n[0], &n[4]));
        assert_eq!(g.number_of_paths(&n[0], &n[4], TensorType::All), Ok(0));
    }

    #[test]
    fn cycle_yields_empty_order() {
        let x = Tensor::new("x");
        let y = Tensor::new("y");
        let a = Node::compute("a", "relu", &[&x], &[&y]);
        let b = Node::compute("b", "relu", &[&y], &[&x]);
        let mut g = Graph::new();
        g.add_node(&a).expect("add");
        g.add_node(&b).expect("add");

        assert!(g.topo_sorted_nodes().is_empty());
        assert_eq!(g.number_of_paths(&a, &b, TensorType::All), Ok(0));
        assert!(g.is_ancestor(&a, &b));
    }

    #[test]
    fn stored_order_can_be_restored() {
        let (mut g, n) = diamond();
        let original = g.topo_sorted_nodes();
        g.store_topological_sort();
        g.remove_node(&n[4], None).expect("remove");
        assert_eq!(g.topo_sorted_nodes().len(), 4);

        g.restore_topological_sort();
        let restored = g.topo_sorted_nodes();
        assert!(Rc::ptr_eq(&original, &restored));
    }
}
