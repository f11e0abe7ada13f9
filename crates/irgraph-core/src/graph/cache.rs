//! Derived views of a graph, built lazily and dropped on every mutation.
//!
//! | View | Built by | Dropped by |
//! |------|----------|------------|
//! | all nodes / all tensors | first `nodes()` / `tensors()` call | never; synced while warm |
//! | topological order | first order-dependent query | any mutation |
//! | reachability | `is_ancestor` per source | any mutation |
//! | path counts | `number_of_paths` | any mutation |
//! | connectivity matrix | `build_connectivity_map` | any mutation, or a build for another type |

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use fixedbitset::FixedBitSet;
use petgraph::stable_graph::NodeIndex;
use petgraph::visit::Dfs;

use crate::ir::{NodeId, NodePtr, TensorPtr, TensorType};

/// A topological order and the position of every node in it.
#[derive(Debug, Default)]
pub struct TopoOrder {
    nodes: Vec<NodePtr>,
    position: HashMap<NodeId, usize>,
}

impl TopoOrder {
    pub(crate) fn new(nodes: Vec<NodePtr>) -> Self {
        let position = nodes.iter().enumerate().map(|(i, n)| (n.id(), i)).collect();
        Self { nodes, position }
    }

    #[must_use]
    pub fn nodes(&self) -> &[NodePtr] {
        &self.nodes
    }

    #[must_use]
    pub fn position(&self, node: NodeId) -> Option<usize> {
        self.position.get(&node).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Key of the path-count memo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PathKey {
    pub(crate) source: NodeId,
    pub(crate) target: NodeId,
    pub(crate) tensor_type: TensorType,
}

/// N×N ancestor matrix over topological positions. Row `i` has bit `j` set
/// iff the node at position `j` reaches the node at position `i`.
#[derive(Debug)]
pub(crate) struct ConnectivityMap {
    pub(crate) tensor_type: TensorType,
    pub(crate) order: Rc<TopoOrder>,
    pub(crate) rows: Vec<FixedBitSet>,
}

impl ConnectivityMap {
    pub(crate) fn connected(&self, source: NodeId, target: NodeId) -> Option<bool> {
        let s = self.order.position(source)?;
        let t = self.order.position(target)?;
        Some(self.rows.get(t).is_some_and(|row| row.contains(s)))
    }
}

#[derive(Default)]
pub(crate) struct Caches {
    pub(crate) all_nodes: RefCell<Option<BTreeSet<NodePtr>>>,
    pub(crate) all_tensors: RefCell<Option<BTreeSet<TensorPtr>>>,
    pub(crate) topo: RefCell<Option<Rc<TopoOrder>>>,
    pub(crate) stored_topo: RefCell<Option<Rc<TopoOrder>>>,
    pub(crate) reachability: RefCell<HashMap<NodeId, Dfs<NodeIndex, FixedBitSet>>>,
    pub(crate) path_counts: RefCell<HashMap<PathKey, u64>>,
    pub(crate) connectivity: RefCell<Option<ConnectivityMap>>,
}

impl Caches {
    /// Drop every structure-derived view. The membership views are left to
    /// the warm-only bookkeeping below.
    pub(crate) fn invalidate(&self) {
        self.topo.borrow_mut().take();
        self.reachability.borrow_mut().clear();
        self.path_counts.borrow_mut().clear();
        self.connectivity.borrow_mut().take();
    }

    pub(crate) fn clear(&self) {
        self.invalidate();
        self.all_nodes.borrow_mut().take();
        self.all_tensors.borrow_mut().take();
        self.stored_topo.borrow_mut().take();
    }

    /// Keep the all-nodes set in sync, but only once someone has built it.
    pub(crate) fn note_node(&self, node: &NodePtr, present: bool) {
        if let Some(set) = self.all_nodes.borrow_mut().as_mut() {
            if present {
                set.insert(Rc::clone(node));
            } else {
                set.remove(node);
            }
        }
    }

    pub(crate) fn note_tensor(&self, tensor: &TensorPtr, present: bool) {
        if let Some(set) = self.all_tensors.borrow_mut().as_mut() {
            if present {
                set.insert(Rc::clone(tensor));
            } else {
                set.remove(tensor);
            }
        }
    }

    pub(crate) fn is_topo_warm(&self) -> bool {
        self.topo.borrow().is_some()
    }
}
