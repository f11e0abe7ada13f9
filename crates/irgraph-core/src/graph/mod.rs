//! The graph engine.
//!
//! A [`Graph`] records which node produces and which nodes consume every
//! tensor, keeps a petgraph digraph of `producer → consumer` arcs in sync
//! with that bookkeeping, and answers structural queries from lazily built
//! caches.
//!
//! # Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | `store` | digraph plus `(tensor, consumer) → arc` index |
//! | `cache` | derived views and their invalidation |
//! | `mutate` | add/remove node, relationships, rewiring |
//! | `reach` | topological order, ancestry, path counts, connectivity |
//! | `traverse` | real producer/consumer walks, boundary queries, intersections |
//! | `pattern` | isomorphism and pattern search |
//! | `clone` | tensor/node duplication between graphs |
//! | `cycles` | acyclicity, undirected connectivity, SCC reports |
//!
//! # Errors
//!
//! Operations that can only fail through a caller bug return
//! [`GraphError`](crate::error::GraphError) and validate everything before
//! touching the graph. Speculative queries on objects that are not members
//! return empty results and log a warning.

mod cache;
mod clone;
mod cycles;
mod mutate;
mod pattern;
mod reach;
mod store;
mod traverse;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use petgraph::stable_graph::NodeIndex;
use tracing::{debug, warn};

use crate::config::GraphConfig;
use crate::ir::{Node, NodeId, NodePtr, Tensor, TensorPtr, TensorType};
use crate::membership::GraphId;

pub use cache::TopoOrder;
pub use clone::{CloneOptions, TensorMap, find_cloned_node};
pub use cycles::CycleReport;
pub use pattern::PatternMatch;

use cache::Caches;
use store::Store;

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(0);

/// A directed graph of nodes connected through tensors.
pub struct Graph {
    id: GraphId,
    config: GraphConfig,
    store: Store,
    nodes_by_id: HashMap<NodeId, NodePtr>,
    caches: Caches,
    dirty: bool,
    debug_mode: bool,
    breakpoint_mode: bool,
}

impl Graph {
    /// An empty graph with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(GraphConfig::default())
    }

    /// An empty graph using `config`.
    #[must_use]
    pub fn with_config(config: GraphConfig) -> Self {
        let id = GraphId::from_raw(NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            id,
            debug_mode: config.debug_mode,
            breakpoint_mode: config.breakpoint_mode,
            config,
            store: Store::default(),
            nodes_by_id: HashMap::new(),
            caches: Caches::default(),
            dirty: false,
        }
    }

    #[must_use]
    pub const fn id(&self) -> GraphId {
        self.id
    }

    #[must_use]
    pub const fn config(&self) -> &GraphConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Flags
    // -----------------------------------------------------------------------

    /// True if the graph changed since the flag was last reset.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Set or reset the change flag. Only the pass driver should reset it.
    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    #[must_use]
    pub const fn is_debug_mode(&self) -> bool {
        self.debug_mode
    }

    pub fn set_debug_mode(&mut self, enabled: bool) {
        self.debug_mode = enabled;
    }

    #[must_use]
    pub const fn is_breakpoint_mode(&self) -> bool {
        self.breakpoint_mode
    }

    pub fn set_breakpoint_mode(&mut self, enabled: bool) {
        self.breakpoint_mode = enabled;
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// True iff `node` is a member of this graph.
    #[must_use]
    pub fn contains_node(&self, node: &Node) -> bool {
        self.vertex_of(node).is_some()
    }

    /// True iff `tensor` has a producer or a consumer in this graph.
    #[must_use]
    pub fn contains_tensor(&self, tensor: &Tensor) -> bool {
        tensor.membership.is_member(self.id)
    }

    #[must_use]
    pub fn node_by_id(&self, id: NodeId) -> Option<NodePtr> {
        self.nodes_by_id.get(&id).cloned()
    }

    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.store.vertex_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_nodes() == 0
    }

    /// Every member node, ordered by id.
    #[must_use]
    pub fn nodes(&self) -> Vec<NodePtr> {
        let mut cache = self.caches.all_nodes.borrow_mut();
        let set = cache.get_or_insert_with(|| {
            self.store
                .vertices()
                .filter_map(|v| self.store.node(v).cloned())
                .collect()
        });
        set.iter().cloned().collect()
    }

    /// Every tensor touched by a member node, ordered by id.
    #[must_use]
    pub fn tensors(&self) -> Vec<TensorPtr> {
        let mut cache = self.caches.all_tensors.borrow_mut();
        let set = cache.get_or_insert_with(|| {
            self.store
                .vertices()
                .filter_map(|v| self.store.node(v))
                .flat_map(|n| n.operands())
                .collect::<BTreeSet<_>>()
        });
        set.iter().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Tensor relationships
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn tensor_producer(&self, tensor: &Tensor) -> Option<NodePtr> {
        self.producer_vertex(tensor).and_then(|v| self.node_at(v))
    }

    /// Distinct consumers of `tensor`, ordered by node id.
    #[must_use]
    pub fn tensor_consumers(&self, tensor: &Tensor) -> Vec<NodePtr> {
        let mut consumers: Vec<NodePtr> = self
            .consumer_vertices(tensor)
            .into_iter()
            .filter_map(|v| self.node_at(v))
            .collect();
        consumers.sort_unstable_by_key(|n| n.id());
        consumers
    }

    /// The consumer of `tensor` if it has exactly one.
    #[must_use]
    pub fn tensor_single_consumer(&self, tensor: &Tensor) -> Option<NodePtr> {
        match self.consumer_vertices(tensor).as_slice() {
            [only] => self.node_at(*only),
            _ => None,
        }
    }

    #[must_use]
    pub fn number_of_tensor_producers(&self, tensor: &Tensor) -> usize {
        usize::from(self.producer_vertex(tensor).is_some())
    }

    #[must_use]
    pub fn number_of_tensor_consumers(&self, tensor: &Tensor) -> usize {
        tensor
            .membership
            .with(self.id, |r| r.map_or(0, |r| r.consumers.len()))
    }

    /// True if any data output of `node` has a consumer in this graph.
    #[must_use]
    pub fn has_consumer(&self, node: &Node) -> bool {
        node.output_tensors(TensorType::Data)
            .iter()
            .any(|t| self.number_of_tensor_consumers(t) > 0)
    }

    /// Producers of `node`'s inputs of the given family.
    #[must_use]
    pub fn node_producers(
        &self,
        node: &Node,
        tensor_type: TensorType,
        include_shape_tensors: bool,
    ) -> BTreeSet<NodePtr> {
        if !self.contains_node(node) {
            warn!(graph = %self.id, node = %node, "producers query on a non-member node");
            return BTreeSet::new();
        }
        node.input_tensors(tensor_type)
            .iter()
            .filter(|t| include_shape_tensors || !t.is_shape_tensor())
            .filter_map(|t| self.tensor_producer(t))
            .collect()
    }

    /// Consumers of `node`'s outputs of the given family.
    #[must_use]
    pub fn node_consumers(
        &self,
        node: &Node,
        tensor_type: TensorType,
        include_shape_tensors: bool,
    ) -> BTreeSet<NodePtr> {
        if !self.contains_node(node) {
            warn!(graph = %self.id, node = %node, "consumers query on a non-member node");
            return BTreeSet::new();
        }
        node.output_tensors(tensor_type)
            .iter()
            .filter(|t| include_shape_tensors || !t.is_shape_tensor())
            .flat_map(|t| self.tensor_consumers(t))
            .collect()
    }

    /// Nodes none of whose data inputs has a producer.
    #[must_use]
    pub fn root_nodes(&self) -> Vec<NodePtr> {
        self.nodes()
            .into_iter()
            .filter(|n| {
                n.input_tensors(TensorType::Data)
                    .iter()
                    .all(|t| self.producer_vertex(t).is_none())
            })
            .collect()
    }

    /// Nodes whose data outputs have no consumers.
    #[must_use]
    pub fn final_nodes(&self) -> Vec<NodePtr> {
        self.nodes()
            .into_iter()
            .filter(|n| !self.has_consumer(n))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Dumps
    // -----------------------------------------------------------------------

    /// Log every tensor with its producer and consumers, then every node.
    /// Skipped for cyclic graphs.
    pub fn topo_print(&self) {
        if !tracing::enabled!(tracing::Level::DEBUG) || !self.is_acyclic_graph() {
            return;
        }
        debug!(graph = %self.id, "graph tensors:");
        for t in self.tensors() {
            self.print_tensor_producer_consumers(&t);
        }
        debug!(graph = %self.id, "graph nodes:");
        for n in self.nodes() {
            debug!(node = %n, guid = n.guid(), kind = ?n.kind(), "node");
        }
    }

    pub fn print_tensor_producer_consumers(&self, tensor: &Tensor) {
        let producer = self
            .tensor_producer(tensor)
            .map_or_else(|| "none".to_string(), |p| p.to_string());
        let consumers: Vec<String> = self
            .tensor_consumers(tensor)
            .iter()
            .map(ToString::to_string)
            .collect();
        debug!(tensor = %tensor, %producer, ?consumers, "tensor producer/consumer info");
    }

    // -----------------------------------------------------------------------
    // Internal lookups
    // -----------------------------------------------------------------------

    pub(crate) fn vertex_of(&self, node: &Node) -> Option<NodeIndex> {
        node.membership.with(self.id, |r| r.map(|r| r.vertex))
    }

    pub(crate) fn node_at(&self, vertex: NodeIndex) -> Option<NodePtr> {
        self.store.node(vertex).cloned()
    }

    pub(crate) fn producer_vertex(&self, tensor: &Tensor) -> Option<NodeIndex> {
        tensor.membership.with(self.id, |r| r.and_then(|r| r.producer))
    }

    pub(crate) fn consumer_vertices(&self, tensor: &Tensor) -> Vec<NodeIndex> {
        tensor.membership.with(self.id, |r| {
            r.map(|r| r.consumers.iter().copied().collect())
                .unwrap_or_default()
        })
    }

    /// Drop every token entry this graph owns.
    fn release_tokens(&self) {
        for vertex in self.store.vertices() {
            if let Some(node) = self.store.node(vertex) {
                for tensor in node.operands() {
                    tensor.membership.release(self.id);
                }
                node.membership.release(self.id);
            }
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        self.release_tokens();
    }
}

impl Clone for Graph {
    /// Deep copy under a fresh graph id: every tensor and node is cloned.
    fn clone(&self) -> Self {
        let mut copy = Self::with_config(self.config);
        copy.copy_from(self);
        copy
    }

    /// Clears `self` first and keeps its graph id.
    fn clone_from(&mut self, source: &Self) {
        if self.id == source.id {
            return;
        }
        self.clear();
        self.config = source.config;
        self.copy_from(source);
    }
}

impl PartialEq for Graph {
    fn eq(&self, other: &Self) -> bool {
        self.isomorphic_to(other)
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("nodes", &self.store.vertex_count())
            .field("arcs", &self.store.arc_count())
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl Graph {
    fn copy_from(&mut self, source: &Self) {
        if let Err(err) = self.copy_nodes_and_tensors(source) {
            tracing::error!(
                graph = %self.id,
                source = %source.id,
                code = %err.code(),
                "graph copy failed: {err}"
            );
        }
        self.debug_mode = source.debug_mode;
        self.breakpoint_mode = source.breakpoint_mode;
        self.dirty = source.dirty;
    }
}

/// `Rc::ptr_eq` over optional handles; two `None`s compare equal.
#[must_use]
pub fn same_node(a: Option<&NodePtr>, b: Option<&NodePtr>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Rc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}
