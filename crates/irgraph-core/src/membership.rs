//! Per-graph membership tokens carried by nodes and tensors.
//!
//! A node or tensor does not belong to a graph; a graph only records where the
//! object sits inside it. That record lives on the object itself, in a lazily
//! allocated table keyed by [`GraphId`], so the same `Rc<Node>` can be a
//! member of several graphs at once (duplication, bundling).
//!
//! | Object | Record | Meaning |
//! |--------|--------|---------|
//! | Node   | [`NodeRecord`]   | vertex handle in that graph's store |
//! | Tensor | [`TensorRecord`] | producer vertex + distinct consumer vertices |
//!
//! A missing entry means "not a member of that graph". Only the graph engine
//! writes entries; everything else reads them through the graph API.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use petgraph::stable_graph::NodeIndex;

/// Process-unique identifier of a [`crate::graph::Graph`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GraphId(u64);

impl GraphId {
    /// Wrap a raw id. Graphs allocate their own ids; this exists for tests
    /// and diagnostics.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw numeric id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Structural position of a node inside one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRecord {
    pub(crate) vertex: NodeIndex,
}

/// Structural position of a tensor inside one graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TensorRecord {
    pub(crate) producer: Option<NodeIndex>,
    pub(crate) consumers: BTreeSet<NodeIndex>,
}

impl TensorRecord {
    /// No producer and no consumers: the tensor has left the graph.
    #[must_use]
    pub(crate) fn is_detached(&self) -> bool {
        self.producer.is_none() && self.consumers.is_empty()
    }
}

type TokenTable<R> = Rc<RefCell<BTreeMap<GraphId, R>>>;

/// Lazily allocated, shared table of per-graph records.
pub struct Membership<R> {
    token: RefCell<Option<TokenTable<R>>>,
}

impl<R> Default for Membership<R> {
    fn default() -> Self {
        Self {
            token: RefCell::new(None),
        }
    }
}

impl<R> Membership<R> {
    /// Run `f` against this object's record for `graph`, if any.
    pub(crate) fn with<T>(&self, graph: GraphId, f: impl FnOnce(Option<&R>) -> T) -> T {
        let token = self.token.borrow();
        match token.as_ref() {
            Some(table) => f(table.borrow().get(&graph)),
            None => f(None),
        }
    }

    /// Mutate the record for `graph`, creating the token and a default
    /// record on first use.
    pub(crate) fn update<T>(&self, graph: GraphId, f: impl FnOnce(&mut R) -> T) -> T
    where
        R: Default,
    {
        let table = self.allocate();
        let mut table = table.borrow_mut();
        f(table.entry(graph).or_default())
    }

    /// Mutate the record for `graph` only if one exists.
    pub(crate) fn modify<T>(&self, graph: GraphId, f: impl FnOnce(&mut R) -> T) -> Option<T> {
        let token = self.token.borrow();
        let table = token.as_ref()?;
        let mut table = table.borrow_mut();
        table.get_mut(&graph).map(f)
    }

    /// Replace the record for `graph`.
    pub(crate) fn bind(&self, graph: GraphId, record: R) {
        self.allocate().borrow_mut().insert(graph, record);
    }

    /// Drop the record for `graph`, leaving other graphs' entries intact.
    pub(crate) fn release(&self, graph: GraphId) -> Option<R> {
        let token = self.token.borrow();
        token
            .as_ref()
            .and_then(|table| table.borrow_mut().remove(&graph))
    }

    /// True if this object has a record for `graph`.
    #[must_use]
    pub fn is_member(&self, graph: GraphId) -> bool {
        self.with(graph, |record| record.is_some())
    }

    /// Ids of every graph this object currently belongs to.
    #[must_use]
    pub fn graph_ids(&self) -> Vec<GraphId> {
        self.token
            .borrow()
            .as_ref()
            .map(|table| table.borrow().keys().copied().collect())
            .unwrap_or_default()
    }

    /// True once any graph has ever bound this object.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.token.borrow().is_some()
    }

    fn allocate(&self) -> TokenTable<R> {
        Rc::clone(
            self.token
                .borrow_mut()
                .get_or_insert_with(|| Rc::new(RefCell::new(BTreeMap::new()))),
        )
    }
}

impl<R> fmt::Debug for Membership<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Membership")
            .field("graphs", &self.graph_ids())
            .finish()
    }
}
