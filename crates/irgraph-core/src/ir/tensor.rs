//! Tensors: the data-flow values connecting nodes.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crate::membership::{GraphId, Membership, TensorRecord};

/// Shared handle to a tensor. Graphs, nodes and alias links all hold these.
pub type TensorPtr = Rc<Tensor>;

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique tensor identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TensorId(u64);

impl TensorId {
    fn next() -> Self {
        Self(NEXT_TENSOR_ID.fetch_add(1, AtomicOrdering::Relaxed))
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// How a cloned tensor is named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TensorNamePolicy {
    /// Derive a fresh name from the source name and the new id.
    #[default]
    Fresh,
    /// Keep the source name verbatim.
    Copy,
}

/// A tensor that this tensor's memory is carved out of.
#[derive(Debug, Clone)]
pub struct DramParent {
    pub tensor: TensorPtr,
    pub offset: u64,
}

/// A data-flow value.
///
/// Only the relationships the graph engine needs are modelled here: identity,
/// the shape-tensor flag, alias/host-alias/DRAM-parent links, and the
/// graph-boundary flags. Per-graph producer/consumer bookkeeping lives in the
/// membership token.
pub struct Tensor {
    id: TensorId,
    name: RefCell<String>,
    shape_tensor: bool,
    persistent: Cell<bool>,
    address: Cell<Option<u64>>,
    alias: RefCell<Option<(TensorPtr, u64)>>,
    host_alias: RefCell<Option<(TensorPtr, u64)>>,
    dram_parent: RefCell<Option<DramParent>>,
    enforced_output: Cell<bool>,
    masked_output: Cell<bool>,
    pub(crate) membership: Membership<TensorRecord>,
}

impl Tensor {
    /// Create a data tensor.
    #[must_use]
    pub fn new(name: impl Into<String>) -> TensorPtr {
        Rc::new(Self::with_id(TensorId::next(), name.into(), false))
    }

    /// Create a shape tensor. Shape tensors carry dynamic-shape metadata and
    /// never propagate through real producer/consumer traversal.
    #[must_use]
    pub fn shape(name: impl Into<String>) -> TensorPtr {
        Rc::new(Self::with_id(TensorId::next(), name.into(), true))
    }

    fn with_id(id: TensorId, name: String, shape_tensor: bool) -> Self {
        Self {
            id,
            name: RefCell::new(name),
            shape_tensor,
            persistent: Cell::new(false),
            address: Cell::new(None),
            alias: RefCell::new(None),
            host_alias: RefCell::new(None),
            dram_parent: RefCell::new(None),
            enforced_output: Cell::new(false),
            masked_output: Cell::new(false),
            membership: Membership::default(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> TensorId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.borrow_mut() = name.into();
    }

    #[must_use]
    pub const fn is_shape_tensor(&self) -> bool {
        self.shape_tensor
    }

    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.persistent.get()
    }

    pub fn set_persistent(&self, persistent: bool) {
        self.persistent.set(persistent);
    }

    #[must_use]
    pub fn address(&self) -> Option<u64> {
        self.address.get()
    }

    pub fn set_address(&self, address: Option<u64>) {
        self.address.set(address);
    }

    // -----------------------------------------------------------------------
    // Alias links
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn is_aliased(&self) -> bool {
        self.alias.borrow().is_some()
    }

    /// The tensor whose memory this one aliases.
    #[must_use]
    pub fn alias_tensor(&self) -> Option<TensorPtr> {
        self.alias.borrow().as_ref().map(|(t, _)| Rc::clone(t))
    }

    #[must_use]
    pub fn alias_offset(&self) -> u64 {
        self.alias.borrow().as_ref().map_or(0, |(_, offset)| *offset)
    }

    pub fn set_alias(&self, target: &TensorPtr, offset: u64) {
        *self.alias.borrow_mut() = Some((Rc::clone(target), offset));
    }

    pub fn reset_aliasing(&self) {
        *self.alias.borrow_mut() = None;
    }

    #[must_use]
    pub fn is_host_aliased(&self) -> bool {
        self.host_alias.borrow().is_some()
    }

    #[must_use]
    pub fn host_alias_tensor(&self) -> Option<TensorPtr> {
        self.host_alias.borrow().as_ref().map(|(t, _)| Rc::clone(t))
    }

    #[must_use]
    pub fn host_alias_offset(&self) -> u64 {
        self.host_alias.borrow().as_ref().map_or(0, |(_, offset)| *offset)
    }

    pub fn set_host_alias(&self, target: &TensorPtr, offset: u64) {
        *self.host_alias.borrow_mut() = Some((Rc::clone(target), offset));
    }

    pub fn reset_host_aliasing(&self) {
        *self.host_alias.borrow_mut() = None;
    }

    #[must_use]
    pub fn has_dram_parent(&self) -> bool {
        self.dram_parent.borrow().is_some()
    }

    #[must_use]
    pub fn dram_parent(&self) -> Option<DramParent> {
        self.dram_parent.borrow().clone()
    }

    pub fn set_dram_parent(&self, parent: &TensorPtr, offset: u64) {
        *self.dram_parent.borrow_mut() = Some(DramParent {
            tensor: Rc::clone(parent),
            offset,
        });
    }

    // -----------------------------------------------------------------------
    // Graph boundary flags
    // -----------------------------------------------------------------------

    /// Forced to be a graph output even if it has consumers.
    #[must_use]
    pub fn is_enforced_output(&self) -> bool {
        self.enforced_output.get()
    }

    /// Forced to not be a graph output even with no consumers.
    #[must_use]
    pub fn is_masked_output(&self) -> bool {
        self.masked_output.get()
    }

    /// Enforced and masked are mutually exclusive; setting one clears the other.
    pub fn set_enforced_output(&self, enforced: bool) {
        self.enforced_output.set(enforced);
        if enforced {
            self.masked_output.set(false);
        }
    }

    pub fn set_masked_output(&self, masked: bool) {
        self.masked_output.set(masked);
        if masked {
            self.enforced_output.set(false);
        }
    }

    // -----------------------------------------------------------------------
    // Membership and cloning
    // -----------------------------------------------------------------------

    /// Ids of the graphs this tensor is currently attached to.
    #[must_use]
    pub fn graph_ids(&self) -> Vec<GraphId> {
        self.membership.graph_ids()
    }

    /// Clone into a new tensor with a fresh id.
    ///
    /// Alias, host-alias and DRAM-parent links are not carried over: they
    /// point at tensors of the source graph and are repaired by
    /// [`crate::graph::Graph::clone_tensors`]. Graph membership is never
    /// cloned.
    #[must_use]
    pub fn clone_tensor(
        &self,
        copy_address: bool,
        keep_persistent: bool,
        name_policy: TensorNamePolicy,
    ) -> TensorPtr {
        let id = TensorId::next();
        let name = match name_policy {
            TensorNamePolicy::Copy => self.name(),
            TensorNamePolicy::Fresh => format!("{}_{}", self.name(), id.get()),
        };
        let clone = Self::with_id(id, name, self.shape_tensor);
        if copy_address {
            clone.address.set(self.address.get());
        }
        if keep_persistent {
            clone.persistent.set(self.persistent.get());
        }
        clone.enforced_output.set(self.enforced_output.get());
        clone.masked_output.set(self.masked_output.get());
        Rc::new(clone)
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Tensor {}

impl PartialOrd for Tensor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tensor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name.borrow(), self.id.0)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id)
            .field("name", &*self.name.borrow())
            .field("shape_tensor", &self.shape_tensor)
            .field("alias", &self.alias_tensor().map(|t| t.id))
            .field("host_alias", &self.host_alias_tensor().map(|t| t.id))
            .field("dram_parent", &self.dram_parent().map(|p| p.tensor.id))
            .field("membership", &self.membership)
            .finish_non_exhaustive()
    }
}
