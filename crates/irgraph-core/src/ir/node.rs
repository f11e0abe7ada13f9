//! Nodes: computation units with ordered tensor ports.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use tracing::warn;

use super::tensor::TensorPtr;
use super::{ParamUsage, TensorType};
use crate::membership::{GraphId, Membership, NodeRecord};

/// Shared handle to a node.
pub type NodePtr = Rc<Node>;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, AtomicOrdering::Relaxed))
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Execution classification of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NodeKind {
    /// Executes on a physical engine.
    #[default]
    Compute,
    /// No physical effect (reshape, identity, view). Transparent to real
    /// producer/consumer traversal.
    Logical,
    /// Computes dynamic-shape metadata only.
    Shape,
}

/// A computation node.
///
/// Data ports are ordered and nullable (an unused optional port is `None`);
/// control ports are plain lists. The graph engine reads ports through the
/// accessors below and rewrites them only via [`Node::replace_tensor`] and
/// [`Node::replace_input`].
pub struct Node {
    id: NodeId,
    name: String,
    guid: String,
    kind: NodeKind,
    inputs: RefCell<Vec<Option<TensorPtr>>>,
    outputs: RefCell<Vec<Option<TensorPtr>>>,
    control_inputs: RefCell<Vec<TensorPtr>>,
    control_outputs: RefCell<Vec<TensorPtr>>,
    pub(crate) membership: Membership<NodeRecord>,
}

impl Node {
    /// Start building a node with the given name and op GUID.
    #[must_use]
    pub fn builder(name: impl Into<String>, guid: impl Into<String>) -> NodeBuilder {
        NodeBuilder {
            name: name.into(),
            guid: guid.into(),
            kind: NodeKind::Compute,
            inputs: Vec::new(),
            outputs: Vec::new(),
            control_inputs: Vec::new(),
            control_outputs: Vec::new(),
        }
    }

    /// Shorthand for a compute node with only non-null data ports.
    #[must_use]
    pub fn compute(
        name: impl Into<String>,
        guid: impl Into<String>,
        inputs: &[&TensorPtr],
        outputs: &[&TensorPtr],
    ) -> NodePtr {
        inputs
            .iter()
            .fold(Self::builder(name, guid), |b, t| b.input(t))
            .outputs(outputs)
            .build()
    }

    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Operation identifier, used by passes and pattern predicates.
    #[must_use]
    pub fn guid(&self) -> &str {
        &self.guid
    }

    #[must_use]
    pub const fn kind(&self) -> NodeKind {
        self.kind
    }

    #[must_use]
    pub const fn is_logical_operation(&self) -> bool {
        matches!(self.kind, NodeKind::Logical)
    }

    #[must_use]
    pub const fn is_shape_operation(&self) -> bool {
        matches!(self.kind, NodeKind::Shape)
    }

    #[must_use]
    pub fn inputs(&self) -> Vec<Option<TensorPtr>> {
        self.inputs.borrow().clone()
    }

    #[must_use]
    pub fn outputs(&self) -> Vec<Option<TensorPtr>> {
        self.outputs.borrow().clone()
    }

    #[must_use]
    pub fn control_inputs(&self) -> Vec<TensorPtr> {
        self.control_inputs.borrow().clone()
    }

    #[must_use]
    pub fn control_outputs(&self) -> Vec<TensorPtr> {
        self.control_outputs.borrow().clone()
    }

    /// Data input at `index`; `None` for an unused slot or out of range.
    #[must_use]
    pub fn input(&self, index: usize) -> Option<TensorPtr> {
        self.inputs.borrow().get(index).cloned().flatten()
    }

    #[must_use]
    pub fn output(&self, index: usize) -> Option<TensorPtr> {
        self.outputs.borrow().get(index).cloned().flatten()
    }

    /// Slot count for the selected port family (nullable slots included).
    #[must_use]
    pub fn num_inputs(&self, tensor_type: TensorType) -> usize {
        let data = self.inputs.borrow().len();
        let control = self.control_inputs.borrow().len();
        tensor_type.pick(data, control)
    }

    #[must_use]
    pub fn num_outputs(&self, tensor_type: TensorType) -> usize {
        let data = self.outputs.borrow().len();
        let control = self.control_outputs.borrow().len();
        tensor_type.pick(data, control)
    }

    /// Non-null input tensors of the selected family, in port order. A
    /// tensor used at several ports appears once per port.
    #[must_use]
    pub fn input_tensors(&self, tensor_type: TensorType) -> Vec<TensorPtr> {
        collect_ports(&self.inputs, &self.control_inputs, tensor_type)
    }

    #[must_use]
    pub fn output_tensors(&self, tensor_type: TensorType) -> Vec<TensorPtr> {
        collect_ports(&self.outputs, &self.control_outputs, tensor_type)
    }

    /// Every non-null tensor the node touches: inputs, outputs, control
    /// inputs, control outputs.
    #[must_use]
    pub fn operands(&self) -> Vec<TensorPtr> {
        let mut all = self.input_tensors(TensorType::Data);
        all.extend(self.output_tensors(TensorType::Data));
        all.extend(self.control_inputs());
        all.extend(self.control_outputs());
        all
    }

    /// Port of `tensor` among the data outputs.
    #[must_use]
    pub fn output_index_of(&self, tensor: &TensorPtr) -> Option<usize> {
        self.outputs
            .borrow()
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|t| Rc::ptr_eq(t, tensor)))
    }

    /// How this node uses `tensor`. Inputs are checked before outputs.
    #[must_use]
    pub fn param_usage(&self, tensor: &TensorPtr) -> ParamUsage {
        let is = |t: &TensorPtr| Rc::ptr_eq(t, tensor);
        if self.inputs.borrow().iter().flatten().any(is)
            || self.control_inputs.borrow().iter().any(is)
        {
            ParamUsage::Consumer
        } else if self.outputs.borrow().iter().flatten().any(is)
            || self.control_outputs.borrow().iter().any(is)
        {
            ParamUsage::Producer
        } else {
            ParamUsage::Unused
        }
    }

    /// Replace every occurrence of `old` with `new` across all port lists.
    ///
    /// Returns `false` (and logs) when `old` is not an operand.
    pub fn replace_tensor(&self, old: &TensorPtr, new: &TensorPtr) -> bool {
        let mut replaced = false;
        for slots in [&self.inputs, &self.outputs] {
            for slot in slots.borrow_mut().iter_mut().flatten() {
                if Rc::ptr_eq(slot, old) {
                    *slot = Rc::clone(new);
                    replaced = true;
                }
            }
        }
        for list in [&self.control_inputs, &self.control_outputs] {
            for t in list.borrow_mut().iter_mut() {
                if Rc::ptr_eq(t, old) {
                    *t = Rc::clone(new);
                    replaced = true;
                }
            }
        }
        if !replaced {
            warn!(node = %self, tensor = %old, "tensor to replace is not an operand of node");
        }
        replaced
    }

    /// Overwrite the data input at `index`. Returns `false` if out of range.
    pub fn replace_input(&self, index: usize, tensor: Option<TensorPtr>) -> bool {
        let mut inputs = self.inputs.borrow_mut();
        match inputs.get_mut(index) {
            Some(slot) => {
                *slot = tensor;
                true
            }
            None => false,
        }
    }

    /// Semantic equality: same GUID, same kind, same port layout, and the same
    /// null/shape pattern in every slot. Identity and names are ignored.
    #[must_use]
    pub fn is_equivalent(&self, other: &Self) -> bool {
        fn slot_signature(slots: &[Option<TensorPtr>]) -> Vec<Option<bool>> {
            slots
                .iter()
                .map(|slot| slot.as_ref().map(|t| t.is_shape_tensor()))
                .collect()
        }

        self.guid == other.guid
            && self.kind == other.kind
            && self.num_inputs(TensorType::Control) == other.num_inputs(TensorType::Control)
            && self.num_outputs(TensorType::Control) == other.num_outputs(TensorType::Control)
            && slot_signature(&self.inputs.borrow()) == slot_signature(&other.inputs.borrow())
            && slot_signature(&self.outputs.borrow()) == slot_signature(&other.outputs.borrow())
    }

    /// Clone into a new node with a fresh id and the same operand references.
    /// The clone belongs to no graph.
    #[must_use]
    pub fn clone_node(&self) -> NodePtr {
        Rc::new(Self {
            id: NodeId::next(),
            name: self.name.clone(),
            guid: self.guid.clone(),
            kind: self.kind,
            inputs: RefCell::new(self.inputs()),
            outputs: RefCell::new(self.outputs()),
            control_inputs: RefCell::new(self.control_inputs()),
            control_outputs: RefCell::new(self.control_outputs()),
            membership: Membership::default(),
        })
    }

    /// Ids of the graphs this node currently belongs to.
    #[must_use]
    pub fn graph_ids(&self) -> Vec<GraphId> {
        self.membership.graph_ids()
    }
}

fn collect_ports(
    data: &RefCell<Vec<Option<TensorPtr>>>,
    control: &RefCell<Vec<TensorPtr>>,
    tensor_type: TensorType,
) -> Vec<TensorPtr> {
    let mut out = Vec::new();
    if tensor_type.includes_data() {
        out.extend(data.borrow().iter().flatten().cloned());
    }
    if tensor_type.includes_control() {
        out.extend(control.borrow().iter().cloned());
    }
    out
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id.0)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = |v: Vec<TensorPtr>| v.iter().map(|t| t.id()).collect::<Vec<_>>();
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("guid", &self.guid)
            .field("kind", &self.kind)
            .field("inputs", &ids(self.input_tensors(TensorType::Data)))
            .field("outputs", &ids(self.output_tensors(TensorType::Data)))
            .field("membership", &self.membership)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// NodeBuilder
// ---------------------------------------------------------------------------

/// Builder returned by [`Node::builder`].
#[derive(Debug, Clone)]
#[must_use]
pub struct NodeBuilder {
    name: String,
    guid: String,
    kind: NodeKind,
    inputs: Vec<Option<TensorPtr>>,
    outputs: Vec<Option<TensorPtr>>,
    control_inputs: Vec<TensorPtr>,
    control_outputs: Vec<TensorPtr>,
}

impl NodeBuilder {
    pub const fn kind(mut self, kind: NodeKind) -> Self {
        self.kind = kind;
        self
    }

    pub const fn logical(self) -> Self {
        self.kind(NodeKind::Logical)
    }

    pub const fn shape_op(self) -> Self {
        self.kind(NodeKind::Shape)
    }

    pub fn input(mut self, tensor: &TensorPtr) -> Self {
        self.inputs.push(Some(Rc::clone(tensor)));
        self
    }

    /// Append a data input slot that may be unused.
    pub fn optional_input(mut self, tensor: Option<&TensorPtr>) -> Self {
        self.inputs.push(tensor.cloned());
        self
    }

    pub fn inputs(self, tensors: &[&TensorPtr]) -> Self {
        tensors.iter().fold(self, |b, t| b.input(t))
    }

    pub fn output(mut self, tensor: &TensorPtr) -> Self {
        self.outputs.push(Some(Rc::clone(tensor)));
        self
    }

    pub fn optional_output(mut self, tensor: Option<&TensorPtr>) -> Self {
        self.outputs.push(tensor.cloned());
        self
    }

    pub fn outputs(self, tensors: &[&TensorPtr]) -> Self {
        tensors.iter().fold(self, |b, t| b.output(t))
    }

    pub fn control_input(mut self, tensor: &TensorPtr) -> Self {
        self.control_inputs.push(Rc::clone(tensor));
        self
    }

    pub fn control_output(mut self, tensor: &TensorPtr) -> Self {
        self.control_outputs.push(Rc::clone(tensor));
        self
    }

    #[must_use]
    pub fn build(self) -> NodePtr {
        Rc::new(Node {
            id: NodeId::next(),
            name: self.name,
            guid: self.guid,
            kind: self.kind,
            inputs: RefCell::new(self.inputs),
            outputs: RefCell::new(self.outputs),
            control_inputs: RefCell::new(self.control_inputs),
            control_outputs: RefCell::new(self.control_outputs),
            membership: Membership::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::tensor::Tensor;

    #[test]
    fn param_usage_classifies_ports() {
        let a = Tensor::new("a");
        let ctl = Tensor::new("ctl");
        let out = Tensor::new("out");
        let other = Tensor::new("other");
        let n = Node::builder("add", "add")
            .input(&a)
            .control_input(&ctl)
            .output(&out)
            .build();

        assert_eq!(n.param_usage(&a), ParamUsage::Consumer);
        assert_eq!(n.param_usage(&ctl), ParamUsage::Consumer);
        assert_eq!(n.param_usage(&out), ParamUsage::Producer);
        assert_eq!(n.param_usage(&other), ParamUsage::Unused);
    }

    #[test]
    fn port_counts_follow_selector() {
        let a = Tensor::new("a");
        let c = Tensor::new("c");
        let n = Node::builder("mm", "gemm")
            .input(&a)
            .optional_input(None)
            .control_input(&c)
            .build();

        assert_eq!(n.num_inputs(TensorType::Data), 2);
        assert_eq!(n.num_inputs(TensorType::Control), 1);
        assert_eq!(n.num_inputs(TensorType::All), 3);
        assert_eq!(n.input_tensors(TensorType::All).len(), 2);
        assert!(n.input(1).is_none());
        assert!(n.input(7).is_none());
    }

    #[test]
    fn replace_tensor_rewrites_every_port() {
        let a = Tensor::new("a");
        let b = Tensor::new("b");
        let out = Tensor::new("out");
        let n = Node::compute("mul", "mul", &[&a, &a], &[&out]);

        assert!(n.replace_tensor(&a, &b));
        assert!(n.input_tensors(TensorType::Data).iter().all(|t| Rc::ptr_eq(t, &b)));
        assert!(!n.replace_tensor(&a, &b), "nothing left to replace");
    }

    #[test]
    fn clone_node_is_equivalent_but_distinct() {
        let a = Tensor::new("a");
        let out = Tensor::new("out");
        let n = Node::builder("view", "reshape")
            .logical()
            .input(&a)
            .output(&out)
            .build();
        let c = n.clone_node();

        assert_ne!(n.id(), c.id());
        assert!(n.is_equivalent(&c));
        assert!(c.is_logical_operation());
        assert_eq!(c.output_index_of(&out), Some(0));
    }

    #[test]
    fn equivalence_checks_guid_and_layout() {
        let a = Tensor::new("a");
        let out = Tensor::new("out");
        let relu = Node::compute("r", "relu", &[&a], &[&out]);
        let gelu = Node::compute("g", "gelu", &[&a], &[&out]);
        let relu2 = Node::builder("r2", "relu")
            .input(&a)
            .optional_input(None)
            .output(&out)
            .build();

        assert!(!relu.is_equivalent(&gelu));
        assert!(!relu.is_equivalent(&relu2));
    }
}
