//! Duplicating graphs: tensor clones with repaired memory links, and node
//! clones rewired onto them.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use tracing::{error, instrument, trace};

use super::Graph;
use crate::error::GraphError;
use crate::ir::{Node, NodePtr, TensorNamePolicy, TensorPtr};

/// Source tensor → clone.
pub type TensorMap = BTreeMap<TensorPtr, TensorPtr>;

/// How [`Graph::clone_tensors`] copies tensor attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CloneOptions {
    pub copy_addresses: bool,
    pub keep_persistent: bool,
    pub keep_names: bool,
}

impl CloneOptions {
    const fn name_policy(self) -> TensorNamePolicy {
        if self.keep_names {
            TensorNamePolicy::Copy
        } else {
            TensorNamePolicy::Fresh
        }
    }
}

impl Graph {
    /// Clone every tensor of this graph.
    ///
    /// Alias links are redirected to the cloned targets; a target outside
    /// the graph is logged as a dangling reference and left unset. Host
    /// aliases and DRAM parents outside the graph are cloned on demand, the
    /// latter along the whole parent chain until it reaches a tensor that
    /// already has a clone.
    #[instrument(skip(self), fields(graph = %self.id))]
    pub fn clone_tensors(&self, options: CloneOptions) -> TensorMap {
        let tensors = self.tensors();
        let mut clones = TensorMap::new();
        for t in &tensors {
            clones.entry(Rc::clone(t)).or_insert_with(|| {
                t.clone_tensor(
                    options.copy_addresses,
                    options.keep_persistent,
                    options.name_policy(),
                )
            });
        }

        for t in &tensors {
            let Some(clone) = clones.get(t).cloned() else {
                continue;
            };

            if let Some(alias) = t.alias_tensor() {
                match clones.get(&alias) {
                    Some(cloned_alias) => {
                        clone.reset_aliasing();
                        clone.set_alias(cloned_alias, t.alias_offset());
                    }
                    None => {
                        error!(
                            graph = %self.id,
                            tensor = %t,
                            alias = %alias,
                            "clone source had a dangling alias"
                        );
                    }
                }
            }

            if let Some(host) = t.host_alias_tensor() {
                let cloned_host = Rc::clone(clones.entry(Rc::clone(&host)).or_insert_with(|| {
                    host.clone_tensor(options.copy_addresses, false, TensorNamePolicy::Fresh)
                }));
                clone.reset_host_aliasing();
                clone.set_host_alias(&cloned_host, t.host_alias_offset());
            }

            if t.has_dram_parent() {
                clone_dram_chain(t, &clone, &mut clones, options.copy_addresses);
            }
        }
        clones
    }

    /// Add a clone of every node of `other`, wired to clones of its tensors.
    /// Returns the tensor map used.
    ///
    /// # Errors
    ///
    /// Only on an internal inconsistency of `other`; no node is added then.
    #[instrument(skip_all, fields(graph = %self.id, source = %other.id))]
    pub fn copy_nodes_and_tensors(&mut self, other: &Self) -> Result<TensorMap, GraphError> {
        let clones = other.clone_tensors(CloneOptions::default());

        let mut cloned_nodes = Vec::with_capacity(other.num_nodes());
        for node in other.nodes() {
            let copy = node.clone_node();
            Self::cloned_tensors_replacer(&node, &copy, &clones)?;
            cloned_nodes.push(copy);
        }
        for copy in &cloned_nodes {
            self.add_node(copy)?;
        }
        trace!(nodes = cloned_nodes.len(), tensors = clones.len(), "graph copied");
        Ok(clones)
    }

    /// Point `copy`'s operands at the clones of `original`'s operands. Each
    /// distinct tensor is replaced once.
    ///
    /// # Errors
    ///
    /// [`GraphError::MissingClonedTensor`] if an operand has no clone.
    pub fn cloned_tensors_replacer(
        original: &Node,
        copy: &Node,
        clones: &TensorMap,
    ) -> Result<(), GraphError> {
        let mut replaced = BTreeSet::new();
        for tensor in original.operands() {
            if !replaced.insert(tensor.id()) {
                continue;
            }
            let Some(clone) = clones.get(&tensor) else {
                error!(node = %original, tensor = %tensor, "cloned tensor map is missing a tensor");
                return Err(GraphError::MissingClonedTensor {
                    node: original.to_string(),
                    tensor: tensor.to_string(),
                });
            };
            copy.replace_tensor(&tensor, clone);
        }
        Ok(())
    }
}

fn clone_dram_chain(
    original: &TensorPtr,
    clone: &TensorPtr,
    clones: &mut TensorMap,
    copy_addresses: bool,
) {
    let mut current = Rc::clone(original);
    let mut current_clone = Rc::clone(clone);
    while let Some(parent) = current.dram_parent() {
        if let Some(cloned_parent) = clones.get(&parent.tensor) {
            current_clone.set_dram_parent(cloned_parent, parent.offset);
            break;
        }
        let cloned_parent = parent
            .tensor
            .clone_tensor(copy_addresses, false, TensorNamePolicy::Fresh);
        clones.insert(Rc::clone(&parent.tensor), Rc::clone(&cloned_parent));
        current_clone.set_dram_parent(&cloned_parent, parent.offset);

        current = parent.tensor;
        current_clone = cloned_parent;
    }
}

/// Identity of the clone of `node` inside a copied graph, looked up through
/// the clone of its first output. `None` for nodes without outputs.
#[must_use]
pub fn find_cloned_node(copy: &Graph, node: &Node, clones: &TensorMap) -> Option<NodePtr> {
    node.output_tensors(crate::ir::TensorType::All)
        .first()
        .and_then(|t| clones.get(t))
        .and_then(|t| copy.tensor_producer(t))
}
