#![forbid(unsafe_code)]
//! irgraph-core library.
//!
//! The producer/consumer graph at the heart of a deep-learning compiler IR.
//! Nodes and tensors live outside any graph and may belong to several graphs
//! at once; each graph keeps per-object membership records, a petgraph
//! digraph of `producer → consumer` arcs, and lazily built caches for order,
//! ancestry, path counting and connectivity queries.
//!
//! # Conventions
//!
//! - **Errors**: caller bugs return [`error::GraphError`]; configuration
//!   loading uses `anyhow::Result`.
//! - **Logging**: `tracing` macros (`warn!` for queries on non-members,
//!   `error!` for internal inconsistencies, `debug!`/`trace!` for mutations).
//! - **Threading**: handles are `Rc` and graphs are single-threaded.

pub mod config;
pub mod error;
pub mod graph;
pub mod ir;
pub mod membership;

/// The types most passes need.
pub mod prelude {
    pub use crate::config::{CycleCheckLevel, GraphConfig};
    pub use crate::error::{ErrorCode, GraphError};
    pub use crate::graph::{
        CloneOptions, Graph, PatternMatch, TensorMap, find_cloned_node, same_node,
    };
    pub use crate::ir::{
        Node, NodeId, NodeKind, NodePtr, ParamUsage, Tensor, TensorId, TensorPtr, TensorType,
    };
}
