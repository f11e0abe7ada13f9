//! Stable error codes and the typed errors returned by graph operations.

use std::fmt;

use crate::membership::GraphId;

/// Machine-readable error codes for graph engine failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    NotAMember,
    AlreadyMember,
    ProducerConflict,
    RelationshipMismatch,
    OutputShapeMismatch,
    ConnectivityMismatch,
    PortOutOfRange,
    CycleDetected,
    DanglingReference,
    InvalidPattern,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::NotAMember => "E2001",
            Self::AlreadyMember => "E2002",
            Self::ProducerConflict => "E2003",
            Self::RelationshipMismatch => "E2004",
            Self::OutputShapeMismatch => "E2005",
            Self::ConnectivityMismatch => "E2006",
            Self::PortOutOfRange => "E2007",
            Self::CycleDetected => "E3001",
            Self::DanglingReference => "E3002",
            Self::InvalidPattern => "E4001",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Graph config parse error",
            Self::NotAMember => "Object is not a member of the graph",
            Self::AlreadyMember => "Node is already a member of the graph",
            Self::ProducerConflict => "Tensor already has a producer",
            Self::RelationshipMismatch => "Node is not in the expected role for the tensor",
            Self::OutputShapeMismatch => "Replacement producer has a different output structure",
            Self::ConnectivityMismatch => "Nodes have different connectivity",
            Self::PortOutOfRange => "Port index out of range",
            Self::CycleDetected => "Cycle found in graph",
            Self::DanglingReference => "Tensor references an object outside the graph",
            Self::InvalidPattern => "Pattern graph is malformed",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint for the calling pass.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in .irgraph/config.toml and retry."),
            Self::NotAMember => Some("Add the node to this graph before querying or rewiring it."),
            Self::AlreadyMember => {
                Some("Remove the node first, or clone it for a second insertion.")
            }
            Self::ProducerConflict => {
                Some("Detach the existing producer before registering a new one.")
            }
            Self::RelationshipMismatch => None,
            Self::OutputShapeMismatch => {
                Some("The replacement producer must expose the same output slots.")
            }
            Self::ConnectivityMismatch => {
                Some("Semantic replacement requires identical operand lists.")
            }
            Self::PortOutOfRange => None,
            Self::CycleDetected => Some("Inspect the logged strongly connected components."),
            Self::DanglingReference => Some("Clone the source graph only after repairing aliases."),
            Self::InvalidPattern => Some("Patterns must have exactly one output node."),
            Self::InternalUnexpected => Some("Report a bug with the trace log attached."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Caller-bug conditions reported by graph mutations and strict queries.
///
/// Every check that can produce one of these runs before the graph is
/// touched, so an `Err` leaves the graph exactly as it was.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// The node has no membership entry for this graph.
    #[error("node {node} is not a member of graph {graph}")]
    NodeNotMember { graph: GraphId, node: String },

    /// The tensor has no membership entry for this graph.
    #[error("tensor {tensor} is not a member of graph {graph}")]
    TensorNotMember { graph: GraphId, tensor: String },

    /// The node is already registered in this graph.
    #[error("node {node} is already a member of graph {graph}")]
    AlreadyMember { graph: GraphId, node: String },

    /// A second producer was registered for a tensor.
    #[error("tensor {tensor} already has producer {producer} in graph {graph}")]
    ProducerAlreadyRegistered {
        graph: GraphId,
        tensor: String,
        producer: String,
    },

    /// The node does not hold the implied role for the tensor.
    #[error("node {node} is not a {role} of tensor {tensor}")]
    RelationshipMismatch {
        node: String,
        tensor: String,
        role: &'static str,
    },

    /// Replacement producer output slots differ from the removed node.
    #[error("new producer {replacement} has a different output structure than {removed}")]
    OutputShapeMismatch { removed: String, replacement: String },

    /// Semantic replacement between nodes with different operand lists.
    #[error("unable to replace node {old} with node {new}: different connectivity")]
    ConnectivityMismatch { old: String, new: String },

    /// A port index beyond the node's slot count.
    #[error("{direction} port {index} is out of range for node {node} ({len} ports)")]
    PortOutOfRange {
        node: String,
        direction: &'static str,
        index: usize,
        len: usize,
    },

    /// A clone rewrite found an operand with no cloned counterpart.
    #[error("cloned tensor map has no entry for tensor {tensor} of node {node}")]
    MissingClonedTensor { node: String, tensor: String },

    /// The pattern graph cannot be searched for.
    #[error("invalid pattern graph: {reason}")]
    InvalidPattern { reason: String },
}

impl GraphError {
    /// The stable [`ErrorCode`] for this failure.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NodeNotMember { .. } | Self::TensorNotMember { .. } => ErrorCode::NotAMember,
            Self::AlreadyMember { .. } => ErrorCode::AlreadyMember,
            Self::ProducerAlreadyRegistered { .. } => ErrorCode::ProducerConflict,
            Self::RelationshipMismatch { .. } => ErrorCode::RelationshipMismatch,
            Self::OutputShapeMismatch { .. } => ErrorCode::OutputShapeMismatch,
            Self::ConnectivityMismatch { .. } => ErrorCode::ConnectivityMismatch,
            Self::PortOutOfRange { .. } => ErrorCode::PortOutOfRange,
            Self::MissingClonedTensor { .. } => ErrorCode::DanglingReference,
            Self::InvalidPattern { .. } => ErrorCode::InvalidPattern,
        }
    }
}
