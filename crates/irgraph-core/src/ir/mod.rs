//! The node/tensor content model consumed by the graph engine.

pub mod node;
pub mod tensor;

pub use node::{Node, NodeBuilder, NodeId, NodeKind, NodePtr};
pub use tensor::{DramParent, Tensor, TensorId, TensorNamePolicy, TensorPtr};

/// Selects which port families a query looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TensorType {
    Data,
    Control,
    #[default]
    All,
}

impl TensorType {
    #[must_use]
    pub const fn includes_data(self) -> bool {
        matches!(self, Self::Data | Self::All)
    }

    #[must_use]
    pub const fn includes_control(self) -> bool {
        matches!(self, Self::Control | Self::All)
    }

    pub(crate) const fn pick(self, data: usize, control: usize) -> usize {
        match self {
            Self::Data => data,
            Self::Control => control,
            Self::All => data + control,
        }
    }
}

/// Role a node plays for a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamUsage {
    Producer,
    Consumer,
    Unused,
}

impl ParamUsage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Producer => "producer",
            Self::Consumer => "consumer",
            Self::Unused => "unused",
        }
    }
}
