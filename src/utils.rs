//! Small shared helpers.

use std::fmt::{self, Display};

use crate::node::Node;

/// Simplified node type to make logging cleaner.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NodeKind {
    /// The empty node.
    Empty,
    /// A branch node.
    Branch,
    /// An extension node.
    Extension,
    /// An account leaf.
    Account,
    /// A storage value leaf.
    Value,
}

impl From<&Node> for NodeKind {
    fn from(node: &Node) -> Self {
        match node {
            Node::Empty => Self::Empty,
            Node::Branch(_) => Self::Branch,
            Node::Extension(_) => Self::Extension,
            Node::Account(_) => Self::Account,
            Node::Value(_) => Self::Value,
        }
    }
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeKind::Empty => "Empty",
            NodeKind::Branch => "Branch",
            NodeKind::Extension => "Extension",
            NodeKind::Account => "Account",
            NodeKind::Value => "Value",
        };

        write!(f, "{}", s)
    }
}
