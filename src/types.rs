//! Type-safe identifiers for control-flow and exploration entities.
//!
//! This module provides newtype wrappers that enforce compile-time distinction
//! between CFA node IDs, CFA edge IDs, ARG state IDs and loop IDs, preventing
//! the common mistake of indexing one arena with another arena's index.
use std::fmt;

/// A control-flow node (program location).
///
/// Node IDs are dense indices into the owning [`Cfa`][crate::cfa::Cfa].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// Creates a new node ID with the given index.
    pub const fn new(index: u32) -> Self {
        NodeId(index)
    }

    /// Returns the raw index as a `usize`.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the raw index.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

impl From<NodeId> for usize {
    fn from(node: NodeId) -> Self {
        node.index()
    }
}

/// A control-flow edge.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EdgeId(u32);

impl EdgeId {
    pub const fn new(index: u32) -> Self {
        EdgeId(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

/// A state in the Abstract Reachability Graph.
///
/// ARG IDs are allocated chronologically: a smaller ID always denotes an
/// older state. Destroyed states keep their ID; IDs are never reused.
///
/// # Invariants
///
/// - An `ArgId` is only meaningful for the [`Arg`][crate::arg::Arg] that allocated it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ArgId(u32);

impl ArgId {
    pub const fn new(index: u32) -> Self {
        ArgId(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Checks whether this state was created before `other`.
    pub fn is_older_than(self, other: ArgId) -> bool {
        self.0 < other.0
    }
}

impl fmt::Display for ArgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A loop in the CFA loop structure.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LoopId(u32);

impl LoopId {
    pub const fn new(index: u32) -> Self {
        LoopId(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id() {
        let n0 = NodeId::new(0);
        let n1 = NodeId::new(1);
        assert_eq!(n0.index(), 0);
        assert_eq!(usize::from(n1), 1);
        assert!(n0 < n1);
        assert_eq!(n1.to_string(), "N1");
    }

    #[test]
    fn test_arg_id_chronology() {
        let a = ArgId::new(3);
        let b = ArgId::new(7);
        assert!(a.is_older_than(b));
        assert!(!b.is_older_than(a));
        assert!(!a.is_older_than(a));
        assert_eq!(b.to_string(), "#7");
    }

    #[test]
    fn test_display() {
        assert_eq!(EdgeId::new(4).to_string(), "E4");
        assert_eq!(LoopId::new(2).to_string(), "L2");
    }
}
