//! Debug utilities for inspecting ARG and reached-set structure.
//!
//! This module provides helpers for exploring and validating exploration
//! results. These are primarily useful in tests and during development.

use std::collections::HashSet;
use std::fmt;

use crate::arg::Arg;
use crate::error::{CpaError, Result};
use crate::reached::{ReachedSet, StateSpacePartition};
use crate::types::{ArgId, NodeId};

/// Detailed information about a single ARG state.
#[derive(Debug, Clone)]
pub struct StateInfo {
    pub id: ArgId,
    pub location: NodeId,
    pub partition: StateSpacePartition,
    pub parents: Vec<ArgId>,
    pub children: Vec<ArgId>,
    pub covered_by: Option<ArgId>,
    pub expanded: bool,
    pub target: bool,
    /// Debug rendering of the composite state.
    pub state: String,
}

impl fmt::Display for StateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} parents={:?} children={:?}", self.id, self.location, self.parents, self.children)?;
        if let Some(c) = self.covered_by {
            write!(f, " covered_by={}", c)?;
        }
        if self.target {
            write!(f, " TARGET")?;
        }
        if !self.expanded {
            write!(f, " (unexpanded)")?;
        }
        write!(f, " {}", self.state)
    }
}

/// All states reachable from a root, for debugging.
#[derive(Debug, Clone)]
pub struct ArgTree {
    pub root: ArgId,
    pub states: Vec<StateInfo>,
}

impl fmt::Display for ArgTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ARG (root = {}, size = {}):", self.root, self.states.len())?;
        for state in &self.states {
            writeln!(f, "  {}", state)?;
        }
        Ok(())
    }
}

impl Arg {
    /// Get detailed information about a single live state.
    pub fn state_info(&self, id: ArgId) -> Result<StateInfo> {
        let node = self.node(id)?;
        Ok(StateInfo {
            id,
            location: node.location(),
            partition: node.partition().clone(),
            parents: node.parents().collect(),
            children: node.children().to_vec(),
            covered_by: node.covered_by(),
            expanded: node.was_expanded(),
            target: node.is_target(),
            state: format!("{:?}", node.state()),
        })
    }

    /// All states reachable from `root` through child edges, sorted by ID.
    pub fn debug_tree(&self, root: ArgId) -> Result<ArgTree> {
        let mut states = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let info = self.state_info(id)?;
            stack.extend(info.children.iter().copied());
            states.push(info);
        }
        states.sort_by_key(|s| s.id);
        Ok(ArgTree { root, states })
    }

    /// Verifies the structural invariants of the graph.
    ///
    /// Checks that parent/child links are bidirectional, covered states have
    /// no children, covering links are bidirectional, no live state refers
    /// to a destroyed one, and parent/child edges are acyclic.
    pub fn check_consistency(&self) -> Result<()> {
        let live = |id: ArgId, by: ArgId| -> Result<()> {
            match self.get(id) {
                Some(n) if !n.is_destroyed() => Ok(()),
                Some(_) => Err(CpaError::invariant(format!("{} refers to destroyed {}", by, id))),
                None => Err(CpaError::invariant(format!("{} refers to unknown {}", by, id))),
            }
        };

        for node in self.iter() {
            let id = node.id();
            let mut seen = HashSet::new();
            for c in node.children() {
                live(*c, id)?;
                if !seen.insert(*c) {
                    return Err(CpaError::invariant(format!("{} lists child {} twice", id, c)));
                }
                if !self.node(*c)?.parents().any(|p| p == id) {
                    return Err(CpaError::invariant(format!("{} is a child of {} but not vice versa", c, id)));
                }
            }
            let mut seen = HashSet::new();
            for p in node.parents() {
                live(p, id)?;
                if !seen.insert(p) {
                    return Err(CpaError::invariant(format!("{} lists parent {} twice", id, p)));
                }
                if !self.node(p)?.children().contains(&id) {
                    return Err(CpaError::invariant(format!("{} is a parent of {} but not vice versa", p, id)));
                }
            }
            if let Some(by) = node.covered_by() {
                live(by, id)?;
                if !node.children().is_empty() {
                    return Err(CpaError::invariant(format!("covered state {} has children", id)));
                }
                if !self.node(by)?.covered_by_this().contains(&id) {
                    return Err(CpaError::invariant(format!("{} covers {} but not vice versa", by, id)));
                }
            }
            for c in node.covered_by_this() {
                live(*c, id)?;
                if self.node(*c)?.covered_by() != Some(id) {
                    return Err(CpaError::invariant(format!("{} lists {} as covered but it is not", id, c)));
                }
            }
        }

        for node in self.iter() {
            if node.children().contains(&node.id()) || self.has_cycle_through(node.id()) {
                return Err(CpaError::invariant(format!("cycle through {}", node.id())));
            }
        }
        Ok(())
    }

    fn has_cycle_through(&self, id: ArgId) -> bool {
        let Ok(node) = self.node(id) else {
            return false;
        };
        node.children().iter().any(|&c| self.reaches(c, id))
    }
}

impl ReachedSet {
    /// Verifies the ARG plus the reached-set invariants: waiting states are
    /// reached, reached states are live and uncovered, and the location
    /// index agrees with the entries.
    pub fn check_consistency(&self) -> Result<()> {
        self.arg().check_consistency()?;
        for id in self.waitlist().iter() {
            if !self.contains(id) {
                return Err(CpaError::invariant(format!("waiting state {} is not reached", id)));
            }
        }
        for id in self.ids() {
            let node = self.node(id)?;
            if node.is_covered() {
                return Err(CpaError::invariant(format!("reached state {} is covered", id)));
            }
            if !self.at_location(node.partition(), node.location()).any(|x| x == id) {
                return Err(CpaError::invariant(format!("{} missing from location index", id)));
            }
        }
        Ok(())
    }

    /// Compact multi-line summary of the reached set.
    pub fn dump_state(&self) -> String {
        let mut result = format!(
            "=== Reached set ===\nstates: {}, waiting: {}, ARG allocated: {}\n",
            self.len(),
            self.waitlist_len(),
            self.arg().num_allocated()
        );
        for node in self.nodes() {
            let waiting = if self.waitlist().contains(node.id()) { "*" } else { " " };
            result.push_str(&format!("{} {} @ {} {:?}\n", waiting, node.id(), node.location(), node.state()));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::arg::tests::dummy;
    use crate::types::EdgeId;
    use crate::waitlist::TraversalOrder;

    #[test]
    fn test_state_info() {
        let mut arg = Arg::new();
        let a = dummy(&mut arg, 0);
        let b = dummy(&mut arg, 1);
        arg.add_parent(b, a, EdgeId::new(0)).unwrap();

        let info = arg.state_info(b).unwrap();
        assert_eq!(info.parents, vec![a]);
        assert_eq!(info.location, NodeId::new(1));
        assert!(info.to_string().starts_with("#1@N1"), "{}", info);
    }

    #[test]
    fn test_debug_tree() {
        let mut arg = Arg::new();
        let a = dummy(&mut arg, 0);
        let b = dummy(&mut arg, 1);
        let c = dummy(&mut arg, 2);
        arg.add_parent(b, a, EdgeId::new(0)).unwrap();
        arg.add_parent(c, a, EdgeId::new(1)).unwrap();
        let detached = dummy(&mut arg, 3);

        let tree = arg.debug_tree(a).unwrap();
        assert_eq!(tree.states.iter().map(|s| s.id).collect::<Vec<_>>(), vec![a, b, c]);
        assert!(!tree.to_string().contains(&detached.to_string()));
    }

    #[test]
    fn test_reached_consistency() {
        let mut reached = ReachedSet::new(TraversalOrder::Dfs);
        let a = dummy(reached.arg_mut(), 0);
        reached.add(a).unwrap();
        reached.check_consistency().unwrap();
        assert!(reached.dump_state().contains("* #0 @ N0"));
    }
}
