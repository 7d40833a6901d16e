//! Abstract Reachability Graph.
//!
//! The ARG records exploration history: which state was computed from which
//! along which CFA edge, and which states are covered by others. It is an
//! arena of [`ArgNode`]s addressed by [`ArgId`]; all relations are stored as
//! index lists on both ends.
//!
//! # Invariants
//!
//! - `c ∈ p.children ⇔ p ∈ c.parents`, after every operation.
//! - A covered state has no children.
//! - Parent/child edges form a DAG; cycles only arise through covering.
//! - Destroyed states are referenced by no live state.
//!
//! Operations that would break an invariant fail with
//! [`CpaError::InvariantViolation`] and leave the graph unchanged.

use std::collections::{HashMap, HashSet};

use log::trace;
use num_bigint::BigUint;

use crate::composite::{CompositePrecision, CompositeState};
use crate::error::{CpaError, Result};
use crate::reached::StateSpacePartition;
use crate::types::{ArgId, EdgeId, NodeId};

/// A state in the ARG.
#[derive(Debug, Clone)]
pub struct ArgNode {
    id: ArgId,
    state: CompositeState,
    precision: CompositePrecision,
    partition: StateSpacePartition,
    parents: Vec<(ArgId, EdgeId)>,
    children: Vec<ArgId>,
    covered_by: Option<ArgId>,
    covering: Vec<ArgId>,
    merged_with: Option<ArgId>,
    destroyed: bool,
    expanded: bool,
    target: bool,
}

impl ArgNode {
    pub fn id(&self) -> ArgId {
        self.id
    }

    pub fn state(&self) -> &CompositeState {
        &self.state
    }

    pub fn precision(&self) -> &CompositePrecision {
        &self.precision
    }

    pub fn partition(&self) -> &StateSpacePartition {
        &self.partition
    }

    pub fn location(&self) -> NodeId {
        self.state.location()
    }

    /// Parents in insertion order, each with the edge leading to this state.
    pub fn parent_edges(&self) -> &[(ArgId, EdgeId)] {
        &self.parents
    }

    pub fn parents(&self) -> impl Iterator<Item = ArgId> + '_ {
        self.parents.iter().map(|&(p, _)| p)
    }

    pub fn children(&self) -> &[ArgId] {
        &self.children
    }

    pub fn covered_by(&self) -> Option<ArgId> {
        self.covered_by
    }

    pub fn is_covered(&self) -> bool {
        self.covered_by.is_some()
    }

    /// States covered by this one.
    pub fn covered_by_this(&self) -> &[ArgId] {
        &self.covering
    }

    /// The state this one was merged into, if it was removed by a merge.
    pub fn merged_with(&self) -> Option<ArgId> {
        self.merged_with
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn was_expanded(&self) -> bool {
        self.expanded
    }

    pub fn is_target(&self) -> bool {
        self.target
    }

    /// The CFA edge from `parent` to this state.
    pub fn edge_from(&self, parent: ArgId) -> Option<EdgeId> {
        self.parents.iter().find(|&&(p, _)| p == parent).map(|&(_, e)| e)
    }
}

/// A root-to-target path: `edges[i]` leads from `states[i]` to `states[i + 1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgPath {
    pub states: Vec<ArgId>,
    pub edges: Vec<EdgeId>,
}

impl ArgPath {
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn first(&self) -> Option<ArgId> {
        self.states.first().copied()
    }

    pub fn last(&self) -> Option<ArgId> {
        self.states.last().copied()
    }

    /// `(state, edge to next state)` pairs; the last state has no edge.
    pub fn steps(&self) -> impl Iterator<Item = (ArgId, Option<EdgeId>)> + '_ {
        self.states
            .iter()
            .enumerate()
            .map(|(i, &s)| (s, self.edges.get(i).copied()))
    }
}

/// What [`Arg::remove_subtree`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubtreeRemoval {
    /// Destroyed states, root first.
    pub removed: Vec<ArgId>,
    /// Live parents of the subtree root.
    pub parents: Vec<ArgId>,
    /// Live states that were covered by a removed state and are now uncovered.
    pub uncovered: Vec<ArgId>,
}

#[derive(Debug, Clone, Default)]
pub struct Arg {
    nodes: Vec<ArgNode>,
}

impl Arg {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of states ever created, destroyed ones included.
    pub fn num_allocated(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_live(&self) -> usize {
        self.nodes.iter().filter(|n| !n.destroyed).count()
    }

    /// Any state, live or destroyed.
    pub fn get(&self, id: ArgId) -> Option<&ArgNode> {
        self.nodes.get(id.index())
    }

    /// A live state.
    pub fn node(&self, id: ArgId) -> Result<&ArgNode> {
        let node = self.nodes.get(id.index()).ok_or(CpaError::UnknownState(id))?;
        if node.destroyed {
            return Err(CpaError::DestroyedState(id));
        }
        Ok(node)
    }

    fn node_mut(&mut self, id: ArgId) -> Result<&mut ArgNode> {
        let node = self.nodes.get_mut(id.index()).ok_or(CpaError::UnknownState(id))?;
        if node.destroyed {
            return Err(CpaError::DestroyedState(id));
        }
        Ok(node)
    }

    fn at(&mut self, id: ArgId) -> &mut ArgNode {
        &mut self.nodes[id.index()]
    }

    /// Live states in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &ArgNode> {
        self.nodes.iter().filter(|n| !n.destroyed)
    }

    /// Live states without parents.
    pub fn roots(&self) -> impl Iterator<Item = ArgId> + '_ {
        self.iter().filter(|n| n.parents.is_empty()).map(|n| n.id)
    }

    /// Creates a detached state.
    pub fn create(
        &mut self,
        state: CompositeState,
        precision: CompositePrecision,
        partition: StateSpacePartition,
        target: bool,
    ) -> ArgId {
        let id = ArgId::new(self.nodes.len() as u32);
        self.nodes.push(ArgNode {
            id,
            state,
            precision,
            partition,
            parents: Vec::new(),
            children: Vec::new(),
            covered_by: None,
            covering: Vec::new(),
            merged_with: None,
            destroyed: false,
            expanded: false,
            target,
        });
        id
    }

    /// Whether `to` is reachable from `from` along child edges (or equal).
    pub fn reaches(&self, from: ArgId, to: ArgId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(id.index()) {
                stack.extend(node.children.iter().copied());
            }
        }
        false
    }

    /// Links `parent -> child` along `edge`. Adding an existing parent is a no-op.
    pub fn add_parent(&mut self, child: ArgId, parent: ArgId, edge: EdgeId) -> Result<()> {
        let child_node = self.node(child)?;
        self.node(parent)?;
        if child_node.parents.iter().any(|&(p, _)| p == parent) {
            return Ok(());
        }
        if !child_node.children.is_empty() && self.reaches(child, parent) {
            return Err(CpaError::invariant(format!(
                "linking {} -> {} would create a cycle",
                parent, child
            )));
        }
        if child == parent {
            return Err(CpaError::invariant(format!("{} cannot be its own parent", child)));
        }
        self.at(child).parents.push((parent, edge));
        self.at(parent).children.push(child);
        Ok(())
    }

    pub fn mark_expanded(&mut self, id: ArgId) -> Result<()> {
        self.node_mut(id)?.expanded = true;
        Ok(())
    }

    pub fn set_target(&mut self, id: ArgId, target: bool) -> Result<()> {
        self.node_mut(id)?.target = target;
        Ok(())
    }

    /// Marks `coveree` as covered by `coverer`.
    pub fn set_covered(&mut self, coveree: ArgId, coverer: ArgId) -> Result<()> {
        let node = self.node(coveree)?;
        let by = self.node(coverer)?;
        if coveree == coverer {
            return Err(CpaError::invariant(format!("{} cannot cover itself", coveree)));
        }
        if !node.children.is_empty() {
            return Err(CpaError::invariant(format!(
                "cannot cover {} which has {} children",
                coveree,
                node.children.len()
            )));
        }
        if let Some(other) = node.covered_by {
            return Err(CpaError::invariant(format!("{} is already covered by {}", coveree, other)));
        }
        if by.covered_by.is_some() {
            return Err(CpaError::invariant(format!("covering state {} is itself covered", coverer)));
        }
        self.at(coveree).covered_by = Some(coverer);
        self.at(coverer).covering.push(coveree);
        Ok(())
    }

    /// Removes the covering of `id`. Returns whether it was covered.
    pub fn uncover(&mut self, id: ArgId) -> Result<bool> {
        let Some(coverer) = self.node_mut(id)?.covered_by.take() else {
            return Ok(false);
        };
        self.at(coverer).covering.retain(|&c| c != id);
        Ok(true)
    }

    /// Detaches and destroys `id`. Returns the states it covered, now uncovered.
    pub fn remove(&mut self, id: ArgId) -> Result<Vec<ArgId>> {
        let node = self.node_mut(id)?;
        let parents = std::mem::take(&mut node.parents);
        let children = std::mem::take(&mut node.children);
        let covering = std::mem::take(&mut node.covering);
        let covered_by = node.covered_by.take();
        node.destroyed = true;

        for (p, _) in parents {
            self.at(p).children.retain(|&c| c != id);
        }
        for c in children {
            self.at(c).parents.retain(|&(p, _)| p != id);
        }
        if let Some(by) = covered_by {
            self.at(by).covering.retain(|&c| c != id);
        }
        for &c in &covering {
            self.at(c).covered_by = None;
        }
        trace!("removed {} from ARG", id);
        Ok(covering)
    }

    /// Removes `merged`, recording that it was merged into `into`.
    pub fn merge_into(&mut self, merged: ArgId, into: ArgId) -> Result<()> {
        self.node(into)?;
        self.node_mut(merged)?.merged_with = Some(into);
        self.remove(merged)?;
        Ok(())
    }

    /// Puts `new` in the place of `old`: `new` takes over all parents,
    /// children and covered states of `old`, which is destroyed.
    pub fn replace_with(&mut self, old: ArgId, new: ArgId) -> Result<()> {
        self.node(old)?;
        let fresh = self.node(new)?;
        if old == new {
            return Err(CpaError::invariant(format!("cannot replace {} with itself", old)));
        }
        if !fresh.children.is_empty() || fresh.is_covered() {
            return Err(CpaError::invariant(format!("replacement {} is already linked", new)));
        }

        let node = self.at(old);
        let parents = std::mem::take(&mut node.parents);
        let children = std::mem::take(&mut node.children);
        let covering = std::mem::take(&mut node.covering);
        node.destroyed = true;

        for (p, e) in parents {
            self.at(p).children.retain(|&c| c != old);
            if !self.nodes[new.index()].parents.iter().any(|&(q, _)| q == p) {
                self.at(new).parents.push((p, e));
                self.at(p).children.push(new);
            }
        }
        for c in children {
            let child = self.at(c);
            let has_new = child.parents.iter().any(|&(p, _)| p == new);
            if has_new {
                child.parents.retain(|&(p, _)| p != old);
            } else {
                for entry in child.parents.iter_mut() {
                    if entry.0 == old {
                        entry.0 = new;
                    }
                }
                self.at(new).children.push(c);
            }
        }
        for c in covering {
            self.at(c).covered_by = Some(new);
            self.at(new).covering.push(c);
        }
        trace!("replaced {} with {}", old, new);
        Ok(())
    }

    /// Removes `root` and every descendant all of whose parents are removed.
    ///
    /// A descendant with another live parent is kept; only its edges to
    /// removed states are cut. States covered by removed states are uncovered.
    pub fn remove_subtree(&mut self, root: ArgId) -> Result<SubtreeRemoval> {
        let root_node = self.node(root)?;
        let parents: Vec<ArgId> = root_node.parents().collect();

        let mut doomed: HashSet<ArgId> = HashSet::from([root]);
        let mut order = vec![root];
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            for &c in &self.nodes[id.index()].children {
                if doomed.contains(&c) {
                    continue;
                }
                if self.nodes[c.index()].parents().all(|p| doomed.contains(&p)) {
                    doomed.insert(c);
                    order.push(c);
                    stack.push(c);
                }
            }
        }

        let mut uncovered = Vec::new();
        for &id in &order {
            uncovered.extend(self.remove(id)?);
        }
        uncovered.retain(|c| !doomed.contains(c));
        uncovered.sort();
        uncovered.dedup();
        trace!("removed subtree of {} ({} states)", root, order.len());

        Ok(SubtreeRemoval {
            removed: order,
            parents,
            uncovered,
        })
    }

    /// Path from a root to `target`, following the most recently added
    /// parent at each step.
    pub fn counterexample_path(&self, target: ArgId) -> Result<ArgPath> {
        let mut states = vec![target];
        let mut edges = Vec::new();
        let mut current = self.node(target)?;
        while let Some(&(parent, edge)) = current.parents.last() {
            states.push(parent);
            edges.push(edge);
            current = self.node(parent)?;
            if states.len() > self.nodes.len() {
                return Err(CpaError::invariant(format!("parent chain of {} is cyclic", target)));
            }
        }
        states.reverse();
        edges.reverse();
        Ok(ArgPath { states, edges })
    }

    /// Number of distinct paths from `root` to a leaf (a state without children).
    pub fn count_paths(&self, root: ArgId) -> Result<BigUint> {
        self.node(root)?;
        let mut memo: HashMap<ArgId, BigUint> = HashMap::new();
        let mut stack = vec![(root, false)];
        while let Some((id, ready)) = stack.pop() {
            if memo.contains_key(&id) {
                continue;
            }
            let node = self.node(id)?;
            if node.children.is_empty() {
                memo.insert(id, BigUint::from(1u32));
            } else if ready {
                let mut total = BigUint::from(0u32);
                for c in &node.children {
                    if let Some(n) = memo.get(c) {
                        total += n;
                    }
                }
                memo.insert(id, total);
            } else {
                stack.push((id, true));
                for &c in &node.children {
                    if !memo.contains_key(&c) {
                        stack.push((c, false));
                    }
                }
            }
        }
        Ok(memo.remove(&root).unwrap_or_default())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use test_log::test;

    use super::*;

    pub fn dummy(arg: &mut Arg, location: u32) -> ArgId {
        let state = CompositeState::new(NodeId::new(location), vec![Arc::new(location)]);
        arg.create(state, CompositePrecision::new(vec![]), StateSpacePartition::default(), false)
    }

    fn e(i: u32) -> EdgeId {
        EdgeId::new(i)
    }

    /// Diamond: a -> b, a -> c, b -> d, c -> d.
    fn diamond() -> (Arg, [ArgId; 4]) {
        let mut arg = Arg::new();
        let ids = [0, 1, 2, 3].map(|i| dummy(&mut arg, i));
        let [a, b, c, d] = ids;
        arg.add_parent(b, a, e(0)).unwrap();
        arg.add_parent(c, a, e(1)).unwrap();
        arg.add_parent(d, b, e(2)).unwrap();
        arg.add_parent(d, c, e(3)).unwrap();
        (arg, ids)
    }

    #[test]
    fn test_add_parent_bidirectional() {
        let (arg, [a, b, c, d]) = diamond();
        assert_eq!(arg.node(a).unwrap().children(), &[b, c]);
        assert_eq!(arg.node(d).unwrap().parents().collect::<Vec<_>>(), vec![b, c]);
        assert_eq!(arg.node(d).unwrap().edge_from(c), Some(e(3)));
        assert_eq!(arg.roots().collect::<Vec<_>>(), vec![a]);
        arg.check_consistency().unwrap();
    }

    #[test]
    fn test_add_parent_is_idempotent() {
        let (mut arg, [a, b, ..]) = diamond();
        arg.add_parent(b, a, e(9)).unwrap();
        assert_eq!(arg.node(b).unwrap().parent_edges(), &[(a, e(0))]);
        assert_eq!(arg.node(a).unwrap().children().len(), 2);
    }

    #[test]
    fn test_add_parent_rejects_cycle() {
        let (mut arg, [a, _, _, d]) = diamond();
        let err = arg.add_parent(a, d, e(7)).unwrap_err();
        assert!(matches!(err, CpaError::InvariantViolation(_)));
        arg.check_consistency().unwrap();
    }

    #[test]
    fn test_cover_requires_no_children() {
        let (mut arg, [a, b, c, d]) = diamond();
        assert!(matches!(arg.set_covered(b, c), Err(CpaError::InvariantViolation(_))));

        arg.set_covered(d, a).unwrap();
        assert_eq!(arg.node(d).unwrap().covered_by(), Some(a));
        assert_eq!(arg.node(a).unwrap().covered_by_this(), &[d]);
        assert!(matches!(arg.set_covered(d, b), Err(CpaError::InvariantViolation(_))));

        assert!(arg.uncover(d).unwrap());
        assert!(!arg.uncover(d).unwrap());
        assert!(arg.node(a).unwrap().covered_by_this().is_empty());
    }

    #[test]
    fn test_remove_subtree_keeps_shared_descendants() {
        let (mut arg, [a, b, c, d]) = diamond();
        let removal = arg.remove_subtree(b).unwrap();
        assert_eq!(removal.removed, vec![b]);
        assert_eq!(removal.parents, vec![a]);
        assert!(arg.node(d).is_ok());
        assert_eq!(arg.node(d).unwrap().parents().collect::<Vec<_>>(), vec![c]);
        assert!(matches!(arg.node(b), Err(CpaError::DestroyedState(_))));
        arg.check_consistency().unwrap();

        // Now `d` hangs only off `c`, so removing `c` takes `d` with it.
        let removal = arg.remove_subtree(c).unwrap();
        assert_eq!(removal.removed, vec![c, d]);
        assert_eq!(arg.num_live(), 1);
        arg.check_consistency().unwrap();
    }

    #[test]
    fn test_remove_subtree_uncovers() {
        let mut arg = Arg::new();
        let root = dummy(&mut arg, 0);
        let x = dummy(&mut arg, 1);
        let y = dummy(&mut arg, 2);
        let z = dummy(&mut arg, 1);
        arg.add_parent(x, root, e(0)).unwrap();
        arg.add_parent(y, root, e(1)).unwrap();
        arg.add_parent(z, y, e(2)).unwrap();
        arg.set_covered(z, x).unwrap();

        let removal = arg.remove_subtree(x).unwrap();
        assert_eq!(removal.uncovered, vec![z]);
        assert!(!arg.node(z).unwrap().is_covered());
        arg.check_consistency().unwrap();
    }

    #[test]
    fn test_replace_with() {
        let (mut arg, [a, b, c, d]) = diamond();
        let leaf = dummy(&mut arg, 9);
        arg.add_parent(leaf, a, e(5)).unwrap();
        arg.set_covered(leaf, b).unwrap();

        let m = dummy(&mut arg, 1);
        arg.replace_with(b, m).unwrap();
        assert!(arg.node(b).is_err());
        assert_eq!(arg.node(m).unwrap().parent_edges(), &[(a, e(0))]);
        assert_eq!(arg.node(m).unwrap().children(), &[d]);
        assert_eq!(arg.node(d).unwrap().parents().collect::<Vec<_>>(), vec![m, c]);
        assert_eq!(arg.node(leaf).unwrap().covered_by(), Some(m));
        arg.check_consistency().unwrap();
    }

    #[test]
    fn test_merge_into() {
        let (mut arg, [a, _, c, _]) = diamond();
        let s = dummy(&mut arg, 2);
        arg.add_parent(s, a, e(1)).unwrap();
        arg.merge_into(s, c).unwrap();
        assert_eq!(arg.get(s).unwrap().merged_with(), Some(c));
        assert!(arg.get(s).unwrap().is_destroyed());
        assert_eq!(arg.node(a).unwrap().children().len(), 2);
        arg.check_consistency().unwrap();
    }

    #[test]
    fn test_counterexample_path_prefers_latest_parent() {
        let (arg, [a, _, c, d]) = diamond();
        let path = arg.counterexample_path(d).unwrap();
        assert_eq!(path.states, vec![a, c, d]);
        assert_eq!(path.edges, vec![e(1), e(3)]);
        assert_eq!(path.steps().last(), Some((d, None)));
        assert_eq!(path.first(), Some(a));
    }

    #[test]
    fn test_count_paths() {
        let (mut arg, [a, _, _, d]) = diamond();
        assert_eq!(arg.count_paths(a).unwrap(), BigUint::from(2u32));

        // Stack diamonds to get an exponential count.
        let mut tip = d;
        for i in 0..40 {
            let l = dummy(&mut arg, 10 + i);
            let r = dummy(&mut arg, 10 + i);
            let j = dummy(&mut arg, 10 + i);
            arg.add_parent(l, tip, e(0)).unwrap();
            arg.add_parent(r, tip, e(1)).unwrap();
            arg.add_parent(j, l, e(2)).unwrap();
            arg.add_parent(j, r, e(3)).unwrap();
            tip = j;
        }
        assert_eq!(arg.count_paths(a).unwrap(), BigUint::from(2u32).pow(41));
    }
}
