//! The reached set: all live explored states, plus the waitlist.
//!
//! A [`ReachedSet`] owns the [`Arg`] arena. States enter the ARG first and
//! may or may not be part of the reached set: covered and merged states stay
//! in (or leave) the ARG but never count as reached.
//!
//! # Invariants
//!
//! - Every waiting state is reached.
//! - Every reached state is a live ARG state and is not covered.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexSet;
use log::debug;

use crate::arg::{Arg, ArgNode, SubtreeRemoval};
use crate::cfa::Cfa;
use crate::composite::{CompositeCpa, CompositePrecision, CompositeState};
use crate::error::{CpaError, Result};
use crate::types::{ArgId, NodeId};
use crate::waitlist::{TraversalOrder, Waitlist};

/// Key separating independent parts of the state space (e.g. per-block analyses).
///
/// The default partition has no name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateSpacePartition(Option<Arc<str>>);

impl StateSpacePartition {
    pub fn new(name: &str) -> Self {
        StateSpacePartition(Some(name.into()))
    }

    pub fn name(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl fmt::Display for StateSpacePartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "<default>"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReachedSet {
    arg: Arg,
    entries: IndexSet<ArgId>,
    by_location: HashMap<(StateSpacePartition, NodeId), IndexSet<ArgId>>,
    waitlist: Waitlist,
    ranks: Vec<u32>,
}

impl ReachedSet {
    /// An empty reached set. Without CFA ranks, topological order degrades to DFS.
    pub fn new(order: TraversalOrder) -> Self {
        Self {
            arg: Arg::new(),
            entries: IndexSet::new(),
            by_location: HashMap::new(),
            waitlist: Waitlist::new(order),
            ranks: Vec::new(),
        }
    }

    /// An empty reached set ranking locations by the reverse postorder of `cfa`.
    pub fn for_cfa(order: TraversalOrder, cfa: &Cfa) -> Self {
        let mut reached = Self::new(order);
        reached.ranks = cfa.nodes().map(|n| cfa.reverse_postorder(n.id)).collect();
        reached
    }

    pub fn order(&self) -> TraversalOrder {
        self.waitlist.order()
    }

    fn rank(&self, location: NodeId) -> u32 {
        self.ranks.get(location.index()).copied().unwrap_or(0)
    }

    pub fn arg(&self) -> &Arg {
        &self.arg
    }

    pub(crate) fn arg_mut(&mut self) -> &mut Arg {
        &mut self.arg
    }

    /// Drops all states (the ARG included) and seeds the set with the
    /// initial state of `cpa` at `node`.
    pub fn initialize(&mut self, cpa: &CompositeCpa, node: NodeId, partition: StateSpacePartition) -> Result<ArgId> {
        self.clear();
        let state = cpa.initial_state(node, &partition);
        let precision = cpa.initial_precision(node, &partition);
        let target = cpa.is_target(&state)?;
        let id = self.arg.create(state, precision, partition, target);
        // Targets are never expanded.
        if target {
            self.add_reached(id)?;
        } else {
            self.add(id)?;
        }
        debug!("initialized reached set with {} at {}", id, node);
        Ok(id)
    }

    /// Creates a detached ARG state (not yet reached).
    pub(crate) fn create_state(
        &mut self,
        state: CompositeState,
        precision: CompositePrecision,
        partition: StateSpacePartition,
        target: bool,
    ) -> ArgId {
        self.arg.create(state, precision, partition, target)
    }

    pub fn clear(&mut self) {
        self.arg = Arg::new();
        self.entries.clear();
        self.by_location.clear();
        self.waitlist.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: ArgId) -> bool {
        self.entries.contains(&id)
    }

    /// The oldest reached state, the entry point for path reconstruction.
    pub fn first(&self) -> Option<ArgId> {
        self.entries.first().copied()
    }

    /// The most recently reached state.
    pub fn last(&self) -> Option<ArgId> {
        self.entries.last().copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = ArgId> + '_ {
        self.entries.iter().copied()
    }

    /// ARG nodes of all reached states, in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &ArgNode> + '_ {
        self.entries.iter().filter_map(move |&id| self.arg.get(id))
    }

    pub fn states(&self) -> impl Iterator<Item = &CompositeState> + '_ {
        self.nodes().map(|n| n.state())
    }

    pub fn node(&self, id: ArgId) -> Result<&ArgNode> {
        self.arg.node(id)
    }

    pub fn state(&self, id: ArgId) -> Result<&CompositeState> {
        Ok(self.arg.node(id)?.state())
    }

    pub fn precision(&self, id: ArgId) -> Result<&CompositePrecision> {
        Ok(self.arg.node(id)?.precision())
    }

    /// Reached states in `partition`.
    pub fn in_partition<'a>(&'a self, partition: &'a StateSpacePartition) -> impl Iterator<Item = ArgId> + 'a {
        self.nodes().filter(move |n| n.partition() == partition).map(|n| n.id())
    }

    /// Distinct partitions, in order of first appearance.
    pub fn partitions(&self) -> Vec<&StateSpacePartition> {
        let mut result: IndexSet<&StateSpacePartition> = IndexSet::new();
        for node in self.nodes() {
            result.insert(node.partition());
        }
        result.into_iter().collect()
    }

    /// Reached states in `partition` located at `location`.
    pub fn at_location(&self, partition: &StateSpacePartition, location: NodeId) -> impl Iterator<Item = ArgId> + '_ {
        self.by_location
            .get(&(partition.clone(), location))
            .into_iter()
            .flat_map(|ids| ids.iter().copied())
    }

    /// Live target states among the reached states.
    pub fn targets(&self) -> Vec<ArgId> {
        self.nodes().filter(|n| n.is_target()).map(|n| n.id()).collect()
    }

    pub fn waitlist(&self) -> &Waitlist {
        &self.waitlist
    }

    pub fn waitlist_len(&self) -> usize {
        self.waitlist.len()
    }

    pub fn has_waiting_state(&self) -> bool {
        !self.waitlist.is_empty()
    }

    pub fn pop_waiting(&mut self) -> Option<ArgId> {
        self.waitlist.pop()
    }

    /// Adds an ARG state to the reached set and the waitlist.
    pub fn add(&mut self, id: ArgId) -> Result<()> {
        self.add_reached(id)?;
        let rank = self.rank(self.arg.node(id)?.location());
        self.waitlist.push(id, rank);
        Ok(())
    }

    /// Adds an ARG state to the reached set only (it will not be expanded).
    pub fn add_reached(&mut self, id: ArgId) -> Result<()> {
        let node = self.arg.node(id)?;
        if node.is_covered() {
            return Err(CpaError::invariant(format!("covered state {} cannot be reached", id)));
        }
        let key = (node.partition().clone(), node.location());
        if self.entries.insert(id) {
            self.by_location.entry(key).or_default().insert(id);
        }
        Ok(())
    }

    /// Puts a reached state back on the waitlist.
    pub fn re_add_to_waitlist(&mut self, id: ArgId) -> Result<()> {
        if !self.entries.contains(&id) {
            return Err(CpaError::invariant(format!("{} is not reached and cannot wait", id)));
        }
        let rank = self.rank(self.arg.node(id)?.location());
        self.waitlist.push(id, rank);
        Ok(())
    }

    /// Takes a reached state off the waitlist, keeping it reached.
    pub fn remove_from_waitlist(&mut self, id: ArgId) -> bool {
        self.waitlist.remove(id)
    }

    /// Removes a state from the reached set and the waitlist; the ARG is untouched.
    pub fn remove(&mut self, id: ArgId) -> bool {
        self.waitlist.remove(id);
        if !self.entries.shift_remove(&id) {
            return false;
        }
        if let Some(node) = self.arg.get(id) {
            let key = (node.partition().clone(), node.location());
            if let Some(ids) = self.by_location.get_mut(&key) {
                ids.shift_remove(&id);
                if ids.is_empty() {
                    self.by_location.remove(&key);
                }
            }
        }
        true
    }

    /// Replaces reached state `old` by `new` in both the reached set and the
    /// ARG. `new` is put on the waitlist.
    pub fn replace(&mut self, old: ArgId, new: ArgId) -> Result<()> {
        if !self.entries.contains(&old) {
            return Err(CpaError::invariant(format!("cannot replace unreached state {}", old)));
        }
        self.arg.replace_with(old, new)?;
        self.remove(old);
        self.add(new)
    }

    /// Removes `id` and its exclusive descendants from the ARG and the
    /// reached set. Parents of `id` are put back on the waitlist so the
    /// subtree gets recomputed; states uncovered by the removal are reached
    /// and waiting again.
    pub fn remove_subtree(&mut self, id: ArgId) -> Result<SubtreeRemoval> {
        let removal = self.arg.remove_subtree(id)?;
        for &r in &removal.removed {
            self.remove(r);
        }
        for &u in &removal.uncovered {
            self.add(u)?;
        }
        for &p in &removal.parents {
            if self.entries.contains(&p) {
                self.re_add_to_waitlist(p)?;
            }
        }
        debug!(
            "removed subtree of {}: {} states, {} uncovered, {} parents re-queued",
            id,
            removal.removed.len(),
            removal.uncovered.len(),
            removal.parents.len()
        );
        Ok(removal)
    }

    /// Drops every reached state some component of `cpa` considers
    /// invalidated, re-queueing its parents.
    ///
    /// Returns the number of removed subtrees. If the first state is
    /// invalidated the set ends up empty and must be re-initialized.
    pub fn adjust(&mut self, cpa: &CompositeCpa) -> Result<usize> {
        let mut invalidated = Vec::new();
        for node in self.nodes() {
            if cpa.is_invalidated(node.state())? {
                invalidated.push(node.id());
            }
        }
        if let Some(first) = self.first() {
            if invalidated.contains(&first) {
                debug!("first state {} invalidated, clearing reached set", first);
                self.clear();
                return Ok(1);
            }
        }
        let mut count = 0;
        for id in invalidated {
            // Earlier removals may have taken this state already.
            if self.arg.node(id).is_ok() && self.entries.contains(&id) {
                self.remove_subtree(id)?;
                count += 1;
            }
        }
        Ok(count)
    }
}
