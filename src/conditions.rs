//! Shipped analyses: target locations and adjustable conditions.
//!
//! [`PathLengthCpa`] and [`LoopBoundCpa`] bound exploration by a
//! [`ConditionThreshold`] that the refinement loop raises between runs.
//! States over the bound are cut: precision adjustment returns
//! [`Action::Break`] and marks the state, so it is reached but never
//! expanded, and the run becomes incomplete.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::cfa::{Cfa, CfaEdge};
use crate::domain::{
    Action, AbstractDomain, AdjustableCondition, ConfigurableProgramAnalysis, PrecisionAdjustmentResult,
    ProjectedReached, ReachedSetAdjusting,
};
use crate::error::TransferError;
use crate::reached::StateSpacePartition;
use crate::types::{LoopId, NodeId};

/// How a threshold grows on adjustment.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThresholdAdjuster {
    /// Never grows; adjustment always fails.
    Static,
    Increment(u64),
    Double,
}

impl ThresholdAdjuster {
    fn next(self, current: u64) -> Option<u64> {
        match self {
            ThresholdAdjuster::Static => None,
            ThresholdAdjuster::Increment(n) => Some(current.saturating_add(n)),
            ThresholdAdjuster::Double => Some(current.saturating_mul(2).max(current.saturating_add(1))),
        }
    }
}

/// A monotonically increasing threshold with an optional hard limit.
///
/// Once the hard limit is reached the threshold is frozen and
/// [`adjust`](ConditionThreshold::adjust) fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionThreshold {
    current: u64,
    hard_limit: Option<u64>,
    adjuster: ThresholdAdjuster,
}

impl ConditionThreshold {
    pub fn new(initial: u64, adjuster: ThresholdAdjuster) -> Self {
        Self {
            current: initial,
            hard_limit: None,
            adjuster,
        }
    }

    /// A threshold that never changes.
    pub fn fixed(value: u64) -> Self {
        Self::new(value, ThresholdAdjuster::Static)
    }

    pub fn with_hard_limit(mut self, limit: u64) -> Self {
        self.hard_limit = Some(limit);
        self.current = self.current.min(limit);
        self
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn hard_limit(&self) -> Option<u64> {
        self.hard_limit
    }

    pub fn is_frozen(&self) -> bool {
        self.adjuster == ThresholdAdjuster::Static || self.hard_limit.map_or(false, |h| self.current >= h)
    }

    /// Raises the threshold (clamped to the hard limit). Returns `false` if frozen.
    pub fn adjust(&mut self) -> bool {
        if self.is_frozen() {
            return false;
        }
        let Some(mut next) = self.adjuster.next(self.current) else {
            return false;
        };
        if let Some(limit) = self.hard_limit {
            next = next.min(limit);
        }
        if next <= self.current {
            return false;
        }
        self.current = next;
        true
    }
}

/// Flags states at designated error locations as targets.
#[derive(Debug, Clone)]
pub struct TargetLocationCpa {
    targets: BTreeSet<NodeId>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TargetLocationState {
    pub at_target: bool,
}

impl TargetLocationCpa {
    pub fn new(targets: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            targets: targets.into_iter().collect(),
        }
    }

    fn state_at(&self, node: NodeId) -> TargetLocationState {
        TargetLocationState {
            at_target: self.targets.contains(&node),
        }
    }
}

impl AbstractDomain for TargetLocationCpa {
    type State = TargetLocationState;

    fn is_less_or_equal(&self, a: &Self::State, b: &Self::State) -> bool {
        a == b
    }
}

impl ConfigurableProgramAnalysis for TargetLocationCpa {
    type Precision = ();

    fn name(&self) -> &str {
        "TargetLocationCPA"
    }

    fn initial_state(&self, node: NodeId, _partition: &StateSpacePartition) -> Self::State {
        self.state_at(node)
    }

    fn initial_precision(&self, _node: NodeId, _partition: &StateSpacePartition) {}

    fn abstract_successors(&self, _state: &Self::State, _precision: &(), edge: &CfaEdge, _cfa: &Cfa) -> Result<Vec<Self::State>, TransferError> {
        Ok(vec![self.state_at(edge.successor)])
    }

    fn is_target(&self, state: &Self::State) -> bool {
        state.at_target
    }
}

/// Length of the path leading to a state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PathLengthState {
    pub length: u64,
    /// Set when the state was cut by the threshold.
    pub cut: bool,
}

/// Cuts paths longer than the threshold.
///
/// A longer path is covered by a shorter one at the same location, since the
/// shorter one has more budget left.
#[derive(Debug, Clone)]
pub struct PathLengthCpa {
    threshold: ConditionThreshold,
}

impl PathLengthCpa {
    pub fn new(threshold: ConditionThreshold) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> &ConditionThreshold {
        &self.threshold
    }
}

impl AbstractDomain for PathLengthCpa {
    type State = PathLengthState;

    fn is_less_or_equal(&self, a: &Self::State, b: &Self::State) -> bool {
        if b.cut {
            return a == b;
        }
        a.length >= b.length
    }

    fn join(&self, a: &Self::State, b: &Self::State) -> Option<Self::State> {
        // A cut state is only below itself.
        if a.cut && b.cut {
            return (a == b).then_some(*a);
        }
        Some(PathLengthState {
            length: a.length.min(b.length),
            cut: false,
        })
    }
}

impl ConfigurableProgramAnalysis for PathLengthCpa {
    type Precision = ();

    fn name(&self) -> &str {
        "PathLengthCPA"
    }

    fn initial_state(&self, _node: NodeId, _partition: &StateSpacePartition) -> Self::State {
        PathLengthState { length: 0, cut: false }
    }

    fn initial_precision(&self, _node: NodeId, _partition: &StateSpacePartition) {}

    fn abstract_successors(&self, state: &Self::State, _precision: &(), _edge: &CfaEdge, _cfa: &Cfa) -> Result<Vec<Self::State>, TransferError> {
        Ok(vec![PathLengthState {
            length: state.length + 1,
            cut: false,
        }])
    }

    fn prec(
        &self,
        state: &Self::State,
        _precision: &(),
        _reached: &ProjectedReached<'_, Self::State>,
    ) -> Option<PrecisionAdjustmentResult<Self::State, ()>> {
        if state.length > self.threshold.current() {
            let cut = PathLengthState { cut: true, ..*state };
            return Some(PrecisionAdjustmentResult::new(cut, (), Action::Break));
        }
        Some(PrecisionAdjustmentResult::new(*state, (), Action::Continue))
    }

    fn as_adjustable_condition(&mut self) -> Option<&mut dyn AdjustableCondition> {
        Some(self)
    }

    fn adjustable_condition(&self) -> Option<&dyn AdjustableCondition> {
        Some(self)
    }
}

impl AdjustableCondition for PathLengthCpa {
    fn adjust_precision(&mut self) -> bool {
        let adjusted = self.threshold.adjust();
        debug!("path length threshold: {} (adjusted: {})", self.threshold.current(), adjusted);
        adjusted
    }

    fn threshold(&self) -> Option<u64> {
        Some(self.threshold.current())
    }
}

/// Back-edge traversals per active loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LoopBoundState {
    pub iterations: BTreeMap<LoopId, u64>,
    /// Set when the state was cut by the threshold.
    pub cut: bool,
}

impl LoopBoundState {
    pub fn iterations_of(&self, id: LoopId) -> u64 {
        self.iterations.get(&id).copied().unwrap_or(0)
    }
}

/// Unrolls every loop at most `threshold` times.
///
/// A state arriving at a loop head for the `threshold`-th time through a
/// back edge is cut. More iterations are covered by fewer iterations at the
/// same location.
#[derive(Debug, Clone)]
pub struct LoopBoundCpa {
    threshold: ConditionThreshold,
}

impl LoopBoundCpa {
    pub fn new(threshold: ConditionThreshold) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> &ConditionThreshold {
        &self.threshold
    }
}

impl AbstractDomain for LoopBoundCpa {
    type State = LoopBoundState;

    fn is_less_or_equal(&self, a: &Self::State, b: &Self::State) -> bool {
        if b.cut {
            return a == b;
        }
        let loops: BTreeSet<LoopId> = a.iterations.keys().chain(b.iterations.keys()).copied().collect();
        loops.into_iter().all(|l| a.iterations_of(l) >= b.iterations_of(l))
    }
}

impl ConfigurableProgramAnalysis for LoopBoundCpa {
    type Precision = ();

    fn name(&self) -> &str {
        "LoopBoundCPA"
    }

    fn initial_state(&self, _node: NodeId, _partition: &StateSpacePartition) -> Self::State {
        LoopBoundState::default()
    }

    fn initial_precision(&self, _node: NodeId, _partition: &StateSpacePartition) {}

    fn abstract_successors(&self, state: &Self::State, _precision: &(), edge: &CfaEdge, cfa: &Cfa) -> Result<Vec<Self::State>, TransferError> {
        let mut next = LoopBoundState {
            iterations: state.iterations.clone(),
            cut: false,
        };
        for l in cfa.loops() {
            if l.exit_edges.contains(&edge.id) {
                next.iterations.remove(&l.id);
            }
        }
        if let Some(l) = cfa.entered_loop(edge) {
            next.iterations.insert(l.id, 0);
        } else if let Some(l) = cfa.back_edge_loop(edge) {
            *next.iterations.entry(l.id).or_insert(0) += 1;
        }
        Ok(vec![next])
    }

    fn prec(
        &self,
        state: &Self::State,
        _precision: &(),
        _reached: &ProjectedReached<'_, Self::State>,
    ) -> Option<PrecisionAdjustmentResult<Self::State, ()>> {
        let bound = self.threshold.current();
        if state.iterations.values().any(|&n| n >= bound) {
            let cut = LoopBoundState {
                iterations: state.iterations.clone(),
                cut: true,
            };
            return Some(PrecisionAdjustmentResult::new(cut, (), Action::Break));
        }
        Some(PrecisionAdjustmentResult::new(state.clone(), (), Action::Continue))
    }

    fn as_adjustable_condition(&mut self) -> Option<&mut dyn AdjustableCondition> {
        Some(self)
    }

    fn adjustable_condition(&self) -> Option<&dyn AdjustableCondition> {
        Some(self)
    }

    fn as_reached_set_adjusting(&self) -> Option<&dyn ReachedSetAdjusting<Self::State>> {
        Some(self)
    }
}

impl AdjustableCondition for LoopBoundCpa {
    fn adjust_precision(&mut self) -> bool {
        let adjusted = self.threshold.adjust();
        debug!("loop bound: {} (adjusted: {})", self.threshold.current(), adjusted);
        adjusted
    }

    fn threshold(&self) -> Option<u64> {
        Some(self.threshold.current())
    }
}

impl ReachedSetAdjusting<LoopBoundState> for LoopBoundCpa {
    fn is_invalidated(&self, state: &LoopBoundState) -> bool {
        state.cut
    }
}
