//! The CPA contract: abstract domain, transfer relation and operators.
//!
//! A configurable program analysis is a lattice of abstract states plus four
//! operators. The engine only ever talks to analyses through this contract.
//!
//! # Operators
//!
//! - **Transfer** ([`abstract_successors`]): zero or more successors per
//!   control-flow edge; zero means the edge is infeasible.
//! - **Merge** ([`MergePolicy`]): what to do when a new state meets an
//!   existing one at the same location.
//! - **Stop** ([`StopPolicy`]): whether a new state is already covered.
//! - **Precision adjustment** ([`prec`]): may replace state and precision,
//!   and decides whether exploration continues past the state.
//!
//! # Lattice Properties
//!
//! `is_less_or_equal` must be reflexive and transitive. Nothing checks this
//! at run time; a broken order may make the reachability loop diverge.
//!
//! [`abstract_successors`]: ConfigurableProgramAnalysis::abstract_successors
//! [`prec`]: ConfigurableProgramAnalysis::prec

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::cfa::{Cfa, CfaEdge, Loop};
use crate::error::TransferError;
use crate::reached::{ReachedSet, StateSpacePartition};
use crate::summary::SummaryInstance;
use crate::types::{EdgeId, NodeId};

/// Partial order (and optional join) over abstract states.
pub trait AbstractDomain {
    /// The type representing abstract states.
    type State: Clone + Debug + PartialEq + Send + Sync + 'static;

    /// Partial order: `a ⊑ b` (a is more precise than b).
    fn is_less_or_equal(&self, a: &Self::State, b: &Self::State) -> bool;

    /// Least upper bound, if the domain has one.
    ///
    /// Domains returning `None` cannot be used with [`MergePolicy::Join`]
    /// or [`StopPolicy::Join`].
    fn join(&self, a: &Self::State, b: &Self::State) -> Option<Self::State> {
        let _ = (a, b);
        None
    }
}

/// How a new state is combined with a reached state at the same location.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MergePolicy {
    /// Keep states separate.
    Sep,
    /// Replace the reached state by the join of both.
    Join,
}

/// How coverage of a new state is decided.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopPolicy {
    /// Covered iff below some single reached state.
    Sep,
    /// Covered iff below the join of all reached states.
    Join,
    /// Never covered.
    Never,
}

/// Verdict of precision adjustment on one state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Action {
    Continue,
    /// Keep the state in the reached set but do not expand it.
    Break,
    /// The domain performs no adjustment; treated as `Continue`.
    Disabled,
}

impl Action {
    /// Combines the actions of two components: `Break` dominates.
    pub fn update(self, other: Action) -> Action {
        match (self, other) {
            (Action::Break, _) | (_, Action::Break) => Action::Break,
            (Action::Continue, _) | (_, Action::Continue) => Action::Continue,
            _ => Action::Disabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrecisionAdjustmentResult<S, P> {
    pub state: S,
    pub precision: P,
    pub action: Action,
}

impl<S, P> PrecisionAdjustmentResult<S, P> {
    pub fn new(state: S, precision: P, action: Action) -> Self {
        Self {
            state,
            precision,
            action,
        }
    }
}

/// Read-only view of the reached set restricted to one component domain.
pub struct ProjectedReached<'a, S> {
    reached: &'a ReachedSet,
    component: usize,
    _marker: PhantomData<fn() -> S>,
}

impl<'a, S: 'static> ProjectedReached<'a, S> {
    pub(crate) fn new(reached: &'a ReachedSet, component: usize) -> Self {
        Self {
            reached,
            component,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.reached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reached.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a S> + 'a {
        let component = self.component;
        self.reached.states().filter_map(move |s| s.component::<S>(component))
    }

    /// Component states at `location`, across all partitions.
    pub fn at_location(&self, location: NodeId) -> impl Iterator<Item = &'a S> + 'a {
        let component = self.component;
        self.reached
            .states()
            .filter(move |s| s.location() == location)
            .filter_map(move |s| s.component::<S>(component))
    }
}

/// Adjustable-condition capability: a threshold that can be raised between runs.
pub trait AdjustableCondition {
    /// Raises the threshold. Returns `false` once the hard limit is reached.
    fn adjust_precision(&mut self) -> bool;

    /// Current threshold, for diagnostics.
    fn threshold(&self) -> Option<u64> {
        None
    }
}

/// Capability of invalidating reached states after a condition adjustment,
/// so that a reached set can be reused instead of restarting.
pub trait ReachedSetAdjusting<S> {
    /// Whether `state` was cut off by the previous threshold and must be
    /// recomputed from its parents.
    fn is_invalidated(&self, state: &S) -> bool;
}

/// A configurable program analysis.
pub trait ConfigurableProgramAnalysis: AbstractDomain + Send {
    type Precision: Clone + Debug + PartialEq + Send + Sync + 'static;

    fn name(&self) -> &str;

    fn initial_state(&self, node: NodeId, partition: &StateSpacePartition) -> Self::State;

    fn initial_precision(&self, node: NodeId, partition: &StateSpacePartition) -> Self::Precision;

    /// Successors of `state` along `edge`. An empty vector means infeasible.
    fn abstract_successors(
        &self,
        state: &Self::State,
        precision: &Self::Precision,
        edge: &CfaEdge,
        cfa: &Cfa,
    ) -> Result<Vec<Self::State>, TransferError>;

    fn merge_operator(&self) -> MergePolicy {
        MergePolicy::Sep
    }

    fn stop_operator(&self) -> StopPolicy {
        StopPolicy::Sep
    }

    /// Precision adjustment. Returning `None` drops the state as infeasible.
    fn prec(
        &self,
        state: &Self::State,
        precision: &Self::Precision,
        reached: &ProjectedReached<'_, Self::State>,
    ) -> Option<PrecisionAdjustmentResult<Self::State, Self::Precision>> {
        let _ = reached;
        Some(static_precision_adjustment(state, precision))
    }

    /// Whether `state` violates the property being checked.
    fn is_target(&self, state: &Self::State) -> bool {
        let _ = state;
        false
    }

    /// Whether `state` results from an unsound approximation.
    fn is_unsound(&self, state: &Self::State) -> bool {
        let _ = state;
        false
    }

    /// Applies function summaries at a call site.
    ///
    /// `Ok(None)` means the domain does not consume summaries; its state is
    /// then carried over to the return site unchanged.
    fn apply_function_summary(
        &self,
        state: &Self::State,
        precision: &Self::Precision,
        summaries: &[Arc<dyn SummaryInstance>],
        call_edge: &CfaEdge,
        summary_edge: &CfaEdge,
    ) -> Result<Option<Vec<Self::State>>, TransferError> {
        let _ = (state, precision, summaries, call_edge, summary_edge);
        Ok(None)
    }

    /// Applies external loop summaries, bypassing the loop.
    ///
    /// Each successor is paired with the loop exit edge it leaves through.
    fn apply_external_loop_summary(
        &self,
        state: &Self::State,
        precision: &Self::Precision,
        summaries: &[Arc<dyn SummaryInstance>],
        loop_info: &Loop,
    ) -> Result<Option<Vec<(EdgeId, Self::State)>>, TransferError> {
        let _ = (state, precision, summaries, loop_info);
        Ok(None)
    }

    /// Applies internal loop summaries to a state that has just entered the loop.
    fn apply_internal_loop_summary(
        &self,
        state: &Self::State,
        precision: &Self::Precision,
        summaries: &[Arc<dyn SummaryInstance>],
        loop_info: &Loop,
        edge: &CfaEdge,
    ) -> Result<Option<Vec<Self::State>>, TransferError> {
        let _ = (state, precision, summaries, loop_info, edge);
        Ok(None)
    }

    fn as_adjustable_condition(&mut self) -> Option<&mut dyn AdjustableCondition> {
        None
    }

    /// Read-only view of [`as_adjustable_condition`](Self::as_adjustable_condition).
    fn adjustable_condition(&self) -> Option<&dyn AdjustableCondition> {
        None
    }

    fn as_reached_set_adjusting(&self) -> Option<&dyn ReachedSetAdjusting<Self::State>> {
        None
    }
}

/// Separate merge: the reached state is kept unchanged.
pub fn merge_sep<S: Clone>(_new: &S, reached: &S) -> S {
    reached.clone()
}

/// Join merge: the least upper bound, or `None` if the domain has no join.
pub fn merge_join<D>(domain: &D, new: &D::State, reached: &D::State) -> Option<D::State>
where
    D: AbstractDomain + ?Sized,
{
    domain.join(new, reached)
}

/// Separate stop: `state` is covered by a single reached state.
pub fn stop_sep<'a, D, I>(domain: &D, state: &D::State, reached: I) -> bool
where
    D: AbstractDomain + ?Sized,
    I: IntoIterator<Item = &'a D::State>,
    D::State: 'a,
{
    reached.into_iter().any(|r| domain.is_less_or_equal(state, r))
}

/// Join stop: `state` is covered by the join of all reached states.
///
/// Returns `None` if the domain has no join.
pub fn stop_join<'a, D, I>(domain: &D, state: &D::State, reached: I) -> Option<bool>
where
    D: AbstractDomain + ?Sized,
    I: IntoIterator<Item = &'a D::State>,
    D::State: 'a,
{
    let mut iter = reached.into_iter();
    let Some(first) = iter.next() else {
        return Some(false);
    };
    let mut joined = first.clone();
    for r in iter {
        joined = domain.join(&joined, r)?;
    }
    Some(domain.is_less_or_equal(state, &joined))
}

pub fn stop_never<S>(_state: &S) -> bool {
    false
}

/// The no-op precision adjustment.
pub fn static_precision_adjustment<S: Clone, P: Clone>(state: &S, precision: &P) -> PrecisionAdjustmentResult<S, P> {
    PrecisionAdjustmentResult::new(state.clone(), precision.clone(), Action::Continue)
}
