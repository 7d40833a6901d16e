//! Composition of several analyses into one.
//!
//! A [`CompositeCpa`] wraps an ordered list of analyses of different types.
//! Component states are type-erased behind [`DynState`] and kept in
//! declaration order inside a [`CompositeState`], which also carries the
//! program location.
//!
//! Every composite operator delegates component-wise and is a conjunction:
//! a successor exists only if every component produces one, a state is
//! covered only if every component agrees, and a merge happens only if every
//! component can merge.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use log::trace;

use crate::cfa::{Cfa, CfaEdge, Loop};
use crate::domain::{
    merge_join, merge_sep, stop_join, stop_never, stop_sep, Action, AdjustableCondition, ConfigurableProgramAnalysis,
    MergePolicy, ProjectedReached, StopPolicy,
};
use crate::error::{CpaError, Result};
use crate::reached::{ReachedSet, StateSpacePartition};
use crate::summary::SummaryInstance;
use crate::types::{ArgId, EdgeId, NodeId};

/// Type-erased component value (state or precision).
pub trait DynState: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn DynState) -> bool;
}

impl<T> DynState for T
where
    T: Any + fmt::Debug + PartialEq + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn DynState) -> bool {
        other.as_any().downcast_ref::<T>().map_or(false, |o| self == o)
    }
}

pub type StateRef = Arc<dyn DynState>;

fn downcast<T: 'static>(value: &dyn DynState) -> Option<&T> {
    value.as_any().downcast_ref::<T>()
}

fn cast<'v, T: 'static>(value: &'v dyn DynState, domain: &str) -> Result<&'v T> {
    downcast::<T>(value)
        .ok_or_else(|| CpaError::invariant(format!("'{}' received a foreign component {:?}", domain, value)))
}

/// An immutable composite abstract state: a location plus one state per component.
#[derive(Clone)]
pub struct CompositeState {
    location: NodeId,
    components: Arc<[StateRef]>,
}

impl CompositeState {
    pub fn new(location: NodeId, components: Vec<StateRef>) -> Self {
        Self {
            location,
            components: components.into(),
        }
    }

    pub fn location(&self) -> NodeId {
        self.location
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> &[StateRef] {
        &self.components
    }

    /// The state of the `index`-th component, if it has type `S`.
    pub fn component<S: 'static>(&self, index: usize) -> Option<&S> {
        downcast::<S>(&**self.components.get(index)?)
    }

    /// The first component state of type `S`.
    pub fn find<S: 'static>(&self) -> Option<&S> {
        self.components.iter().find_map(|c| downcast::<S>(&**c))
    }
}

impl PartialEq for CompositeState {
    fn eq(&self, other: &Self) -> bool {
        self.location == other.location
            && self.components.len() == other.components.len()
            && self.components.iter().zip(other.components.iter()).all(|(a, b)| a.dyn_eq(&**b))
    }
}

impl fmt::Debug for CompositeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.location)?;
        f.debug_list().entries(self.components.iter()).finish()
    }
}

/// Ordered per-component precisions.
#[derive(Clone)]
pub struct CompositePrecision {
    components: Arc<[StateRef]>,
}

impl CompositePrecision {
    pub fn new(components: Vec<StateRef>) -> Self {
        Self {
            components: components.into(),
        }
    }

    pub fn components(&self) -> &[StateRef] {
        &self.components
    }

    pub fn component<P: 'static>(&self, index: usize) -> Option<&P> {
        downcast::<P>(&**self.components.get(index)?)
    }
}

impl PartialEq for CompositePrecision {
    fn eq(&self, other: &Self) -> bool {
        self.components.len() == other.components.len()
            && self.components.iter().zip(other.components.iter()).all(|(a, b)| a.dyn_eq(&**b))
    }
}

impl fmt::Debug for CompositePrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.components.iter()).finish()
    }
}

/// Object-safe view of a [`ConfigurableProgramAnalysis`].
trait DynCpa: Send {
    fn label(&self) -> &str;
    fn merge_policy(&self) -> MergePolicy;
    fn initial(&self, node: NodeId, partition: &StateSpacePartition) -> StateRef;
    fn initial_prec(&self, node: NodeId, partition: &StateSpacePartition) -> StateRef;
    fn successors(&self, state: &dyn DynState, precision: &dyn DynState, edge: &CfaEdge, cfa: &Cfa) -> Result<Vec<StateRef>>;
    fn merge_into(&self, new: &dyn DynState, reached: &dyn DynState) -> Result<StateRef>;
    fn covered_by(&self, state: &dyn DynState, reached: &dyn DynState) -> Result<bool>;
    fn adjust(
        &self,
        state: &dyn DynState,
        precision: &dyn DynState,
        reached: &ReachedSet,
        index: usize,
    ) -> Result<Option<(StateRef, StateRef, Action)>>;
    fn target(&self, state: &dyn DynState) -> Result<bool>;
    fn unsound(&self, state: &dyn DynState) -> Result<bool>;
    fn function_summary(
        &self,
        state: &dyn DynState,
        precision: &dyn DynState,
        summaries: &[Arc<dyn SummaryInstance>],
        call_edge: &CfaEdge,
        summary_edge: &CfaEdge,
    ) -> Result<Option<Vec<StateRef>>>;
    fn external_loop_summary(
        &self,
        state: &dyn DynState,
        precision: &dyn DynState,
        summaries: &[Arc<dyn SummaryInstance>],
        loop_info: &Loop,
    ) -> Result<Option<Vec<(EdgeId, StateRef)>>>;
    fn internal_loop_summary(
        &self,
        state: &dyn DynState,
        precision: &dyn DynState,
        summaries: &[Arc<dyn SummaryInstance>],
        loop_info: &Loop,
        edge: &CfaEdge,
    ) -> Result<Option<Vec<StateRef>>>;
    fn condition(&mut self) -> Option<&mut dyn AdjustableCondition>;
    fn condition_ref(&self) -> Option<&dyn AdjustableCondition>;
    fn adjusts_reached_set(&self) -> bool;
    fn invalidated(&self, state: &dyn DynState) -> Result<bool>;
}

fn erase<T: DynState>(value: T) -> StateRef {
    Arc::new(value)
}

impl<C> DynCpa for C
where
    C: ConfigurableProgramAnalysis,
{
    fn label(&self) -> &str {
        ConfigurableProgramAnalysis::name(self)
    }

    fn merge_policy(&self) -> MergePolicy {
        self.merge_operator()
    }

    fn initial(&self, node: NodeId, partition: &StateSpacePartition) -> StateRef {
        erase(self.initial_state(node, partition))
    }

    fn initial_prec(&self, node: NodeId, partition: &StateSpacePartition) -> StateRef {
        erase(self.initial_precision(node, partition))
    }

    fn successors(&self, state: &dyn DynState, precision: &dyn DynState, edge: &CfaEdge, cfa: &Cfa) -> Result<Vec<StateRef>> {
        let s = cast::<C::State>(state, self.label())?;
        let p = cast::<C::Precision>(precision, self.label())?;
        let successors = self.abstract_successors(s, p, edge, cfa)?;
        Ok(successors.into_iter().map(erase).collect())
    }

    fn merge_into(&self, new: &dyn DynState, reached: &dyn DynState) -> Result<StateRef> {
        let n = cast::<C::State>(new, self.label())?;
        let r = cast::<C::State>(reached, self.label())?;
        match self.merge_operator() {
            MergePolicy::Sep => Ok(erase(merge_sep(n, r))),
            MergePolicy::Join => merge_join(self, n, r)
                .map(erase)
                .ok_or_else(|| CpaError::JoinUnsupported(self.label().to_string())),
        }
    }

    fn covered_by(&self, state: &dyn DynState, reached: &dyn DynState) -> Result<bool> {
        let s = cast::<C::State>(state, self.label())?;
        let r = cast::<C::State>(reached, self.label())?;
        match self.stop_operator() {
            StopPolicy::Sep => Ok(stop_sep(self, s, [r])),
            StopPolicy::Join => {
                stop_join(self, s, [r]).ok_or_else(|| CpaError::JoinUnsupported(self.label().to_string()))
            }
            StopPolicy::Never => Ok(stop_never(s)),
        }
    }

    fn adjust(
        &self,
        state: &dyn DynState,
        precision: &dyn DynState,
        reached: &ReachedSet,
        index: usize,
    ) -> Result<Option<(StateRef, StateRef, Action)>> {
        let s = cast::<C::State>(state, self.label())?;
        let p = cast::<C::Precision>(precision, self.label())?;
        let view = ProjectedReached::new(reached, index);
        let result = self.prec(s, p, &view);
        Ok(result.map(|r| (erase(r.state), erase(r.precision), r.action)))
    }

    fn target(&self, state: &dyn DynState) -> Result<bool> {
        Ok(self.is_target(cast::<C::State>(state, self.label())?))
    }

    fn unsound(&self, state: &dyn DynState) -> Result<bool> {
        Ok(self.is_unsound(cast::<C::State>(state, self.label())?))
    }

    fn function_summary(
        &self,
        state: &dyn DynState,
        precision: &dyn DynState,
        summaries: &[Arc<dyn SummaryInstance>],
        call_edge: &CfaEdge,
        summary_edge: &CfaEdge,
    ) -> Result<Option<Vec<StateRef>>> {
        let s = cast::<C::State>(state, self.label())?;
        let p = cast::<C::Precision>(precision, self.label())?;
        let result = self.apply_function_summary(s, p, summaries, call_edge, summary_edge)?;
        Ok(result.map(|v| v.into_iter().map(erase).collect()))
    }

    fn external_loop_summary(
        &self,
        state: &dyn DynState,
        precision: &dyn DynState,
        summaries: &[Arc<dyn SummaryInstance>],
        loop_info: &Loop,
    ) -> Result<Option<Vec<(EdgeId, StateRef)>>> {
        let s = cast::<C::State>(state, self.label())?;
        let p = cast::<C::Precision>(precision, self.label())?;
        let result = self.apply_external_loop_summary(s, p, summaries, loop_info)?;
        Ok(result.map(|v| v.into_iter().map(|(e, s)| (e, erase(s))).collect()))
    }

    fn internal_loop_summary(
        &self,
        state: &dyn DynState,
        precision: &dyn DynState,
        summaries: &[Arc<dyn SummaryInstance>],
        loop_info: &Loop,
        edge: &CfaEdge,
    ) -> Result<Option<Vec<StateRef>>> {
        let s = cast::<C::State>(state, self.label())?;
        let p = cast::<C::Precision>(precision, self.label())?;
        let result = self.apply_internal_loop_summary(s, p, summaries, loop_info, edge)?;
        Ok(result.map(|v| v.into_iter().map(erase).collect()))
    }

    fn condition(&mut self) -> Option<&mut dyn AdjustableCondition> {
        self.as_adjustable_condition()
    }

    fn condition_ref(&self) -> Option<&dyn AdjustableCondition> {
        self.adjustable_condition()
    }

    fn adjusts_reached_set(&self) -> bool {
        self.as_reached_set_adjusting().is_some()
    }

    fn invalidated(&self, state: &dyn DynState) -> Result<bool> {
        let Some(adjusting) = self.as_reached_set_adjusting() else {
            return Ok(false);
        };
        Ok(adjusting.is_invalidated(cast::<C::State>(state, self.label())?))
    }
}

/// Cartesian product of per-component successor lists.
fn product(location: NodeId, per_component: &[Vec<StateRef>]) -> Vec<CompositeState> {
    if per_component.iter().any(|v| v.is_empty()) {
        return Vec::new();
    }
    let mut result: Vec<Vec<StateRef>> = vec![Vec::with_capacity(per_component.len())];
    for options in per_component {
        let mut next = Vec::with_capacity(result.len() * options.len());
        for prefix in &result {
            for option in options {
                let mut v = prefix.clone();
                v.push(option.clone());
                next.push(v);
            }
        }
        result = next;
    }
    result.into_iter().map(|c| CompositeState::new(location, c)).collect()
}

/// Default bound on precision-adjustment rounds per state.
pub const DEFAULT_PRECISION_ROUNDS: usize = 8;

/// An ordered composition of analyses.
///
/// # Examples
///
/// ```
/// use cpa_rs::composite::CompositeCpa;
/// use cpa_rs::conditions::{ConditionThreshold, PathLengthCpa, TargetLocationCpa};
/// use cpa_rs::types::NodeId;
///
/// let cpa = CompositeCpa::new()
///     .with(TargetLocationCpa::new([NodeId::new(3)]))
///     .with(PathLengthCpa::new(ConditionThreshold::fixed(10)));
/// assert_eq!(cpa.names(), vec!["TargetLocationCPA", "PathLengthCPA"]);
/// ```
pub struct CompositeCpa {
    components: Vec<Box<dyn DynCpa>>,
    precision_rounds: usize,
}

impl Default for CompositeCpa {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompositeCpa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeCpa")
            .field("components", &self.names())
            .field("precision_rounds", &self.precision_rounds)
            .finish()
    }
}

impl CompositeCpa {
    pub fn new() -> Self {
        Self {
            components: Vec::new(),
            precision_rounds: DEFAULT_PRECISION_ROUNDS,
        }
    }

    /// Appends an analysis; returns `self` for chaining.
    pub fn with<C>(mut self, cpa: C) -> Self
    where
        C: ConfigurableProgramAnalysis + 'static,
    {
        self.push(cpa);
        self
    }

    /// Appends an analysis and returns its component index.
    pub fn push<C>(&mut self, cpa: C) -> usize
    where
        C: ConfigurableProgramAnalysis + 'static,
    {
        self.components.push(Box::new(cpa));
        self.components.len() - 1
    }

    /// Sets the bound on precision-adjustment rounds (at least one).
    pub fn with_precision_rounds(mut self, rounds: usize) -> Self {
        self.precision_rounds = rounds.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.components.iter().map(|c| c.label()).collect()
    }

    pub fn name_of(&self, index: usize) -> &str {
        self.components[index].label()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.components.iter().position(|c| c.label() == name)
    }

    fn check_arity(&self, actual: usize) -> Result<()> {
        if actual != self.components.len() {
            return Err(CpaError::ComponentMismatch {
                expected: self.components.len(),
                actual,
            });
        }
        Ok(())
    }

    pub fn initial_state(&self, node: NodeId, partition: &StateSpacePartition) -> CompositeState {
        let components = self.components.iter().map(|c| c.initial(node, partition)).collect();
        CompositeState::new(node, components)
    }

    pub fn initial_precision(&self, node: NodeId, partition: &StateSpacePartition) -> CompositePrecision {
        CompositePrecision::new(self.components.iter().map(|c| c.initial_prec(node, partition)).collect())
    }

    /// Successors along `edge`: the product of all component successors.
    pub fn successors(
        &self,
        state: &CompositeState,
        precision: &CompositePrecision,
        edge: &CfaEdge,
        cfa: &Cfa,
    ) -> Result<Vec<CompositeState>> {
        self.check_arity(state.len())?;
        let mut per_component = Vec::with_capacity(self.components.len());
        for (i, cpa) in self.components.iter().enumerate() {
            let successors = cpa.successors(&*state.components[i], &*precision.components[i], edge, cfa)?;
            if successors.is_empty() {
                trace!("{} infeasible for {} on {}", edge.id, cpa.label(), state.location);
                return Ok(Vec::new());
            }
            per_component.push(successors);
        }
        Ok(product(edge.successor, &per_component))
    }

    /// Agree merge of `new` into `reached`.
    ///
    /// Returns `Some(merged)` when the reached state must be replaced, and
    /// `None` when the states stay separate (some `Sep` component differs) or
    /// the join adds nothing.
    pub fn merge(&self, new: &CompositeState, reached: &CompositeState) -> Result<Option<CompositeState>> {
        self.check_arity(new.len())?;
        if new.location != reached.location {
            return Ok(None);
        }
        let mut merged = Vec::with_capacity(self.components.len());
        let mut changed = false;
        for (i, cpa) in self.components.iter().enumerate() {
            let (n, r) = (&*new.components[i], &reached.components[i]);
            if cpa.merge_policy() == MergePolicy::Sep && !n.dyn_eq(&**r) {
                return Ok(None);
            }
            let component = cpa.merge_into(n, &**r)?;
            changed |= !component.dyn_eq(&**r);
            merged.push(component);
        }
        Ok(changed.then(|| CompositeState::new(reached.location, merged)))
    }

    /// Returns the first candidate covering `state`, if any.
    pub fn stop<'a, I>(&self, state: &CompositeState, candidates: I) -> Result<Option<ArgId>>
    where
        I: IntoIterator<Item = (ArgId, &'a CompositeState)>,
    {
        self.check_arity(state.len())?;
        'candidates: for (id, reached) in candidates {
            for (i, cpa) in self.components.iter().enumerate() {
                if !cpa.covered_by(&*state.components[i], &*reached.components[i])? {
                    continue 'candidates;
                }
            }
            return Ok(Some(id));
        }
        Ok(None)
    }

    /// Precision adjustment, iterated until no component changes anything.
    ///
    /// Returns `None` if some component drops the state.
    pub fn prec(
        &self,
        state: &CompositeState,
        precision: &CompositePrecision,
        reached: &ReachedSet,
    ) -> Result<Option<(CompositeState, CompositePrecision, Action)>> {
        self.check_arity(state.len())?;
        let mut states: Vec<StateRef> = state.components.to_vec();
        let mut precisions: Vec<StateRef> = precision.components.to_vec();
        let mut active = vec![true; self.components.len()];
        let mut action = Action::Disabled;

        for round in 0..self.precision_rounds {
            let mut modified = false;
            for (i, cpa) in self.components.iter().enumerate() {
                if !active[i] {
                    continue;
                }
                let Some((s, p, a)) = cpa.adjust(&*states[i], &*precisions[i], reached, i)? else {
                    trace!("{} dropped state at {}", cpa.label(), state.location);
                    return Ok(None);
                };
                if a == Action::Disabled {
                    active[i] = false;
                }
                action = action.update(a);
                if !s.dyn_eq(&*states[i]) {
                    states[i] = s;
                    modified = true;
                }
                if !p.dyn_eq(&*precisions[i]) {
                    precisions[i] = p;
                    modified = true;
                }
            }
            if !modified {
                break;
            }
            trace!("precision adjustment round {} modified state at {}", round, state.location);
        }

        Ok(Some((
            CompositeState::new(state.location, states),
            CompositePrecision::new(precisions),
            action,
        )))
    }

    pub fn is_target(&self, state: &CompositeState) -> Result<bool> {
        for (i, cpa) in self.components.iter().enumerate() {
            if cpa.target(&*state.components[i])? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn is_unsound(&self, state: &CompositeState) -> Result<bool> {
        for (i, cpa) in self.components.iter().enumerate() {
            if cpa.unsound(&*state.components[i])? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Applies function summaries at a call site.
    ///
    /// Returns `None` if no component consumes summaries. Non-consuming
    /// components keep their state.
    pub fn apply_function_summary(
        &self,
        state: &CompositeState,
        precision: &CompositePrecision,
        summaries: &[Arc<dyn SummaryInstance>],
        call_edge: &CfaEdge,
        summary_edge: &CfaEdge,
    ) -> Result<Option<Vec<CompositeState>>> {
        self.check_arity(state.len())?;
        let mut consumed = false;
        let mut per_component = Vec::with_capacity(self.components.len());
        for (i, cpa) in self.components.iter().enumerate() {
            let (s, p) = (&state.components[i], &*precision.components[i]);
            match cpa.function_summary(&**s, p, summaries, call_edge, summary_edge)? {
                Some(v) => {
                    consumed = true;
                    per_component.push(v);
                }
                None => per_component.push(vec![s.clone()]),
            }
        }
        Ok(consumed.then(|| product(summary_edge.successor, &per_component)))
    }

    /// Applies external loop summaries at a loop-entering state.
    ///
    /// Each successor is paired with the exit edge it leaves the loop
    /// through and is located at that edge's successor. Fails if a component
    /// names an edge that does not exit the loop.
    pub fn apply_external_loop_summary(
        &self,
        state: &CompositeState,
        precision: &CompositePrecision,
        summaries: &[Arc<dyn SummaryInstance>],
        loop_info: &Loop,
        cfa: &Cfa,
    ) -> Result<Option<Vec<(EdgeId, CompositeState)>>> {
        self.check_arity(state.len())?;
        let mut results: Vec<Option<Vec<(EdgeId, StateRef)>>> = Vec::with_capacity(self.components.len());
        let mut exits: Vec<EdgeId> = Vec::new();
        for (i, cpa) in self.components.iter().enumerate() {
            let result =
                cpa.external_loop_summary(&*state.components[i], &*precision.components[i], summaries, loop_info)?;
            if let Some(pairs) = &result {
                for &(edge, _) in pairs {
                    if !loop_info.exit_edges.contains(&edge) {
                        return Err(CpaError::InvalidSummaryExit {
                            loop_id: loop_info.id,
                            edge,
                        });
                    }
                    if !exits.contains(&edge) {
                        exits.push(edge);
                    }
                }
            }
            results.push(result);
        }
        if results.iter().all(Option::is_none) {
            return Ok(None);
        }

        let mut successors = Vec::new();
        for exit in exits {
            let per_component: Vec<Vec<StateRef>> = results
                .iter()
                .enumerate()
                .map(|(i, result)| match result {
                    Some(pairs) => pairs.iter().filter(|(e, _)| *e == exit).map(|(_, s)| s.clone()).collect(),
                    None => vec![state.components[i].clone()],
                })
                .collect();
            let location = cfa.edge(exit).successor;
            successors.extend(product(location, &per_component).into_iter().map(|s| (exit, s)));
        }
        Ok(Some(successors))
    }

    /// Applies internal loop summaries to a state that just entered the loop via `edge`.
    pub fn apply_internal_loop_summary(
        &self,
        state: &CompositeState,
        precision: &CompositePrecision,
        summaries: &[Arc<dyn SummaryInstance>],
        loop_info: &Loop,
        edge: &CfaEdge,
    ) -> Result<Option<Vec<CompositeState>>> {
        self.check_arity(state.len())?;
        let mut consumed = false;
        let mut per_component = Vec::with_capacity(self.components.len());
        for (i, cpa) in self.components.iter().enumerate() {
            let (s, p) = (&state.components[i], &*precision.components[i]);
            match cpa.internal_loop_summary(&**s, p, summaries, loop_info, edge)? {
                Some(v) => {
                    consumed = true;
                    per_component.push(v);
                }
                None => per_component.push(vec![s.clone()]),
            }
        }
        Ok(consumed.then(|| product(state.location, &per_component)))
    }

    /// Indices of components with an adjustable condition.
    pub fn adjustable_conditions(&self) -> Vec<usize> {
        (0..self.components.len())
            .filter(|&i| self.components[i].condition_ref().is_some())
            .collect()
    }

    /// Raises the condition of component `index`.
    ///
    /// Returns `None` if that component has no adjustable condition.
    pub fn adjust_condition(&mut self, index: usize) -> Option<bool> {
        self.components.get_mut(index)?.condition().map(|c| c.adjust_precision())
    }

    pub fn condition_threshold(&self, index: usize) -> Option<u64> {
        self.components.get(index)?.condition_ref()?.threshold()
    }

    /// Whether some component can invalidate reached states after adjustment.
    pub fn adjusts_reached_set(&self) -> bool {
        self.components.iter().any(|c| c.adjusts_reached_set())
    }

    pub fn component_adjusts_reached_set(&self, index: usize) -> bool {
        self.components[index].adjusts_reached_set()
    }

    /// Whether some component considers `state` invalidated by the last adjustment.
    pub fn is_invalidated(&self, state: &CompositeState) -> Result<bool> {
        self.check_arity(state.len())?;
        for (i, cpa) in self.components.iter().enumerate() {
            if cpa.invalidated(&*state.components[i])? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::cfa::CfaBuilder;
    use crate::domain::{AbstractDomain, PrecisionAdjustmentResult};
    use crate::error::TransferError;
    use crate::waitlist::TraversalOrder;

    /// Counts up to `max` along every edge; joins by taking the maximum.
    #[derive(Debug)]
    struct Counter {
        max: u32,
        merge: MergePolicy,
        stop: StopPolicy,
    }

    impl Counter {
        fn new(max: u32) -> Self {
            Self {
                max,
                merge: MergePolicy::Sep,
                stop: StopPolicy::Sep,
            }
        }
    }

    impl AbstractDomain for Counter {
        type State = u32;

        fn is_less_or_equal(&self, a: &u32, b: &u32) -> bool {
            a <= b
        }

        fn join(&self, a: &u32, b: &u32) -> Option<u32> {
            Some(*a.max(b))
        }
    }

    impl ConfigurableProgramAnalysis for Counter {
        type Precision = ();

        fn name(&self) -> &str {
            "Counter"
        }

        fn initial_state(&self, _: NodeId, _: &StateSpacePartition) -> u32 {
            0
        }

        fn initial_precision(&self, _: NodeId, _: &StateSpacePartition) {}

        fn abstract_successors(&self, state: &u32, _: &(), edge: &CfaEdge, _: &Cfa) -> Result<Vec<u32>, TransferError> {
            if edge.description == "fail" {
                return Err(TransferError::unsupported(edge.id, "fail"));
            }
            Ok(if *state < self.max { vec![state + 1] } else { vec![] })
        }

        fn merge_operator(&self) -> MergePolicy {
            self.merge
        }

        fn stop_operator(&self) -> StopPolicy {
            self.stop
        }

        fn is_target(&self, state: &u32) -> bool {
            *state == self.max
        }
    }

    /// Splits into two parities; precision adjustment breaks on odd values.
    #[derive(Debug)]
    struct Parity;

    impl AbstractDomain for Parity {
        type State = bool;

        fn is_less_or_equal(&self, a: &bool, b: &bool) -> bool {
            a == b
        }
    }

    impl ConfigurableProgramAnalysis for Parity {
        type Precision = u8;

        fn name(&self) -> &str {
            "Parity"
        }

        fn initial_state(&self, _: NodeId, _: &StateSpacePartition) -> bool {
            false
        }

        fn initial_precision(&self, _: NodeId, _: &StateSpacePartition) -> u8 {
            0
        }

        fn abstract_successors(&self, _: &bool, _: &u8, _: &CfaEdge, _: &Cfa) -> Result<Vec<bool>, TransferError> {
            Ok(vec![false, true])
        }

        fn prec(
            &self,
            state: &bool,
            precision: &u8,
            _: &ProjectedReached<'_, bool>,
        ) -> Option<PrecisionAdjustmentResult<bool, u8>> {
            let action = if *state { Action::Break } else { Action::Continue };
            Some(PrecisionAdjustmentResult::new(*state, (*precision).max(1), action))
        }
    }

    fn edge_cfa(description: &str) -> Cfa {
        let mut b = CfaBuilder::new("main");
        let (entry, exit) = b.function("main");
        b.statement(entry, exit, description);
        b.build().unwrap()
    }

    #[test]
    fn test_dyn_state_equality() {
        let a: StateRef = Arc::new(3u32);
        let b: StateRef = Arc::new(3u32);
        let c: StateRef = Arc::new(3u64);
        assert!(a.dyn_eq(&*b));
        assert!(!a.dyn_eq(&*c));
    }

    #[test]
    fn test_successors_product() {
        let cfa = edge_cfa("x++");
        let cpa = CompositeCpa::new().with(Counter::new(5)).with(Parity);
        let entry = cfa.main_entry();
        let p = StateSpacePartition::default();
        let s0 = cpa.initial_state(entry, &p);
        let pr = cpa.initial_precision(entry, &p);
        let edge = cfa.leaving_edges(entry).next().unwrap();

        let succ = cpa.successors(&s0, &pr, edge, &cfa).unwrap();
        assert_eq!(succ.len(), 2);
        for s in &succ {
            assert_eq!(s.location(), edge.successor);
            assert_eq!(s.component::<u32>(0), Some(&1));
        }
        assert_eq!(succ[0].component::<bool>(1), Some(&false));
        assert_eq!(succ[1].component::<bool>(1), Some(&true));
        assert_eq!(succ[1].find::<bool>(), Some(&true));
    }

    #[test]
    fn test_infeasible_component_kills_successor() {
        let cfa = edge_cfa("x++");
        let cpa = CompositeCpa::new().with(Counter::new(0)).with(Parity);
        let entry = cfa.main_entry();
        let p = StateSpacePartition::default();
        let edge = cfa.leaving_edges(entry).next().unwrap();
        let succ = cpa
            .successors(&cpa.initial_state(entry, &p), &cpa.initial_precision(entry, &p), edge, &cfa)
            .unwrap();
        assert!(succ.is_empty());
    }

    #[test]
    fn test_transfer_error_propagates() {
        let cfa = edge_cfa("fail");
        let cpa = CompositeCpa::new().with(Counter::new(5));
        let entry = cfa.main_entry();
        let p = StateSpacePartition::default();
        let edge = cfa.leaving_edges(entry).next().unwrap();
        let err = cpa
            .successors(&cpa.initial_state(entry, &p), &cpa.initial_precision(entry, &p), edge, &cfa)
            .unwrap_err();
        assert!(matches!(err, CpaError::Transfer(_)));
    }

    fn state(values: (u32, bool)) -> CompositeState {
        CompositeState::new(NodeId::new(0), vec![Arc::new(values.0), Arc::new(values.1)])
    }

    #[test]
    fn test_agree_merge() {
        let join = Counter {
            merge: MergePolicy::Join,
            ..Counter::new(9)
        };
        let cpa = CompositeCpa::new().with(join).with(Parity);

        // Sep component agrees, Join component joins.
        let merged = cpa.merge(&state((5, true)), &state((2, true))).unwrap();
        assert_eq!(merged, Some(state((5, true))));

        // Sep component disagrees: no merge.
        assert_eq!(cpa.merge(&state((5, true)), &state((2, false))).unwrap(), None);

        // Join adds nothing: no merge.
        assert_eq!(cpa.merge(&state((1, true)), &state((2, true))).unwrap(), None);
    }

    #[test]
    fn test_merge_without_join_fails() {
        let cpa = CompositeCpa::new().with(Parity).with(Counter::new(1));
        #[derive(Debug)]
        struct NoJoin;
        impl AbstractDomain for NoJoin {
            type State = u32;
            fn is_less_or_equal(&self, a: &u32, b: &u32) -> bool {
                a == b
            }
        }
        impl ConfigurableProgramAnalysis for NoJoin {
            type Precision = ();
            fn name(&self) -> &str {
                "NoJoin"
            }
            fn initial_state(&self, _: NodeId, _: &StateSpacePartition) -> u32 {
                0
            }
            fn initial_precision(&self, _: NodeId, _: &StateSpacePartition) {}
            fn abstract_successors(&self, s: &u32, _: &(), _: &CfaEdge, _: &Cfa) -> Result<Vec<u32>, TransferError> {
                Ok(vec![*s])
            }
            fn merge_operator(&self) -> MergePolicy {
                MergePolicy::Join
            }
        }
        let bad = CompositeCpa::new().with(NoJoin);
        let a = CompositeState::new(NodeId::new(0), vec![Arc::new(1u32)]);
        let b = CompositeState::new(NodeId::new(0), vec![Arc::new(2u32)]);
        assert!(matches!(bad.merge(&a, &b), Err(CpaError::JoinUnsupported(name)) if name == "NoJoin"));
        assert!(matches!(
            cpa.merge(&a, &b),
            Err(CpaError::ComponentMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_stop_is_conjunction() {
        let cpa = CompositeCpa::new().with(Counter::new(9)).with(Parity);
        let r1 = state((5, false));
        let r2 = state((5, true));
        let candidates = [(ArgId::new(1), &r1), (ArgId::new(2), &r2)];

        assert_eq!(cpa.stop(&state((3, true)), candidates).unwrap(), Some(ArgId::new(2)));
        assert_eq!(cpa.stop(&state((3, false)), candidates).unwrap(), Some(ArgId::new(1)));
        assert_eq!(cpa.stop(&state((7, true)), candidates).unwrap(), None);

        let never = Counter {
            stop: StopPolicy::Never,
            ..Counter::new(9)
        };
        let cpa = CompositeCpa::new().with(never).with(Parity);
        assert_eq!(cpa.stop(&state((3, true)), candidates).unwrap(), None);

        // Join stop compares against each candidate on its own.
        let join = Counter {
            stop: StopPolicy::Join,
            ..Counter::new(9)
        };
        let cpa = CompositeCpa::new().with(join).with(Parity);
        assert_eq!(cpa.stop(&state((3, true)), candidates).unwrap(), Some(ArgId::new(2)));
        assert_eq!(cpa.stop(&state((6, false)), candidates).unwrap(), None);
    }

    #[test]
    fn test_condition_thresholds_through_shared_reference() {
        use crate::conditions::{ConditionThreshold, LoopBoundCpa, ThresholdAdjuster};

        let mut cpa = CompositeCpa::new()
            .with(Parity)
            .with(LoopBoundCpa::new(ConditionThreshold::new(2, ThresholdAdjuster::Double)));
        let shared = &cpa;
        assert_eq!(shared.adjustable_conditions(), vec![1]);
        assert_eq!(shared.condition_threshold(0), None);
        assert_eq!(shared.condition_threshold(1), Some(2));
        assert_eq!(shared.condition_threshold(7), None);

        assert_eq!(cpa.adjust_condition(1), Some(true));
        assert_eq!(cpa.adjust_condition(7), None);
        assert_eq!(cpa.condition_threshold(1), Some(4));
    }

    #[test]
    fn test_prec_actions() {
        let cpa = CompositeCpa::new().with(Counter::new(9)).with(Parity);
        let reached = ReachedSet::new(TraversalOrder::Dfs);
        let precision = cpa.initial_precision(NodeId::new(0), &StateSpacePartition::default());

        let (s, p, action) = cpa.prec(&state((1, true)), &precision, &reached).unwrap().unwrap();
        assert_eq!(action, Action::Break);
        assert_eq!(s, state((1, true)));
        assert_eq!(p.component::<u8>(1), Some(&1));

        let (_, _, action) = cpa.prec(&state((1, false)), &precision, &reached).unwrap().unwrap();
        assert_eq!(action, Action::Continue);
    }

    #[test]
    fn test_target_and_names() {
        let cpa = CompositeCpa::new().with(Counter::new(3)).with(Parity);
        assert!(cpa.is_target(&state((3, false))).unwrap());
        assert!(!cpa.is_target(&state((2, false))).unwrap());
        assert!(!cpa.is_unsound(&state((3, false))).unwrap());
        assert_eq!(cpa.names(), vec!["Counter", "Parity"]);
        assert_eq!(cpa.index_of("Parity"), Some(1));
        assert!(!cpa.adjusts_reached_set());
    }
}
