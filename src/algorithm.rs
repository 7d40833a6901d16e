//! The reachability algorithm.
//!
//! [`CpaAlgorithm::run`] pops states from the waitlist of a [`ReachedSet`]
//! and expands them along every leaving CFA edge. Each successor goes
//! through precision adjustment, then merge against the reached states at
//! the same location, then the stop check; survivors become reached and
//! waiting. The run ends when the waitlist is empty, when a target is found
//! (if configured), or when the [`ShutdownNotifier`] fires.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::cfa::{Cfa, CfaEdge, EdgeKind};
use crate::composite::{CompositeCpa, CompositePrecision, CompositeState};
use crate::domain::Action;
use crate::error::{CpaError, Result, TransferError};
use crate::reached::{ReachedSet, StateSpacePartition};
use crate::shutdown::ShutdownNotifier;
use crate::summary::{LoopSummaryKind, SummaryInstance, SummaryProvider};
use crate::types::{ArgId, EdgeId};

#[derive(Debug, Clone)]
pub struct AlgorithmOptions {
    /// End the run at the first target state (default: true).
    pub stop_at_first_target: bool,
    /// Abort on transfer failures instead of dropping the branch (default: false).
    pub fatal_transfer_errors: bool,
}

impl Default for AlgorithmOptions {
    fn default() -> Self {
        Self {
            stop_at_first_target: true,
            fatal_transfer_errors: false,
        }
    }
}

/// Soundness and completeness of a run.
///
/// A run is complete if it explored the whole state space, and sound unless
/// some domain was forced into an approximation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AlgorithmStatus {
    pub sound: bool,
    pub complete: bool,
}

impl AlgorithmStatus {
    pub const SOUND_AND_COMPLETE: AlgorithmStatus = AlgorithmStatus {
        sound: true,
        complete: true,
    };

    /// Conjunction of both flags.
    pub fn update(self, other: AlgorithmStatus) -> AlgorithmStatus {
        AlgorithmStatus {
            sound: self.sound && other.sound,
            complete: self.complete && other.complete,
        }
    }

    pub fn with_sound(self, sound: bool) -> AlgorithmStatus {
        AlgorithmStatus { sound, ..self }
    }

    pub fn with_complete(self, complete: bool) -> AlgorithmStatus {
        AlgorithmStatus { complete, ..self }
    }
}

impl Default for AlgorithmStatus {
    fn default() -> Self {
        Self::SOUND_AND_COMPLETE
    }
}

impl fmt::Display for AlgorithmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sound={}, complete={}", self.sound, self.complete)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlgorithmStatistics {
    /// States popped from the waitlist.
    pub iterations: usize,
    /// Successors produced by transfer or summary application.
    pub successors: usize,
    pub merges: usize,
    pub covered: usize,
    /// Successors stopped by precision adjustment.
    pub breaks: usize,
    /// Successors dropped as infeasible by precision adjustment.
    pub dropped: usize,
    pub summary_applications: usize,
    pub targets: usize,
    /// Recoverable failures, one per dropped branch.
    pub transfer_errors: Vec<TransferError>,
    pub duration: Duration,
}

impl fmt::Display for AlgorithmStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "iterations:           {}", self.iterations)?;
        writeln!(f, "successors:           {}", self.successors)?;
        writeln!(f, "merges:               {}", self.merges)?;
        writeln!(f, "covered:              {}", self.covered)?;
        writeln!(f, "breaks:               {}", self.breaks)?;
        writeln!(f, "dropped:              {}", self.dropped)?;
        writeln!(f, "summary applications: {}", self.summary_applications)?;
        writeln!(f, "targets:              {}", self.targets)?;
        writeln!(f, "transfer errors:      {}", self.transfer_errors.len())?;
        write!(f, "time:                 {:?}", self.duration)
    }
}

#[derive(Debug, Clone)]
pub struct AlgorithmResult {
    pub status: AlgorithmStatus,
    pub statistics: AlgorithmStatistics,
    /// Target states found by this run.
    pub targets: Vec<ArgId>,
    /// Shutdown reason, if the run was interrupted.
    pub interrupted: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct RunState {
    status: AlgorithmStatus,
    statistics: AlgorithmStatistics,
    targets: Vec<ArgId>,
    interrupted: Option<String>,
}

/// A successor after precision adjustment.
struct Candidate {
    edge: EdgeId,
    state: CompositeState,
    precision: CompositePrecision,
    target: bool,
}

/// A reached state replaced by its merge with a candidate.
struct Merged {
    id: ArgId,
    /// The replaced state was an ancestor of the expanded one.
    cyclic: bool,
    target: bool,
}

/// The worklist algorithm over a composite analysis.
#[derive(Debug, Clone)]
pub struct CpaAlgorithm<'a> {
    cpa: &'a CompositeCpa,
    cfa: &'a Cfa,
    options: AlgorithmOptions,
    summaries: Option<&'a SummaryProvider>,
}

impl<'a> CpaAlgorithm<'a> {
    pub fn new(cpa: &'a CompositeCpa, cfa: &'a Cfa, options: AlgorithmOptions) -> Self {
        Self {
            cpa,
            cfa,
            options,
            summaries: None,
        }
    }

    /// Uses `provider` to replace calls and loops by their summaries.
    pub fn with_summaries(mut self, provider: &'a SummaryProvider) -> Self {
        self.summaries = Some(provider);
        self
    }

    pub fn options(&self) -> &AlgorithmOptions {
        &self.options
    }

    /// Explores from the waiting states of `reached` until the waitlist is
    /// empty or a stop condition fires.
    ///
    /// Recoverable transfer failures are recorded in the statistics. Any
    /// returned error is fatal and leaves `reached` valid up to the last
    /// fully processed state.
    pub fn run(&self, reached: &mut ReachedSet, shutdown: &ShutdownNotifier) -> Result<AlgorithmResult> {
        let start = Instant::now();
        let mut run = RunState {
            status: AlgorithmStatus::SOUND_AND_COMPLETE,
            statistics: AlgorithmStatistics::default(),
            targets: Vec::new(),
            interrupted: None,
        };
        info!(
            "starting reachability: {} reached, {} waiting, order {:?}",
            reached.len(),
            reached.waitlist_len(),
            reached.order()
        );

        if self.options.stop_at_first_target && !reached.targets().is_empty() {
            info!("reached set already contains a target");
            run.status.complete = false;
            return Ok(self.finish(run, reached, start));
        }

        while reached.has_waiting_state() {
            if shutdown.should_shutdown() {
                let reason = shutdown.reason().unwrap_or_else(|| "shutdown requested".to_string());
                info!("reachability interrupted: {}", reason);
                run.status.complete = false;
                run.interrupted = Some(reason);
                break;
            }
            let Some(id) = reached.pop_waiting() else {
                break;
            };
            run.statistics.iterations += 1;
            if self.expand(reached, id, &mut run)? == Flow::Stop {
                // Stopping at a target is sound but never complete.
                run.status.complete = false;
                break;
            }
        }

        Ok(self.finish(run, reached, start))
    }

    fn finish(&self, mut run: RunState, reached: &ReachedSet, start: Instant) -> AlgorithmResult {
        run.statistics.duration = start.elapsed();
        run.statistics.targets = run.targets.len();
        info!(
            "reachability finished after {} iterations in {:?}: {} reached, {} waiting, {} targets, {}",
            run.statistics.iterations,
            run.statistics.duration,
            reached.len(),
            reached.waitlist_len(),
            run.targets.len(),
            run.status
        );
        AlgorithmResult {
            status: run.status,
            statistics: run.statistics,
            targets: run.targets,
            interrupted: run.interrupted,
        }
    }

    fn expand(&self, reached: &mut ReachedSet, id: ArgId, run: &mut RunState) -> Result<Flow> {
        let node = reached.node(id)?;
        let state = node.state().clone();
        let precision = node.precision().clone();
        let partition = node.partition().clone();
        debug!("expanding {} at {}", id, state.location());
        reached.arg_mut().mark_expanded(id)?;

        let successors = self.successors(&state, &precision, run)?;
        let total = successors.len();
        let mut parent = id;
        for (i, (edge, successor)) in successors.into_iter().enumerate() {
            run.statistics.successors += 1;
            if self.handle_successor(reached, &mut parent, edge, successor, &precision, &partition, run)? == Flow::Stop {
                // Resume the remaining successors on the next run.
                if i + 1 < total && reached.contains(parent) {
                    reached.re_add_to_waitlist(parent)?;
                }
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// Turns a recoverable transfer failure into `None`. The dropped branch
    /// leaves the run incomplete.
    fn recover<T>(&self, result: Result<T>, run: &mut RunState) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(CpaError::Transfer(e)) if !self.options.fatal_transfer_errors => {
                warn!("dropping branch: {}", e);
                run.status.complete = false;
                run.statistics.transfer_errors.push(e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// All successors of `state`, each with the edge linking it in the ARG.
    fn successors(
        &self,
        state: &CompositeState,
        precision: &CompositePrecision,
        run: &mut RunState,
    ) -> Result<Vec<(EdgeId, CompositeState)>> {
        let mut result = Vec::new();
        for edge in self.cfa.leaving_edges(state.location()) {
            if let Some(summarized) = self.summarized_successors(state, precision, edge, run)? {
                result.extend(summarized);
                continue;
            }

            let Some(mut successors) = self.recover(self.cpa.successors(state, precision, edge, self.cfa), run)? else {
                continue;
            };
            if let (Some(provider), Some(loop_info)) = (self.summaries, self.cfa.entered_loop(edge)) {
                let internal = provider.loop_summaries(loop_info, LoopSummaryKind::Internal);
                if !internal.is_empty() {
                    let mut refined = Vec::with_capacity(successors.len());
                    for s in successors {
                        let applied = self.cpa.apply_internal_loop_summary(&s, precision, &internal, loop_info, edge);
                        match self.recover(applied, run)? {
                            Some(Some(v)) => {
                                run.statistics.summary_applications += 1;
                                refined.extend(v);
                            }
                            Some(None) => refined.push(s),
                            None => {}
                        }
                    }
                    successors = refined;
                }
            }
            result.extend(successors.into_iter().map(|s| (edge.id, s)));
        }
        Ok(result)
    }

    /// Successors along `edge` computed from summaries instead of transfer.
    ///
    /// Returns `None` if `edge` is not summarized, so that it is explored
    /// normally.
    fn summarized_successors(
        &self,
        state: &CompositeState,
        precision: &CompositePrecision,
        edge: &CfaEdge,
        run: &mut RunState,
    ) -> Result<Option<Vec<(EdgeId, CompositeState)>>> {
        let Some(provider) = self.summaries else {
            return Ok(None);
        };
        match &edge.kind {
            EdgeKind::FunctionCall { callee, summary_edge } => {
                let summaries = provider.function_summaries(self.cfa, callee);
                let summary_edge = self.cfa.edge(*summary_edge);
                self.apply_function_summary(state, precision, &summaries, edge, summary_edge, run)
            }
            EdgeKind::ExternalCall { callee } => {
                let summaries = provider.function_summaries(self.cfa, callee);
                self.apply_function_summary(state, precision, &summaries, edge, edge, run)
            }
            _ => {
                let Some(loop_info) = self.cfa.entered_loop(edge) else {
                    return Ok(None);
                };
                let summaries = provider.loop_summaries(loop_info, LoopSummaryKind::External);
                if summaries.is_empty() {
                    return Ok(None);
                }
                let applied = self
                    .cpa
                    .apply_external_loop_summary(state, precision, &summaries, loop_info, self.cfa);
                match self.recover(applied, run)? {
                    Some(Some(pairs)) => {
                        run.statistics.summary_applications += 1;
                        debug!("bypassed {} with {} summarized exits", loop_info.id, pairs.len());
                        Ok(Some(pairs))
                    }
                    Some(None) => Ok(None),
                    None => Ok(Some(Vec::new())),
                }
            }
        }
    }

    fn apply_function_summary(
        &self,
        state: &CompositeState,
        precision: &CompositePrecision,
        summaries: &[Arc<dyn SummaryInstance>],
        call_edge: &CfaEdge,
        summary_edge: &CfaEdge,
        run: &mut RunState,
    ) -> Result<Option<Vec<(EdgeId, CompositeState)>>> {
        if summaries.is_empty() {
            return Ok(None);
        }
        let applied = self
            .cpa
            .apply_function_summary(state, precision, summaries, call_edge, summary_edge);
        match self.recover(applied, run)? {
            Some(Some(successors)) => {
                run.statistics.summary_applications += 1;
                trace!("summarized call on {}", call_edge);
                Ok(Some(successors.into_iter().map(|s| (summary_edge.id, s)).collect()))
            }
            Some(None) => Ok(None),
            None => Ok(Some(Vec::new())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_successor(
        &self,
        reached: &mut ReachedSet,
        parent: &mut ArgId,
        edge: EdgeId,
        successor: CompositeState,
        precision: &CompositePrecision,
        partition: &StateSpacePartition,
        run: &mut RunState,
    ) -> Result<Flow> {
        let Some((state, precision, action)) = self.cpa.prec(&successor, precision, reached)? else {
            trace!("successor of {} on {} dropped by precision adjustment", parent, edge);
            run.statistics.dropped += 1;
            return Ok(Flow::Continue);
        };
        if self.cpa.is_unsound(&state)? {
            if run.status.sound {
                info!("unsound approximation at {}", state.location());
            }
            run.status.sound = false;
        }
        let candidate = Candidate {
            edge,
            target: self.cpa.is_target(&state)?,
            state,
            precision,
        };

        if action == Action::Break {
            let location = candidate.state.location();
            let target = candidate.target;
            let child = self.attach(reached, *parent, candidate, partition)?;
            reached.add_reached(child)?;
            run.statistics.breaks += 1;
            run.status.complete = false;
            debug!("exploration stopped at {} ({})", child, location);
            return Ok(if target { self.found_target(child, run) } else { Flow::Continue });
        }

        let location = candidate.state.location();
        let candidates: Vec<ArgId> = reached.at_location(partition, location).collect();
        let mut merged = Vec::new();
        for r in candidates {
            if let Some(state) = self.cpa.merge(&candidate.state, reached.state(r)?)? {
                merged.push(self.merge(reached, parent, r, state, &candidate, partition, run)?);
            }
        }
        if !merged.is_empty() {
            return self.absorb(reached, *parent, candidate, &merged, partition, run);
        }

        let coverer = {
            let candidates = reached
                .at_location(partition, location)
                .map(|r| reached.state(r).map(|s| (r, s)))
                .collect::<Result<Vec<_>>>()?;
            self.cpa.stop(&candidate.state, candidates)?
        };
        let target = candidate.target;
        let child = self.attach(reached, *parent, candidate, partition)?;
        if let Some(coverer) = coverer {
            reached.arg_mut().set_covered(child, coverer)?;
            run.statistics.covered += 1;
            trace!("{} covered by {}", child, coverer);
            return Ok(Flow::Continue);
        }
        if target {
            reached.add_reached(child)?;
            return Ok(self.found_target(child, run));
        }
        reached.add(child)?;
        Ok(Flow::Continue)
    }

    /// Creates an ARG state for `candidate` below `parent`.
    fn attach(
        &self,
        reached: &mut ReachedSet,
        parent: ArgId,
        candidate: Candidate,
        partition: &StateSpacePartition,
    ) -> Result<ArgId> {
        let edge = candidate.edge;
        let child = reached.create_state(candidate.state, candidate.precision, partition.clone(), candidate.target);
        reached.arg_mut().add_parent(child, parent, edge)?;
        Ok(child)
    }

    /// Replaces reached state `replaced` by `merged`, the merge of it with `candidate`.
    #[allow(clippy::too_many_arguments)]
    fn merge(
        &self,
        reached: &mut ReachedSet,
        parent: &mut ArgId,
        replaced: ArgId,
        merged: CompositeState,
        candidate: &Candidate,
        partition: &StateSpacePartition,
        run: &mut RunState,
    ) -> Result<Merged> {
        run.statistics.merges += 1;
        let target = self.cpa.is_target(&merged)?;
        // On a loop, `replaced` is an ancestor of the expanded state.
        let cyclic = reached.arg().reaches(replaced, *parent);

        let merged_id = reached.create_state(merged, candidate.precision.clone(), partition.clone(), target);
        reached.replace(replaced, merged_id)?;
        if replaced == *parent {
            *parent = merged_id;
        }
        if !cyclic {
            reached.arg_mut().add_parent(merged_id, *parent, candidate.edge)?;
        }
        if target {
            reached.remove_from_waitlist(merged_id);
        }
        debug!("merged successor of {} into {} (replacing {})", parent, merged_id, replaced);
        Ok(Merged {
            id: merged_id,
            cyclic,
            target,
        })
    }

    /// Links `candidate` to the states it was merged into. It is not added
    /// to the reached set, since every merged state covers it.
    fn absorb(
        &self,
        reached: &mut ReachedSet,
        parent: ArgId,
        candidate: Candidate,
        merged: &[Merged],
        partition: &StateSpacePartition,
        run: &mut RunState,
    ) -> Result<Flow> {
        let child = self.attach(reached, parent, candidate, partition)?;
        match merged.iter().find(|m| !m.cyclic) {
            Some(m) => reached.arg_mut().merge_into(child, m.id)?,
            // A parent link would close a cycle: the successor is covered instead.
            None => reached.arg_mut().set_covered(child, merged[0].id)?,
        }

        let mut flow = Flow::Continue;
        for m in merged.iter().filter(|m| m.target) {
            if self.found_target(m.id, run) == Flow::Stop {
                flow = Flow::Stop;
            }
        }
        Ok(flow)
    }

    fn found_target(&self, id: ArgId, run: &mut RunState) -> Flow {
        info!("found target state {}", id);
        run.targets.push(id);
        if self.options.stop_at_first_target {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use test_log::test;

    use super::*;
    use crate::cfa::CfaBuilder;
    use crate::conditions::{ConditionThreshold, LoopBoundCpa, TargetLocationCpa};
    use crate::domain::{AbstractDomain, ConfigurableProgramAnalysis, MergePolicy};
    use crate::types::NodeId;
    use crate::waitlist::TraversalOrder;

    /// The set of edges taken so far; merges by union.
    #[derive(Debug)]
    struct Trace {
        merge: MergePolicy,
    }

    impl AbstractDomain for Trace {
        type State = BTreeSet<EdgeId>;

        fn is_less_or_equal(&self, a: &Self::State, b: &Self::State) -> bool {
            a.is_subset(b)
        }

        fn join(&self, a: &Self::State, b: &Self::State) -> Option<Self::State> {
            Some(a.union(b).copied().collect())
        }
    }

    impl ConfigurableProgramAnalysis for Trace {
        type Precision = ();

        fn name(&self) -> &str {
            "Trace"
        }

        fn initial_state(&self, _: NodeId, _: &StateSpacePartition) -> Self::State {
            BTreeSet::new()
        }

        fn initial_precision(&self, _: NodeId, _: &StateSpacePartition) {}

        fn abstract_successors(
            &self,
            state: &Self::State,
            _: &(),
            edge: &CfaEdge,
            _: &Cfa,
        ) -> std::result::Result<Vec<Self::State>, TransferError> {
            if edge.description == "boom" {
                return Err(TransferError::unsupported(edge.id, "boom"));
            }
            let mut next = state.clone();
            next.insert(edge.id);
            Ok(vec![next])
        }

        fn merge_operator(&self) -> MergePolicy {
            self.merge
        }
    }

    fn run(cpa: &CompositeCpa, cfa: &Cfa, options: AlgorithmOptions) -> (ReachedSet, AlgorithmResult) {
        let mut reached = ReachedSet::for_cfa(TraversalOrder::Dfs, cfa);
        reached
            .initialize(cpa, cfa.main_entry(), StateSpacePartition::default())
            .unwrap();
        let result = CpaAlgorithm::new(cpa, cfa, options)
            .run(&mut reached, &ShutdownNotifier::new())
            .unwrap();
        reached.check_consistency().unwrap();
        (reached, result)
    }

    /// entry -> a | b -> exit
    fn diamond() -> (Cfa, [NodeId; 4]) {
        let mut b = CfaBuilder::new("main");
        let (entry, exit) = b.function("main");
        let left = b.node("main");
        let right = b.node("main");
        b.assume(entry, left, true, "c");
        b.assume(entry, right, false, "c");
        b.statement(left, exit, "x = 1");
        b.statement(right, exit, "x = 2");
        (b.build().unwrap(), [entry, left, right, exit])
    }

    #[test]
    fn test_single_edge() {
        let mut b = CfaBuilder::new("main");
        let (entry, exit) = b.function("main");
        b.statement(entry, exit, "x = 1");
        let cfa = b.build().unwrap();
        let cpa = CompositeCpa::new().with(TargetLocationCpa::new([]));

        let (reached, result) = run(&cpa, &cfa, AlgorithmOptions::default());
        assert_eq!(reached.len(), 2);
        assert!(!reached.has_waiting_state());
        assert_eq!(result.status, AlgorithmStatus::SOUND_AND_COMPLETE);
        assert!(result.targets.is_empty());
        assert_eq!(result.statistics.iterations, 2);
    }

    #[test]
    fn test_stop_at_first_target() {
        let (cfa, [_, left, right, _]) = diamond();
        let cpa = CompositeCpa::new().with(TargetLocationCpa::new([left, right]));

        let (reached, result) = run(&cpa, &cfa, AlgorithmOptions::default());
        assert_eq!(result.targets.len(), 1);
        assert!(!result.status.complete);
        assert!(result.status.sound);
        // The entry state waits again for its second successor.
        assert!(reached.has_waiting_state());

        let all = AlgorithmOptions {
            stop_at_first_target: false,
            ..AlgorithmOptions::default()
        };
        let (reached, result) = run(&cpa, &cfa, all);
        assert_eq!(result.targets.len(), 2);
        assert!(result.status.complete);
        assert_eq!(reached.targets().len(), 2);
        for t in reached.targets() {
            assert!(!reached.arg().node(t).unwrap().was_expanded());
        }
    }

    #[test]
    fn test_early_stop_is_incomplete_with_empty_waitlist() {
        let mut b = CfaBuilder::new("main");
        let (entry, exit) = b.function("main");
        b.statement(entry, exit, "reach_error()");
        let cfa = b.build().unwrap();
        let cpa = CompositeCpa::new().with(TargetLocationCpa::new([exit]));

        let (reached, result) = run(&cpa, &cfa, AlgorithmOptions::default());
        assert_eq!(result.targets.len(), 1);
        assert!(!reached.has_waiting_state());
        assert!(!result.status.complete);
        assert!(result.status.sound);
    }

    #[test]
    fn test_resume_after_target() {
        let (cfa, [_, left, right, _]) = diamond();
        let cpa = CompositeCpa::new().with(TargetLocationCpa::new([left, right]));
        let mut reached = ReachedSet::for_cfa(TraversalOrder::Bfs, &cfa);
        reached
            .initialize(&cpa, cfa.main_entry(), StateSpacePartition::default())
            .unwrap();
        let algorithm = CpaAlgorithm::new(&cpa, &cfa, AlgorithmOptions::default());
        let first = algorithm.run(&mut reached, &ShutdownNotifier::new()).unwrap();
        assert_eq!(first.targets.len(), 1);
        // Existing targets end the next run immediately.
        let second = algorithm.run(&mut reached, &ShutdownNotifier::new()).unwrap();
        assert_eq!(second.statistics.iterations, 0);
        assert!(!second.status.complete);
    }

    #[test]
    fn test_merge_join_shares_exit() {
        let (cfa, [_, left, right, exit]) = diamond();
        let cpa = CompositeCpa::new().with(Trace { merge: MergePolicy::Join });

        let (reached, result) = run(&cpa, &cfa, AlgorithmOptions::default());
        assert!(result.status.complete);
        assert_eq!(result.statistics.merges, 1);
        assert_eq!(reached.len(), 4);

        let p = StateSpacePartition::default();
        let at_exit: Vec<ArgId> = reached.at_location(&p, exit).collect();
        assert_eq!(at_exit.len(), 1);
        let node = reached.arg().node(at_exit[0]).unwrap();
        let parents: BTreeSet<NodeId> = node
            .parents()
            .map(|q| reached.arg().node(q).unwrap().location())
            .collect();
        assert_eq!(parents, BTreeSet::from([left, right]));
        assert_eq!(reached.state(at_exit[0]).unwrap().find::<BTreeSet<EdgeId>>().unwrap().len(), 4);
    }

    #[test]
    fn test_merge_against_every_reached_state() {
        let mut b = CfaBuilder::new("main");
        let (entry, exit) = b.function("main");
        b.statement(entry, exit, "x = 1");
        let cfa = b.build().unwrap();
        let edge = cfa.leaving_edges(entry).next().unwrap().id;
        let cpa = CompositeCpa::new().with(Trace { merge: MergePolicy::Join });

        let p = StateSpacePartition::default();
        let mut reached = ReachedSet::for_cfa(TraversalOrder::Dfs, &cfa);
        let root = reached.initialize(&cpa, entry, p.clone()).unwrap();
        // Two unexpanded states at `exit` that never met each other in a merge.
        for marker in [100, 101] {
            let trace = BTreeSet::from([EdgeId::new(marker)]);
            let state = CompositeState::new(exit, vec![std::sync::Arc::new(trace)]);
            let id = reached.create_state(state, cpa.initial_precision(exit, &p), p.clone(), false);
            reached.arg_mut().add_parent(id, root, edge).unwrap();
            reached.add_reached(id).unwrap();
        }

        let result = CpaAlgorithm::new(&cpa, &cfa, AlgorithmOptions::default())
            .run(&mut reached, &ShutdownNotifier::new())
            .unwrap();
        reached.check_consistency().unwrap();
        assert_eq!(result.statistics.merges, 2);
        let mut at_exit: Vec<BTreeSet<EdgeId>> = reached
            .at_location(&p, exit)
            .map(|id| reached.state(id).unwrap().find::<BTreeSet<EdgeId>>().unwrap().clone())
            .collect();
        at_exit.sort();
        assert_eq!(
            at_exit,
            vec![
                BTreeSet::from([edge, EdgeId::new(100)]),
                BTreeSet::from([edge, EdgeId::new(101)]),
            ]
        );
    }

    #[test]
    fn test_merge_sep_keeps_states_apart() {
        let (cfa, [.., exit]) = diamond();
        let cpa = CompositeCpa::new().with(Trace { merge: MergePolicy::Sep });
        let (reached, result) = run(&cpa, &cfa, AlgorithmOptions::default());
        assert_eq!(result.statistics.merges, 0);
        assert_eq!(reached.at_location(&StateSpacePartition::default(), exit).count(), 2);
    }

    /// entry -> head -> body -> head, head -> exit
    fn simple_loop() -> Cfa {
        let mut b = CfaBuilder::new("main");
        let (entry, exit) = b.function("main");
        let head = b.node("main");
        let body = b.node("main");
        b.statement(entry, head, "i = 0");
        b.assume(head, body, true, "i < n");
        b.statement(body, head, "i++");
        b.assume(head, exit, false, "i < n");
        b.add_loop(head, [body]);
        b.build().unwrap()
    }

    #[test]
    fn test_join_on_loop_converges() {
        let cfa = simple_loop();
        let cpa = CompositeCpa::new().with(Trace { merge: MergePolicy::Join });
        let (reached, result) = run(&cpa, &cfa, AlgorithmOptions::default());
        assert!(result.status.complete);
        assert!(result.statistics.merges >= 1);
        assert!(reached.arg().iter().any(|n| n.is_covered()));
        let p = StateSpacePartition::default();
        for node in cfa.nodes() {
            assert!(reached.at_location(&p, node.id).count() <= 1, "{} has several states", node.id);
        }
    }

    #[test]
    fn test_loop_bound_covers_iterations() {
        let cfa = simple_loop();
        let cpa = CompositeCpa::new().with(LoopBoundCpa::new(ConditionThreshold::fixed(5)));
        let (reached, result) = run(&cpa, &cfa, AlgorithmOptions::default());
        assert!(result.status.complete);
        assert_eq!(result.statistics.covered, 1);
        assert_eq!(reached.len(), 4);
    }

    #[test]
    fn test_break_makes_run_incomplete() {
        let cfa = simple_loop();
        let cpa = CompositeCpa::new()
            .with(Trace { merge: MergePolicy::Sep })
            .with(LoopBoundCpa::new(ConditionThreshold::fixed(1)));
        let (reached, result) = run(&cpa, &cfa, AlgorithmOptions::default());
        assert!(!result.status.complete);
        assert!(result.status.sound);
        assert_eq!(result.statistics.breaks, 1);
        assert!(!reached.has_waiting_state());
    }

    #[test]
    fn test_transfer_errors_drop_branch() {
        let mut b = CfaBuilder::new("main");
        let (entry, exit) = b.function("main");
        let bad = b.node("main");
        b.statement(entry, exit, "x = 1");
        b.statement(entry, bad, "boom");
        let cfa = b.build().unwrap();
        let cpa = CompositeCpa::new().with(Trace { merge: MergePolicy::Sep });

        let (reached, result) = run(&cpa, &cfa, AlgorithmOptions::default());
        assert_eq!(reached.len(), 2);
        assert_eq!(result.statistics.transfer_errors.len(), 1);
        assert!(!result.status.complete);
        assert!(result.status.sound);

        let mut reached = ReachedSet::for_cfa(TraversalOrder::Dfs, &cfa);
        reached.initialize(&cpa, entry, StateSpacePartition::default()).unwrap();
        let fatal = AlgorithmOptions {
            fatal_transfer_errors: true,
            ..AlgorithmOptions::default()
        };
        let err = CpaAlgorithm::new(&cpa, &cfa, fatal)
            .run(&mut reached, &ShutdownNotifier::new())
            .unwrap_err();
        assert!(matches!(err, CpaError::Transfer(_)));
    }

    #[test]
    fn test_shutdown_interrupts() {
        let cfa = simple_loop();
        let cpa = CompositeCpa::new().with(TargetLocationCpa::new([]));
        let mut reached = ReachedSet::for_cfa(TraversalOrder::Dfs, &cfa);
        reached
            .initialize(&cpa, cfa.main_entry(), StateSpacePartition::default())
            .unwrap();
        let shutdown = ShutdownNotifier::new();
        shutdown.request_shutdown("out of time");
        let result = CpaAlgorithm::new(&cpa, &cfa, AlgorithmOptions::default())
            .run(&mut reached, &shutdown)
            .unwrap();
        assert!(!result.status.complete);
        assert!(result.status.sound);
        assert_eq!(result.interrupted.as_deref(), Some("out of time"));
        assert_eq!(reached.waitlist_len(), 1);
    }

    #[test]
    fn test_status_update() {
        let incomplete = AlgorithmStatus::SOUND_AND_COMPLETE.with_complete(false);
        let unsound = AlgorithmStatus::default().with_sound(false);
        assert_eq!(
            incomplete.update(unsound),
            AlgorithmStatus {
                sound: false,
                complete: false
            }
        );
        assert_eq!(incomplete.to_string(), "sound=true, complete=false");
    }
}
