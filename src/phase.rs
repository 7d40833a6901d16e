//! Analysis phases and their execution order.
//!
//! A [`PhaseGraph`] holds phases connected by "runs before" links. The
//! sequential strategy repeatedly runs a ready phase (all ancestors done),
//! preferring phases in the order they were discovered as successors, and
//! stops at the first failing phase. Phases exchange data through a
//! [`PhaseContext`].

use std::fmt;

use log::{debug, info, warn};

use crate::algorithm::AlgorithmResult;
use crate::cfa::Cfa;
use crate::composite::CompositeCpa;
use crate::error::{CpaError, Result};
use crate::reached::{ReachedSet, StateSpacePartition};
use crate::refinement::{ConditionAdjustingAlgorithm, RefinementOptions, RefinementOutcome};
use crate::shutdown::ShutdownNotifier;
use crate::summary::{compute_summaries, DependencyGraph, SummaryComputer, SummaryProvider, SummaryStatistics};
use crate::waitlist::TraversalOrder;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PhaseStatus {
    Success,
    Fail,
}

impl PhaseStatus {
    pub fn from_success(success: bool) -> Self {
        if success {
            PhaseStatus::Success
        } else {
            PhaseStatus::Fail
        }
    }

    pub fn is_success(self) -> bool {
        self == PhaseStatus::Success
    }

    /// Success only if both succeeded.
    pub fn merge(self, other: PhaseStatus) -> PhaseStatus {
        PhaseStatus::from_success(self.is_success() && other.is_success())
    }

    pub fn merge3(a: PhaseStatus, b: PhaseStatus, c: PhaseStatus) -> PhaseStatus {
        a.merge(b).merge(c)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseStatus::Success => write!(f, "SUCCESS"),
            PhaseStatus::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PhaseResultKind {
    Empty,
    Algorithm,
    Refinement,
    Summary,
}

#[derive(Debug, Clone)]
pub enum PhaseResult {
    Empty,
    Algorithm(AlgorithmResult),
    Refinement(Box<RefinementOutcome>),
    Summary(SummaryStatistics),
}

impl PhaseResult {
    pub fn kind(&self) -> PhaseResultKind {
        match self {
            PhaseResult::Empty => PhaseResultKind::Empty,
            PhaseResult::Algorithm(_) => PhaseResultKind::Algorithm,
            PhaseResult::Refinement(_) => PhaseResultKind::Refinement,
            PhaseResult::Summary(_) => PhaseResultKind::Summary,
        }
    }
}

/// A sequence of phase results, retrievable by kind.
#[derive(Debug, Clone, Default)]
pub struct WrappedPhaseResult {
    results: Vec<PhaseResult>,
}

impl WrappedPhaseResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: PhaseResult) {
        self.results.push(result);
    }

    /// The last result of the given kind.
    pub fn get(&self, kind: PhaseResultKind) -> Option<&PhaseResult> {
        self.results.iter().rev().find(|r| r.kind() == kind)
    }

    pub fn get_all(&self, kind: PhaseResultKind) -> impl Iterator<Item = &PhaseResult> {
        self.results.iter().filter(move |r| r.kind() == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhaseResult> {
        self.results.iter()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Data shared by all phases of one analysis session.
#[derive(Debug, Default)]
pub struct PhaseContext {
    pub shutdown: ShutdownNotifier,
    pub summaries: SummaryProvider,
}

impl PhaseContext {
    pub fn new(shutdown: ShutdownNotifier) -> Self {
        Self {
            shutdown,
            summaries: SummaryProvider::new(),
        }
    }
}

/// One step of an analysis session.
pub trait Phase {
    fn id(&self) -> &str;

    /// Setup before [`run_phase`](Phase::run_phase).
    fn prev_action(&mut self, _context: &mut PhaseContext) -> Result<PhaseStatus> {
        Ok(PhaseStatus::Success)
    }

    fn run_phase(&mut self, context: &mut PhaseContext) -> Result<PhaseStatus>;

    /// Cleanup after [`run_phase`](Phase::run_phase).
    fn post_action(&mut self, _context: &mut PhaseContext) -> Result<PhaseStatus> {
        Ok(PhaseStatus::Success)
    }

    fn result(&self) -> PhaseResult;
}

/// Index of a phase in its [`PhaseGraph`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhaseId(usize);

struct PhaseNode<'a> {
    phase: Box<dyn Phase + 'a>,
    ancestors: Vec<PhaseId>,
    successors: Vec<PhaseId>,
    processed: bool,
}

#[derive(Default)]
pub struct PhaseGraph<'a> {
    nodes: Vec<PhaseNode<'a>>,
}

impl fmt::Debug for PhaseGraph<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.nodes.iter().map(|n| (n.phase.id(), &n.successors, n.processed)))
            .finish()
    }
}

impl<'a> PhaseGraph<'a> {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn add(&mut self, phase: impl Phase + 'a) -> PhaseId {
        self.nodes.push(PhaseNode {
            phase: Box::new(phase),
            ancestors: Vec::new(),
            successors: Vec::new(),
            processed: false,
        });
        PhaseId(self.nodes.len() - 1)
    }

    /// Declares that `after` runs only once `before` is done.
    pub fn add_successor(&mut self, before: PhaseId, after: PhaseId) {
        self.nodes[before.0].successors.push(after);
        self.nodes[after.0].ancestors.push(before);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn phase(&self, id: PhaseId) -> &dyn Phase {
        &*self.nodes[id.0].phase
    }

    pub fn is_processed(&self, id: PhaseId) -> bool {
        self.nodes[id.0].processed
    }

    /// Whether `id` is not processed yet and all its ancestors are.
    pub fn check_ready(&self, id: PhaseId) -> bool {
        let node = &self.nodes[id.0];
        !node.processed && node.ancestors.iter().all(|a| self.nodes[a.0].processed)
    }

    /// Runs one phase (setup, run, cleanup). Fails without running if an
    /// ancestor is not processed.
    pub fn run_phase(&mut self, id: PhaseId, context: &mut PhaseContext) -> Result<PhaseStatus> {
        if self.nodes[id.0].ancestors.iter().any(|a| !self.nodes[a.0].processed) {
            return Ok(PhaseStatus::Fail);
        }
        let phase = &mut self.nodes[id.0].phase;
        debug!("running phase '{}'", phase.id());
        let prev = phase.prev_action(context)?;
        let run = phase.run_phase(context)?;
        let post = phase.post_action(context)?;
        self.nodes[id.0].processed = true;
        Ok(PhaseStatus::merge3(prev, run, post))
    }

    /// Runs all phases sequentially until one fails.
    ///
    /// Among the ready phases, the one discovered first as a successor of a
    /// finished phase runs next; undiscovered phases come last, in insertion
    /// order. Fails with [`CpaError::InvalidConfiguration`] if unfinished
    /// phases remain but none is ready.
    pub fn execute(&mut self, context: &mut PhaseContext) -> Result<PhaseStatus> {
        let n = self.nodes.len();
        let mut blocking: Vec<usize> = self
            .nodes
            .iter()
            .map(|node| node.ancestors.iter().filter(|a| !self.nodes[a.0].processed).count())
            .collect();
        let mut remaining: Vec<bool> = self.nodes.iter().map(|node| !node.processed).collect();
        let mut discovered: Vec<Option<usize>> = vec![None; n];
        let mut discoveries = 0;
        let mut status = PhaseStatus::Success;

        while status.is_success() && remaining.iter().any(|&r| r) {
            let Some(current) = (0..n)
                .filter(|&i| remaining[i] && blocking[i] == 0)
                .min_by_key(|&i| (discovered[i].unwrap_or(n), i))
            else {
                return Err(CpaError::config("invalid phase topology: no entry"));
            };

            status = status.merge(self.run_phase(PhaseId(current), context)?);
            info!("phase '{}' finished: {}", self.nodes[current].phase.id(), status);
            if status.is_success() {
                remaining[current] = false;
                for &PhaseId(s) in &self.nodes[current].successors {
                    if discovered[s].is_none() {
                        discovered[s] = Some(discoveries);
                        discoveries += 1;
                    }
                    blocking[s] = blocking[s].saturating_sub(1);
                }
            } else {
                warn!("phase '{}' failed", self.nodes[current].phase.id());
            }
        }
        Ok(status)
    }

    /// Results of all processed phases, in insertion order.
    pub fn results(&self) -> WrappedPhaseResult {
        let mut results = WrappedPhaseResult::new();
        for node in self.nodes.iter().filter(|n| n.processed) {
            results.push(node.phase.result());
        }
        results
    }
}

/// Verification of one CFA with condition refinement.
pub struct AnalysisPhase<'a> {
    id: String,
    cfa: &'a Cfa,
    cpa: CompositeCpa,
    order: TraversalOrder,
    options: RefinementOptions,
    use_summaries: bool,
    reached: Option<ReachedSet>,
    outcome: Option<RefinementOutcome>,
}

impl<'a> AnalysisPhase<'a> {
    pub fn new(id: &str, cfa: &'a Cfa, cpa: CompositeCpa, order: TraversalOrder, options: RefinementOptions) -> Self {
        Self {
            id: id.to_string(),
            cfa,
            cpa,
            order,
            options,
            use_summaries: true,
            reached: None,
            outcome: None,
        }
    }

    /// Whether to apply the summaries of the context (default: true).
    pub fn with_summaries(mut self, use_summaries: bool) -> Self {
        self.use_summaries = use_summaries;
        self
    }

    pub fn cpa(&self) -> &CompositeCpa {
        &self.cpa
    }

    pub fn reached(&self) -> Option<&ReachedSet> {
        self.reached.as_ref()
    }

    pub fn outcome(&self) -> Option<&RefinementOutcome> {
        self.outcome.as_ref()
    }
}

impl Phase for AnalysisPhase<'_> {
    fn id(&self) -> &str {
        &self.id
    }

    fn run_phase(&mut self, context: &mut PhaseContext) -> Result<PhaseStatus> {
        let mut reached = ReachedSet::for_cfa(self.order, self.cfa);
        reached.initialize(&self.cpa, self.cfa.main_entry(), StateSpacePartition::default())?;

        let mut algorithm = ConditionAdjustingAlgorithm::new(self.cfa, self.options.clone());
        if self.use_summaries && !context.summaries.store().is_empty() {
            algorithm = algorithm.with_summaries(&context.summaries);
        }
        let outcome = algorithm.run(&mut self.cpa, &mut reached, &context.shutdown)?;
        let status = outcome.phase_status;
        info!("analysis '{}': {}", self.id, outcome.verdict);

        self.reached = Some(reached);
        self.outcome = Some(outcome);
        Ok(status)
    }

    fn result(&self) -> PhaseResult {
        match &self.outcome {
            Some(outcome) => PhaseResult::Refinement(Box::new(outcome.clone())),
            None => PhaseResult::Empty,
        }
    }
}

/// Summary computation over the call graph, filling the context's store.
pub struct SummaryPhase<'a> {
    id: String,
    cfa: &'a Cfa,
    computer: Box<dyn SummaryComputer + 'a>,
    statistics: Option<SummaryStatistics>,
}

impl<'a> SummaryPhase<'a> {
    pub fn new(id: &str, cfa: &'a Cfa, computer: impl SummaryComputer + 'a) -> Self {
        Self {
            id: id.to_string(),
            cfa,
            computer: Box::new(computer),
            statistics: None,
        }
    }
}

impl Phase for SummaryPhase<'_> {
    fn id(&self) -> &str {
        &self.id
    }

    fn run_phase(&mut self, context: &mut PhaseContext) -> Result<PhaseStatus> {
        let graph = DependencyGraph::from_call_graph(self.cfa, context.summaries.subjects());
        let statistics = compute_summaries(&graph, &mut context.summaries, &mut *self.computer, &context.shutdown)?;
        let status = PhaseStatus::from_success(statistics.saturated);
        self.statistics = Some(statistics);
        Ok(status)
    }

    fn result(&self) -> PhaseResult {
        match &self.statistics {
            Some(statistics) => PhaseResult::Summary(statistics.clone()),
            None => PhaseResult::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use test_log::test;

    use super::*;

    /// Records its id in a shared log and returns a fixed status.
    struct Recorder {
        id: &'static str,
        status: PhaseStatus,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Phase for Recorder {
        fn id(&self) -> &str {
            self.id
        }

        fn run_phase(&mut self, _context: &mut PhaseContext) -> Result<PhaseStatus> {
            self.log.borrow_mut().push(self.id);
            Ok(self.status)
        }

        fn result(&self) -> PhaseResult {
            PhaseResult::Empty
        }
    }

    fn recorder(id: &'static str, status: PhaseStatus, log: &Rc<RefCell<Vec<&'static str>>>) -> Recorder {
        Recorder {
            id,
            status,
            log: Rc::clone(log),
        }
    }

    #[test]
    fn test_status_merge() {
        use PhaseStatus::*;
        assert_eq!(Success.merge(Success), Success);
        assert_eq!(Success.merge(Fail), Fail);
        assert_eq!(PhaseStatus::merge3(Success, Success, Fail), Fail);
        assert_eq!(PhaseStatus::merge3(Success, Success, Success), Success);
    }

    #[test]
    fn test_sequential_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut graph = PhaseGraph::new();
        let a = graph.add(recorder("a", PhaseStatus::Success, &log));
        let b = graph.add(recorder("b", PhaseStatus::Success, &log));
        let c = graph.add(recorder("c", PhaseStatus::Success, &log));
        let d = graph.add(recorder("d", PhaseStatus::Success, &log));
        // a -> c, a -> b, {b, c} -> d
        graph.add_successor(a, c);
        graph.add_successor(a, b);
        graph.add_successor(b, d);
        graph.add_successor(c, d);
        assert!(graph.check_ready(a));
        assert!(!graph.check_ready(d));

        let mut context = PhaseContext::default();
        assert_eq!(graph.execute(&mut context).unwrap(), PhaseStatus::Success);
        assert_eq!(*log.borrow(), vec!["a", "c", "b", "d"]);
        assert!(graph.is_processed(d));
        assert!(!graph.check_ready(a));
        assert_eq!(graph.results().len(), 4);
    }

    #[test]
    fn test_failure_stops_execution() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut graph = PhaseGraph::new();
        let a = graph.add(recorder("a", PhaseStatus::Fail, &log));
        let b = graph.add(recorder("b", PhaseStatus::Success, &log));
        graph.add_successor(a, b);
        let mut context = PhaseContext::default();
        assert_eq!(graph.execute(&mut context).unwrap(), PhaseStatus::Fail);
        assert_eq!(*log.borrow(), vec!["a"]);
        assert!(!graph.is_processed(b));
    }

    #[test]
    fn test_cycle_has_no_entry() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut graph = PhaseGraph::new();
        let a = graph.add(recorder("a", PhaseStatus::Success, &log));
        let b = graph.add(recorder("b", PhaseStatus::Success, &log));
        graph.add_successor(a, b);
        graph.add_successor(b, a);
        let mut context = PhaseContext::default();
        let err = graph.execute(&mut context).unwrap_err();
        assert!(matches!(err, CpaError::InvalidConfiguration(_)));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_run_phase_requires_ancestors() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut graph = PhaseGraph::new();
        let a = graph.add(recorder("a", PhaseStatus::Success, &log));
        let b = graph.add(recorder("b", PhaseStatus::Success, &log));
        graph.add_successor(a, b);
        let mut context = PhaseContext::default();
        assert_eq!(graph.run_phase(b, &mut context).unwrap(), PhaseStatus::Fail);
        assert!(log.borrow().is_empty());
        assert_eq!(graph.run_phase(a, &mut context).unwrap(), PhaseStatus::Success);
        assert_eq!(graph.run_phase(b, &mut context).unwrap(), PhaseStatus::Success);
    }

    #[test]
    fn test_wrapped_result_by_kind() {
        let mut results = WrappedPhaseResult::new();
        results.push(PhaseResult::Empty);
        results.push(PhaseResult::Summary(SummaryStatistics {
            computations: 1,
            updates: 1,
            saturated: true,
        }));
        results.push(PhaseResult::Summary(SummaryStatistics::default()));
        assert_eq!(results.len(), 3);
        assert!(results.get(PhaseResultKind::Algorithm).is_none());
        assert_eq!(results.get_all(PhaseResultKind::Summary).count(), 2);
        match results.get(PhaseResultKind::Summary) {
            Some(PhaseResult::Summary(s)) => assert!(!s.saturated),
            other => panic!("unexpected {:?}", other),
        }
    }
}
