//! The adjustable-condition refinement loop.
//!
//! [`ConditionAdjustingAlgorithm`] runs the reachability algorithm, and
//! while the result is incomplete without a target, raises the thresholds of
//! every adjustable condition and runs again. It gives up when no condition
//! can be raised any further.

use std::fmt;
use std::time::Duration;

use log::{debug, info};

use crate::algorithm::{AlgorithmOptions, AlgorithmStatus, CpaAlgorithm};
use crate::cfa::Cfa;
use crate::composite::CompositeCpa;
use crate::error::{CpaError, Result};
use crate::limits::{ResourceLimit, ResourceLimitChecker, WallTimeLimit};
use crate::phase::{PhaseResult, PhaseStatus, WrappedPhaseResult};
use crate::reached::{ReachedSet, StateSpacePartition};
use crate::shutdown::ShutdownNotifier;
use crate::summary::SummaryProvider;
use crate::types::{ArgId, NodeId};

/// How the reached set is prepared for the next round.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReachedSetReset {
    /// Start over from the initial state.
    Restart,
    /// Remove only the states invalidated by the adjustment and re-queue
    /// their parents. Falls back to [`Restart`](ReachedSetReset::Restart)
    /// unless every adjusted component can invalidate states.
    AdjustReachedSet,
}

#[derive(Debug, Clone)]
pub struct RefinementOptions {
    /// Bound on reachability runs (default: none).
    pub max_rounds: Option<usize>,
    /// Default: [`ReachedSetReset::Restart`].
    pub reset: ReachedSetReset,
    /// Whether finding a target before the state space is fully explored
    /// counts as a successful phase (default: true).
    pub early_stop_is_success: bool,
    /// Wall-time limit per round (default: none). A round hitting it is
    /// incomplete, and refinement continues.
    pub round_time_limit: Option<Duration>,
    pub algorithm: AlgorithmOptions,
}

impl Default for RefinementOptions {
    fn default() -> Self {
        Self {
            max_rounds: None,
            reset: ReachedSetReset::Restart,
            early_stop_is_success: true,
            round_time_limit: None,
            algorithm: AlgorithmOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnknownReason {
    /// Incomplete, and no condition could be raised further.
    PrecisionExhausted,
    MaxRoundsReached,
    /// The complete exploration was unsound.
    Unsound,
    Interrupted(String),
}

impl fmt::Display for UnknownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnknownReason::PrecisionExhausted => write!(f, "precision exhausted"),
            UnknownReason::MaxRoundsReached => write!(f, "maximal number of rounds reached"),
            UnknownReason::Unsound => write!(f, "unsound exploration"),
            UnknownReason::Interrupted(reason) => write!(f, "interrupted: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No target is reachable.
    Safe,
    Unsafe { targets: Vec<ArgId> },
    Unknown(UnknownReason),
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Safe => write!(f, "SAFE"),
            Verdict::Unsafe { targets } => write!(f, "UNSAFE ({} targets)", targets.len()),
            Verdict::Unknown(reason) => write!(f, "UNKNOWN ({})", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefinementOutcome {
    pub verdict: Verdict,
    /// Status of the last run.
    pub status: AlgorithmStatus,
    /// Conjunction of the statuses of all runs.
    pub combined_status: AlgorithmStatus,
    pub rounds: usize,
    pub phase_status: PhaseStatus,
    /// One [`PhaseResult::Algorithm`] per round.
    pub results: WrappedPhaseResult,
}

/// Reachability with condition refinement.
#[derive(Debug, Clone)]
pub struct ConditionAdjustingAlgorithm<'a> {
    cfa: &'a Cfa,
    options: RefinementOptions,
    summaries: Option<&'a SummaryProvider>,
}

impl<'a> ConditionAdjustingAlgorithm<'a> {
    pub fn new(cfa: &'a Cfa, options: RefinementOptions) -> Self {
        Self {
            cfa,
            options,
            summaries: None,
        }
    }

    pub fn with_summaries(mut self, provider: &'a SummaryProvider) -> Self {
        self.summaries = Some(provider);
        self
    }

    /// Runs rounds of reachability on `reached`, which must be initialized.
    ///
    /// The conditions of `cpa` are raised between rounds and keep their
    /// final thresholds afterwards.
    pub fn run(&self, cpa: &mut CompositeCpa, reached: &mut ReachedSet, shutdown: &ShutdownNotifier) -> Result<RefinementOutcome> {
        let first = reached
            .first()
            .ok_or_else(|| CpaError::config("refinement needs an initialized reached set"))?;
        let node = reached.node(first)?;
        let (entry, partition) = (node.location(), node.partition().clone());

        let mut results = WrappedPhaseResult::new();
        let mut combined_status = AlgorithmStatus::SOUND_AND_COMPLETE;
        let mut rounds = 0;
        let (verdict, status, phase_status) = loop {
            rounds += 1;
            let round_shutdown = shutdown.child();
            let checker = self.options.round_time_limit.map(|limit| {
                let limits: Vec<Box<dyn ResourceLimit>> = vec![Box::new(WallTimeLimit::new(limit))];
                ResourceLimitChecker::start(round_shutdown.clone(), limits)
            });

            let mut algorithm = CpaAlgorithm::new(cpa, self.cfa, self.options.algorithm.clone());
            if let Some(provider) = self.summaries {
                algorithm = algorithm.with_summaries(provider);
            }
            let result = algorithm.run(reached, &round_shutdown);
            if let Some(checker) = checker {
                checker.stop();
            }
            let result = result?;
            let status = result.status;
            combined_status = combined_status.update(status);
            results.push(PhaseResult::Algorithm(result));

            let targets = reached.targets();
            info!(
                "refinement round {}: {}, {} reached, {} targets",
                rounds,
                status,
                reached.len(),
                targets.len()
            );

            if !targets.is_empty() {
                let success = status.complete || self.options.early_stop_is_success;
                break (Verdict::Unsafe { targets }, status, PhaseStatus::from_success(success));
            }
            if status.complete {
                if status.sound {
                    break (Verdict::Safe, status, PhaseStatus::Success);
                }
                break (Verdict::Unknown(UnknownReason::Unsound), status, PhaseStatus::Fail);
            }
            if shutdown.should_shutdown() {
                let reason = shutdown.reason().unwrap_or_else(|| "shutdown requested".to_string());
                break (Verdict::Unknown(UnknownReason::Interrupted(reason)), status, PhaseStatus::Fail);
            }
            if self.options.max_rounds.map_or(false, |max| rounds >= max) {
                break (Verdict::Unknown(UnknownReason::MaxRoundsReached), status, PhaseStatus::Fail);
            }

            let adjusted = adjust_conditions(cpa);
            if adjusted.is_empty() {
                break (Verdict::Unknown(UnknownReason::PrecisionExhausted), status, PhaseStatus::Fail);
            }
            self.reset(cpa, reached, &adjusted, entry, &partition)?;
        };

        info!("refinement finished after {} rounds: {}", rounds, verdict);
        Ok(RefinementOutcome {
            verdict,
            status,
            combined_status,
            rounds,
            phase_status,
            results,
        })
    }

    fn reset(
        &self,
        cpa: &CompositeCpa,
        reached: &mut ReachedSet,
        adjusted: &[usize],
        entry: NodeId,
        partition: &StateSpacePartition,
    ) -> Result<()> {
        let adjustable = self.options.reset == ReachedSetReset::AdjustReachedSet
            && adjusted.iter().all(|&i| cpa.component_adjusts_reached_set(i));
        if adjustable {
            let removed = reached.adjust(cpa)?;
            if reached.is_empty() {
                reached.initialize(cpa, entry, partition.clone())?;
            }
            debug!("adjusted reached set: {} subtrees removed, {} waiting", removed, reached.waitlist_len());
        } else {
            reached.initialize(cpa, entry, partition.clone())?;
            debug!("restarted from {}", entry);
        }
        Ok(())
    }
}

/// Raises every adjustable condition. Returns the indices of those raised.
fn adjust_conditions(cpa: &mut CompositeCpa) -> Vec<usize> {
    let mut adjusted = Vec::new();
    for i in cpa.adjustable_conditions() {
        if cpa.adjust_condition(i) == Some(true) {
            info!("raised {} to {:?}", cpa.name_of(i), cpa.condition_threshold(i));
            adjusted.push(i);
        } else {
            info!("{} cannot be raised further", cpa.name_of(i));
        }
    }
    adjusted
}
