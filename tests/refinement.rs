//! Condition refinement on bounded loop unrolling.

mod common;

use cpa_rs::algorithm::AlgorithmOptions;
use cpa_rs::cfa::{Cfa, CfaBuilder};
use cpa_rs::composite::CompositeCpa;
use cpa_rs::conditions::{ConditionThreshold, LoopBoundCpa, TargetLocationCpa, ThresholdAdjuster};
use cpa_rs::phase::{PhaseResult, PhaseResultKind, PhaseStatus};
use cpa_rs::refinement::{ConditionAdjustingAlgorithm, ReachedSetReset, RefinementOptions, UnknownReason, Verdict};
use cpa_rs::shutdown::ShutdownNotifier;
use cpa_rs::types::NodeId;
use cpa_rs::waitlist::TraversalOrder;

use common::{init, ValueCpa};

/// `x = 0; while (c) { x++; if (x >= bound) error; }`
fn guarded_loop(bound: i64) -> (Cfa, NodeId) {
    let mut b = CfaBuilder::new("main");
    let (entry, exit) = b.function("main");
    let head = b.node("main");
    let body = b.node("main");
    let error = b.node("main");
    b.statement(entry, head, "x = 0");
    b.statement(head, body, "x++");
    b.assume(body, error, true, &format!("x >= {}", bound));
    b.assume(body, head, false, &format!("x >= {}", bound));
    b.assume(head, exit, false, "c");
    b.add_loop(head, [body]);
    (b.build().unwrap(), error)
}

/// Loop bound 1, raised by one up to 3.
fn analysis(error: NodeId) -> CompositeCpa {
    CompositeCpa::new()
        .with(TargetLocationCpa::new([error]))
        .with(ValueCpa::default())
        .with(LoopBoundCpa::new(
            ConditionThreshold::new(1, ThresholdAdjuster::Increment(1)).with_hard_limit(3),
        ))
}

fn algorithm_rounds(results: &cpa_rs::phase::WrappedPhaseResult) -> Vec<(bool, usize)> {
    results
        .get_all(PhaseResultKind::Algorithm)
        .map(|r| match r {
            PhaseResult::Algorithm(result) => (result.status.complete, result.targets.len()),
            other => panic!("unexpected {:?}", other),
        })
        .collect()
}

#[test]
fn target_found_after_raising_the_bound() {
    let (cfa, error) = guarded_loop(2);
    let mut cpa = analysis(error);
    let mut reached = init(&cpa, &cfa, TraversalOrder::Dfs);

    let outcome = ConditionAdjustingAlgorithm::new(&cfa, RefinementOptions::default())
        .run(&mut cpa, &mut reached, &ShutdownNotifier::new())
        .unwrap();

    assert_eq!(outcome.rounds, 2);
    assert_eq!(algorithm_rounds(&outcome.results), vec![(false, 0), (false, 1)]);
    match &outcome.verdict {
        Verdict::Unsafe { targets } => {
            assert_eq!(targets.len(), 1);
            let node = reached.arg().node(targets[0]).unwrap();
            assert_eq!(node.location(), error);
            assert_eq!(node.state().find::<Option<i64>>(), Some(&Some(2)));
        }
        other => panic!("expected UNSAFE, got {}", other),
    }
    assert_eq!(cpa.condition_threshold(2), Some(2));
    // Early stop counts as success.
    assert_eq!(outcome.phase_status, PhaseStatus::Success);
    assert!(!outcome.combined_status.complete);
    assert!(outcome.combined_status.sound);
}

#[test]
fn early_stop_is_a_failure_when_configured() {
    let (cfa, error) = guarded_loop(2);
    let mut cpa = analysis(error);
    let mut reached = init(&cpa, &cfa, TraversalOrder::Dfs);
    let options = RefinementOptions {
        early_stop_is_success: false,
        ..RefinementOptions::default()
    };

    let outcome = ConditionAdjustingAlgorithm::new(&cfa, options)
        .run(&mut cpa, &mut reached, &ShutdownNotifier::new())
        .unwrap();
    assert_eq!(outcome.rounds, 2);
    assert!(matches!(outcome.verdict, Verdict::Unsafe { ref targets } if targets.len() == 1));
    // The round that found the target stopped early, so it is incomplete.
    assert!(!outcome.status.complete);
    assert!(outcome.status.sound);
    assert_eq!(outcome.phase_status, PhaseStatus::Fail);
}

#[test]
fn reached_set_is_adjusted_instead_of_restarted() {
    let (cfa, error) = guarded_loop(3);
    let mut cpa = analysis(error);
    let mut reached = init(&cpa, &cfa, TraversalOrder::Bfs);
    let first = reached.first();
    let options = RefinementOptions {
        reset: ReachedSetReset::AdjustReachedSet,
        ..RefinementOptions::default()
    };

    let outcome = ConditionAdjustingAlgorithm::new(&cfa, options)
        .run(&mut cpa, &mut reached, &ShutdownNotifier::new())
        .unwrap();
    assert_eq!(outcome.rounds, 3);
    assert!(matches!(outcome.verdict, Verdict::Unsafe { ref targets } if targets.len() == 1));
    // The initial state survived every round.
    assert_eq!(reached.first(), first);
    reached.check_consistency().unwrap();
}

#[test]
fn unreachable_target_exhausts_the_bound() {
    let (cfa, error) = guarded_loop(5);
    let mut cpa = analysis(error);
    let mut reached = init(&cpa, &cfa, TraversalOrder::Topological);

    let outcome = ConditionAdjustingAlgorithm::new(&cfa, RefinementOptions::default())
        .run(&mut cpa, &mut reached, &ShutdownNotifier::new())
        .unwrap();
    assert_eq!(outcome.verdict, Verdict::Unknown(UnknownReason::PrecisionExhausted));
    assert_eq!(outcome.rounds, 3);
    assert_eq!(outcome.phase_status, PhaseStatus::Fail);
    assert!(reached.targets().is_empty());
}

#[test]
fn bound_without_loop_is_safe_in_one_round() {
    let mut b = CfaBuilder::new("main");
    let (entry, exit) = b.function("main");
    let error = b.node("main");
    b.statement(entry, exit, "x = 1");
    b.assume(exit, error, true, "x >= 2");
    let cfa = b.build().unwrap();
    let mut cpa = analysis(error);
    let mut reached = init(&cpa, &cfa, TraversalOrder::Dfs);

    let options = RefinementOptions {
        max_rounds: Some(1),
        algorithm: AlgorithmOptions {
            stop_at_first_target: false,
            ..AlgorithmOptions::default()
        },
        ..RefinementOptions::default()
    };
    let outcome = ConditionAdjustingAlgorithm::new(&cfa, options)
        .run(&mut cpa, &mut reached, &ShutdownNotifier::new())
        .unwrap();
    assert_eq!(outcome.verdict, Verdict::Safe);
    assert_eq!(outcome.rounds, 1);
    assert_eq!(outcome.phase_status, PhaseStatus::Success);
}
