//! Bounded loop unrolling with condition refinement.
//!
//! Analyzes `x = 0; while (*) { x++; if (x >= N) error(); }`, starting with a
//! small loop bound and raising it until the error is found or the hard
//! limit is hit.
//!
//! Run with:
//! ```bash
//! cargo run --example loop_unrolling -- 4 --initial 1 --limit 8 --dot arg.dot
//! ```

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use cpa_rs::cfa::{Cfa, CfaBuilder, CfaEdge, EdgeKind};
use cpa_rs::composite::CompositeCpa;
use cpa_rs::conditions::{ConditionThreshold, LoopBoundCpa, TargetLocationCpa, ThresholdAdjuster};
use cpa_rs::domain::{AbstractDomain, ConfigurableProgramAnalysis};
use cpa_rs::error::TransferError;
use cpa_rs::reached::{ReachedSet, StateSpacePartition};
use cpa_rs::refinement::{ConditionAdjustingAlgorithm, ReachedSetReset, RefinementOptions};
use cpa_rs::shutdown::ShutdownNotifier;
use cpa_rs::types::NodeId;
use cpa_rs::waitlist::TraversalOrder;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Order {
    Dfs,
    Bfs,
    Topological,
}

impl From<Order> for TraversalOrder {
    fn from(order: Order) -> Self {
        match order {
            Order::Dfs => TraversalOrder::Dfs,
            Order::Bfs => TraversalOrder::Bfs,
            Order::Topological => TraversalOrder::Topological,
        }
    }
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Loop unrolling with adjustable bounds")]
struct Cli {
    /// Value of `x` at which the error is reached.
    #[arg(value_name = "INT", default_value = "3")]
    n: i64,

    /// Initial loop bound.
    #[arg(long, value_name = "INT", default_value = "1")]
    initial: u64,

    /// Hard limit for the loop bound.
    #[arg(long, value_name = "INT", default_value = "10")]
    limit: u64,

    /// Double the bound instead of incrementing it.
    #[arg(long)]
    double: bool,

    /// Keep the reached set between rounds instead of restarting.
    #[arg(long)]
    reuse: bool,

    /// Traversal order of the waitlist.
    #[arg(long, value_enum, default_value = "dfs")]
    order: Order,

    /// Write the final ARG in DOT format to this file.
    #[arg(long, value_name = "FILE")]
    dot: Option<PathBuf>,
}

/// The value of `x`, if known.
#[derive(Debug)]
struct ValueCpa;

impl AbstractDomain for ValueCpa {
    type State = Option<i64>;

    fn is_less_or_equal(&self, a: &Self::State, b: &Self::State) -> bool {
        b.is_none() || a == b
    }
}

impl ConfigurableProgramAnalysis for ValueCpa {
    type Precision = ();

    fn name(&self) -> &str {
        "ValueCPA"
    }

    fn initial_state(&self, _: NodeId, _: &StateSpacePartition) -> Self::State {
        None
    }

    fn initial_precision(&self, _: NodeId, _: &StateSpacePartition) {}

    fn abstract_successors(
        &self,
        state: &Self::State,
        _: &(),
        edge: &CfaEdge,
        _: &Cfa,
    ) -> Result<Vec<Self::State>, TransferError> {
        match (&edge.kind, edge.description.as_str()) {
            (EdgeKind::Statement, "x = 0") => Ok(vec![Some(0)]),
            (EdgeKind::Statement, "x++") => Ok(vec![state.map(|x| x + 1)]),
            (EdgeKind::Assume { truth }, text) => {
                let Some(bound) = text.strip_prefix("x >= ") else {
                    return Ok(vec![*state]);
                };
                let bound: i64 = bound
                    .parse()
                    .map_err(|_| TransferError::unsupported(edge.id, text))?;
                match state {
                    Some(x) if (*x >= bound) != *truth => Ok(vec![]),
                    _ => Ok(vec![*state]),
                }
            }
            _ => Ok(vec![*state]),
        }
    }
}

fn program(n: i64) -> color_eyre::Result<(Cfa, NodeId)> {
    let mut b = CfaBuilder::new("main");
    let (entry, exit) = b.function("main");
    let head = b.node("main");
    let body = b.node("main");
    let error = b.node("main");
    let guard = format!("x >= {}", n);
    b.statement(entry, head, "x = 0");
    b.statement(head, body, "x++");
    b.assume(body, error, true, &guard);
    b.assume(body, head, false, &guard);
    b.assume(head, exit, false, "*");
    b.add_loop(head, [body]);
    Ok((b.build()?, error))
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let time_total = std::time::Instant::now();

    let args = Cli::parse();
    println!("args = {:?}", args);

    let (cfa, error) = program(args.n)?;
    println!("CFA: {} nodes, {} edges, {} loops", cfa.num_nodes(), cfa.num_edges(), cfa.loops().len());

    let adjuster = if args.double {
        ThresholdAdjuster::Double
    } else {
        ThresholdAdjuster::Increment(1)
    };
    let mut cpa = CompositeCpa::new()
        .with(TargetLocationCpa::new([error]))
        .with(ValueCpa)
        .with(LoopBoundCpa::new(
            ConditionThreshold::new(args.initial, adjuster).with_hard_limit(args.limit),
        ));
    let bound = cpa.index_of("LoopBoundCPA").unwrap_or(2);

    let mut reached = ReachedSet::for_cfa(args.order.into(), &cfa);
    reached.initialize(&cpa, cfa.main_entry(), StateSpacePartition::default())?;

    let options = RefinementOptions {
        reset: if args.reuse {
            ReachedSetReset::AdjustReachedSet
        } else {
            ReachedSetReset::Restart
        },
        ..RefinementOptions::default()
    };
    let outcome = ConditionAdjustingAlgorithm::new(&cfa, options).run(&mut cpa, &mut reached, &ShutdownNotifier::new())?;

    println!("verdict: {}", outcome.verdict);
    println!("rounds: {}", outcome.rounds);
    println!("final loop bound: {:?}", cpa.condition_threshold(bound));
    println!("last run: {}", outcome.status);
    println!("phase status: {}", outcome.phase_status);
    println!("reached states: {}", reached.len());

    for &target in reached.targets().iter().take(1) {
        let path = reached.arg().counterexample_path(target)?;
        println!("counterexample ({} states):", path.len());
        for (state, edge) in path.steps() {
            let node = reached.arg().node(state)?;
            match edge {
                Some(edge) => println!("  {} @ {} --[{}]-->", state, node.location(), cfa.edge(edge).description),
                None => println!("  {} @ {}", state, node.location()),
            }
        }
    }

    if let Some(path) = &args.dot {
        std::fs::write(path, reached.arg().to_dot(&cfa)?)?;
        println!("ARG written to {}", path.display());
    }

    let time_total = time_total.elapsed();
    println!("Done in {:.3} s", time_total.as_secs_f64());

    Ok(())
}
