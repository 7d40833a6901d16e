//! Function summaries computed bottom-up over the call graph, then used to
//! verify `main` without descending into callees.
//!
//! The program is `main -> f -> g -> ext`, where `ext` has no body. Each
//! function's summary is the set of values it may leave in `x`; the external
//! function is modeled by a fixed value given on the command line.
//!
//! Run with:
//! ```bash
//! cargo run --example summaries -- --ext 7 --error-at 7
//! ```

use std::sync::Arc;

use clap::Parser;

use cpa_rs::cfa::{Cfa, CfaBuilder, CfaEdge, EdgeKind};
use cpa_rs::composite::CompositeCpa;
use cpa_rs::conditions::TargetLocationCpa;
use cpa_rs::domain::{AbstractDomain, ConfigurableProgramAnalysis};
use cpa_rs::error::{Result, TransferError};
use cpa_rs::phase::{AnalysisPhase, PhaseContext, PhaseGraph, PhaseResult, PhaseResultKind, SummaryPhase};
use cpa_rs::reached::StateSpacePartition;
use cpa_rs::refinement::RefinementOptions;
use cpa_rs::shutdown::ShutdownNotifier;
use cpa_rs::summary::{DependencyGraph, Subject, SubjectTable, SummaryInstance, SummaryStore};
use cpa_rs::types::NodeId;
use cpa_rs::waitlist::TraversalOrder;

#[derive(Debug, Parser)]
#[command(author, version, about = "Summary-based verification of a call chain")]
struct Cli {
    /// Value returned by the external function.
    #[arg(long, value_name = "INT", default_value = "7")]
    ext: i64,

    /// Value of `x` in `main` that reaches the error.
    #[arg(long, value_name = "INT", default_value = "7")]
    error_at: i64,

    /// Analyze without the summary phase.
    #[arg(long)]
    no_summaries: bool,
}

/// `x` may hold this value when the function returns.
#[derive(Debug, Clone, PartialEq)]
struct Returns(i64);

/// The value of `x`, if known. Calls are opaque unless summarized.
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
    ) -> std::result::Result<Vec<Self::State>, TransferError> {
        match &edge.kind {
            EdgeKind::Statement => Ok(vec![constant(edge).or(*state)]),
            EdgeKind::Assume { truth } => {
                let Some(value) = edge.description.strip_prefix("x == ") else {
                    return Ok(vec![*state]);
                };
                let value: i64 = value
                    .parse()
                    .map_err(|_| TransferError::unsupported(edge.id, edge.description.as_str()))?;
                match state {
                    Some(x) if (*x == value) != *truth => Ok(vec![]),
                    _ => Ok(vec![*state]),
                }
            }
            // Unsummarized calls may change `x` arbitrarily.
            EdgeKind::FunctionCall { .. } | EdgeKind::ExternalCall { .. } => Ok(vec![None]),
            _ => Ok(vec![*state]),
        }
    }

    fn apply_function_summary(
        &self,
        _: &Self::State,
        _: &(),
        summaries: &[Arc<dyn SummaryInstance>],
        _: &CfaEdge,
        _: &CfaEdge,
    ) -> std::result::Result<Option<Vec<Self::State>>, TransferError> {
        let values: Vec<Self::State> = summaries
            .iter()
            .filter_map(|s| s.downcast_ref::<Returns>())
            .map(|r| Some(r.0))
            .collect();
        Ok((!values.is_empty()).then_some(values))
    }
}

/// The constant `N` of a statement `x = N`.
fn constant(edge: &CfaEdge) -> Option<i64> {
    match edge.kind {
        EdgeKind::Statement => edge.description.strip_prefix("x = ")?.parse().ok(),
        _ => None,
    }
}

/// `main: x = f(); if (x == E) error;`, `f: return g() or 1`, `g: return ext()`.
fn program(error_at: i64) -> Result<(Cfa, NodeId)> {
    let mut b = CfaBuilder::new("main");
    let (m_entry, m_exit) = b.function("main");
    let (f_entry, f_exit) = b.function("f");
    let (g_entry, g_exit) = b.function("g");

    let m_ret = b.node("main");
    let error = b.node("main");
    let guard = format!("x == {}", error_at);
    b.call(m_entry, m_ret, "f");
    b.assume(m_ret, error, true, &guard);
    b.assume(m_ret, m_exit, false, &guard);

    b.call(f_entry, f_exit, "g");
    b.statement(f_entry, f_exit, "x = 1");

    b.call(g_entry, g_exit, "ext");

    Ok((b.build()?, error))
}

/// Summarizes a function by the values it leaves in `x`: constants on its
/// edges plus the summaries of its callees.
struct Summarizer<'a> {
    cfa: &'a Cfa,
    table: SubjectTable,
    ext: i64,
}

impl Summarizer<'_> {
    fn summarize(&self, subject: &Subject, store: &SummaryStore) -> Result<Vec<Arc<dyn SummaryInstance>>> {
        let Subject::Function(function) = subject else {
            return Ok(Vec::new());
        };
        if function.is_external() {
            return Ok(vec![Arc::new(Returns(self.ext))]);
        }

        let mut values: Vec<i64> = Vec::new();
        for edge in self.cfa.edges() {
            if self.cfa.function_of(edge.predecessor) != function.name() {
                continue;
            }
            if let Some(value) = constant(edge) {
                values.push(value);
            }
            let callee = match &edge.kind {
                EdgeKind::FunctionCall { callee, .. } | EdgeKind::ExternalCall { callee } => callee,
                _ => continue,
            };
            let callee = Subject::Function(self.table.function(self.cfa, callee));
            values.extend(
                store
                    .get(&callee)
                    .iter()
                    .filter_map(|s| s.downcast_ref::<Returns>())
                    .map(|r| r.0),
            );
        }
        values.sort_unstable();
        values.dedup();
        Ok(values
            .into_iter()
            .map(|v| Arc::new(Returns(v)) as Arc<dyn SummaryInstance>)
            .collect())
    }
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let args = Cli::parse();
    println!("args = {:?}", args);

    let (cfa, error) = program(args.error_at)?;

    let table = SubjectTable::new();
    let order = DependencyGraph::from_call_graph(&cfa, &table).computation_order();
    println!("computation order:");
    for subject in &order {
        println!("  {}", subject);
    }

    let summarizer = Summarizer {
        cfa: &cfa,
        table,
        ext: args.ext,
    };
    let cpa = CompositeCpa::new().with(TargetLocationCpa::new([error])).with(ValueCpa);

    let mut graph = PhaseGraph::new();
    let analysis = graph.add(AnalysisPhase::new(
        "verify-main",
        &cfa,
        cpa,
        TraversalOrder::Bfs,
        RefinementOptions::default(),
    ));
    if !args.no_summaries {
        let summaries = graph.add(SummaryPhase::new(
            "summaries",
            &cfa,
            |subject: &Subject, store: &SummaryStore| summarizer.summarize(subject, store),
        ));
        graph.add_successor(summaries, analysis);
    }

    let mut context = PhaseContext::new(ShutdownNotifier::new());
    let status = graph.execute(&mut context)?;

    for subject in context.summaries.store().subjects() {
        println!("{}: {:?}", subject, context.summaries.store().get(subject));
    }
    let results = graph.results();
    if let Some(PhaseResult::Summary(stats)) = results.get(PhaseResultKind::Summary) {
        println!("summary computations: {}, updates: {}", stats.computations, stats.updates);
    }
    if let Some(PhaseResult::Refinement(outcome)) = results.get(PhaseResultKind::Refinement) {
        println!("verdict: {}", outcome.verdict);
    }
    println!("status: {}", status);

    Ok(())
}
