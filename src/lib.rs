//! # cpa-rs: Configurable Program Analysis in Rust
//!
//! **`cpa-rs`** is a generic reachability engine for program verification.
//! It explores the states of a program, represented as a control-flow
//! automaton ([`Cfa`][crate::cfa::Cfa]), over pluggable abstract domains and
//! reports whether a target (error) location is reachable.
//!
//! ## What is a CPA?
//!
//! A Configurable Program Analysis is an abstract domain together with a
//! handful of operators: a transfer relation computing successors along an
//! edge, a *merge* operator deciding whether two states at the same location
//! are combined, a *stop* operator deciding whether a new state is already
//! covered, and a *precision adjustment* that may widen a state or cut the
//! exploration at it. The same worklist algorithm then yields anything from
//! a plain path enumeration to a data-flow analysis, depending on the
//! operators chosen.
//!
//! ## Key Features
//!
//! - **Composition**: Analyses of different types are combined in a [`CompositeCpa`][crate::composite::CompositeCpa]; every operator is applied component-wise.
//! - **Abstract reachability graph**: Every explored state lives in an [`Arg`][crate::arg::Arg] arena owned by the [`ReachedSet`][crate::reached::ReachedSet], with parent/child, coverage and merge links.
//! - **Condition refinement**: Bounded analyses (path length, loop unrolling) are re-run with relaxed thresholds until a verdict is reached; see [`refinement`].
//! - **Summaries**: Function and loop summaries, computed in dependency order over the call graph, replace calls and loops during exploration; see [`summary`].
//! - **Phases**: Summary computation and analyses are scheduled as a [`PhaseGraph`][crate::phase::PhaseGraph].
//!
//! ## Basic Usage
//!
//! ```rust
//! use cpa_rs::algorithm::{AlgorithmOptions, CpaAlgorithm};
//! use cpa_rs::cfa::CfaBuilder;
//! use cpa_rs::composite::CompositeCpa;
//! use cpa_rs::conditions::TargetLocationCpa;
//! use cpa_rs::reached::{ReachedSet, StateSpacePartition};
//! use cpa_rs::shutdown::ShutdownNotifier;
//! use cpa_rs::waitlist::TraversalOrder;
//!
//! // 1. Describe the program: main: entry -> error
//! let mut b = CfaBuilder::new("main");
//! let (entry, exit) = b.function("main");
//! let error = b.node("main");
//! b.statement(entry, error, "reach_error()");
//! b.blank(error, exit);
//! let cfa = b.build().unwrap();
//!
//! // 2. Compose the analyses
//! let cpa = CompositeCpa::new().with(TargetLocationCpa::new([error]));
//!
//! // 3. Seed the reached set and run
//! let mut reached = ReachedSet::for_cfa(TraversalOrder::Dfs, &cfa);
//! reached.initialize(&cpa, cfa.main_entry(), StateSpacePartition::default()).unwrap();
//! let algorithm = CpaAlgorithm::new(&cpa, &cfa, AlgorithmOptions::default());
//! let result = algorithm.run(&mut reached, &ShutdownNotifier::new()).unwrap();
//!
//! assert_eq!(result.targets.len(), 1);
//! assert!(result.status.sound);
//! ```
//!
//! ## Core Components
//!
//! - **[`domain`]**: The analysis contract ([`ConfigurableProgramAnalysis`][crate::domain::ConfigurableProgramAnalysis]) and the standard merge/stop operators.
//! - **[`algorithm`]**: The worklist reachability algorithm.
//! - **[`refinement`]**: The condition-adjusting loop around it.
//! - **[`conditions`]**: Ready-made bounding analyses.
//! - **[`dot`]**: Rendering of reachability graphs with Graphviz.

pub mod algorithm;
pub mod arg;
pub mod cfa;
pub mod composite;
pub mod conditions;
pub mod debug;
pub mod domain;
pub mod dot;
pub mod error;
pub mod limits;
pub mod phase;
pub mod reached;
pub mod refinement;
pub mod shutdown;
pub mod summary;
pub mod types;
pub mod waitlist;
