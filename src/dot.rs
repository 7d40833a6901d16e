//! ARG to DOT (Graphviz) conversion.
//!
//! The generated DOT output follows these conventions:
//! - **States** are boxes labeled with their ID and CFA location
//! - **Target states** are filled with the configured target color
//! - **Covered states** are dashed boxes
//! - **Edges**:
//!   - Solid arrows represent parent/child edges, labeled with the CFA edge
//!   - Dashed arrows point from a covered state to its coverer
//!
//! # Examples
//!
//! ```
//! use cpa_rs::algorithm::{AlgorithmOptions, CpaAlgorithm};
//! use cpa_rs::cfa::CfaBuilder;
//! use cpa_rs::composite::CompositeCpa;
//! use cpa_rs::conditions::TargetLocationCpa;
//! use cpa_rs::reached::{ReachedSet, StateSpacePartition};
//! use cpa_rs::shutdown::ShutdownNotifier;
//! use cpa_rs::waitlist::TraversalOrder;
//!
//! let mut b = CfaBuilder::new("main");
//! let (entry, exit) = b.function("main");
//! b.statement(entry, exit, "x = 1");
//! let cfa = b.build().unwrap();
//!
//! let cpa = CompositeCpa::new().with(TargetLocationCpa::new([exit]));
//! let mut reached = ReachedSet::for_cfa(TraversalOrder::Dfs, &cfa);
//! reached.initialize(&cpa, entry, StateSpacePartition::default()).unwrap();
//! let algorithm = CpaAlgorithm::new(&cpa, &cfa, AlgorithmOptions::default());
//! algorithm.run(&mut reached, &ShutdownNotifier::new()).unwrap();
//!
//! let dot = reached.arg().to_dot(&cfa).unwrap();
//! // Write to file and render with: dot -Tpng output.dot -o output.png
//! assert!(dot.contains("x = 1"));
//! ```

use std::fmt::{self, Write as _};

use crate::arg::Arg;
use crate::cfa::Cfa;

/// Configuration options for DOT output generation.
#[derive(Debug, Clone)]
pub struct DotConfig {
    /// Shape for state nodes (default: "box")
    pub state_shape: &'static str,
    /// Fill color of target states (default: "red")
    pub target_color: &'static str,
    /// Style of covering edges (default: "dashed")
    pub covering_edge_style: &'static str,
    /// Whether to render covering edges (default: true)
    pub show_covering: bool,
    /// Whether to include the abstract state in node labels (default: false)
    pub show_states: bool,
}

impl Default for DotConfig {
    fn default() -> Self {
        Self {
            state_shape: "box",
            target_color: "red",
            covering_edge_style: "dashed",
            show_covering: true,
            show_states: false,
        }
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

impl Arg {
    /// Converts the live part of the ARG to DOT format.
    pub fn to_dot(&self, cfa: &Cfa) -> Result<String, fmt::Error> {
        self.to_dot_with_config(cfa, &DotConfig::default())
    }

    /// Converts the live part of the ARG to DOT format with custom configuration.
    pub fn to_dot_with_config(&self, cfa: &Cfa, config: &DotConfig) -> Result<String, fmt::Error> {
        let mut dot = String::new();
        writeln!(dot, "digraph ARG {{")?;
        writeln!(dot, "node [shape={}];", config.state_shape)?;

        for node in self.iter() {
            let mut label = format!("{} @ {}", node.id(), node.location());
            if config.show_states {
                label.push_str(&format!("\\n{}", escape(&format!("{:?}", node.state()))));
            }
            let mut attrs = vec![format!("label=\"{}\"", label)];
            if node.is_target() {
                attrs.push(format!("style=filled, fillcolor={}", config.target_color));
            } else if node.is_covered() {
                attrs.push("style=dashed".to_string());
            }
            writeln!(dot, "{} [{}];", node.id().index(), attrs.join(", "))?;
        }

        for node in self.iter() {
            for &(parent, edge) in node.parent_edges() {
                let description = &cfa.edge(edge).description;
                writeln!(
                    dot,
                    "{} -> {} [label=\"{}\"];",
                    parent.index(),
                    node.id().index(),
                    escape(description)
                )?;
            }
        }

        if config.show_covering {
            for node in self.iter() {
                if let Some(by) = node.covered_by() {
                    writeln!(
                        dot,
                        "{} -> {} [style={}, constraint=false];",
                        node.id().index(),
                        by.index(),
                        config.covering_edge_style
                    )?;
                }
            }
        }

        writeln!(dot, "}}")?;
        Ok(dot)
    }
}
