//! Shared fixtures: a tiny value analysis over a single variable `x`.

#![allow(dead_code)]

use std::sync::Arc;

use cpa_rs::cfa::{Cfa, CfaEdge, EdgeKind, Loop};
use cpa_rs::domain::{AbstractDomain, ConfigurableProgramAnalysis, MergePolicy};
use cpa_rs::error::TransferError;
use cpa_rs::reached::{ReachedSet, StateSpacePartition};
use cpa_rs::summary::SummaryInstance;
use cpa_rs::types::{EdgeId, NodeId};
use cpa_rs::waitlist::TraversalOrder;
use cpa_rs::composite::CompositeCpa;

/// Function summary: the callee leaves `x` at the given value.
#[derive(Debug, Clone, PartialEq)]
pub struct Returns(pub i64);

/// External loop summary: the loop is left with `x` at the given value.
#[derive(Debug, Clone, PartialEq)]
pub struct LeavesWith(pub i64);

/// Tracks the value of `x`; `None` means unknown.
///
/// Understands the statements `x = N` and `x++` and assumptions of the form
/// `x >= N`. Everything else keeps the value.
#[derive(Debug, Default)]
pub struct ValueCpa {
    pub merge: Option<MergePolicy>,
}

impl AbstractDomain for ValueCpa {
    type State = Option<i64>;

    fn is_less_or_equal(&self, a: &Self::State, b: &Self::State) -> bool {
        b.is_none() || a == b
    }

    fn join(&self, a: &Self::State, b: &Self::State) -> Option<Self::State> {
        Some(if a == b { *a } else { None })
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
        let text = edge.description.as_str();
        match &edge.kind {
            EdgeKind::Statement => {
                if text == "x++" {
                    return Ok(vec![state.map(|x| x + 1)]);
                }
                if let Some(value) = text.strip_prefix("x = ") {
                    let value = value
                        .parse()
                        .map_err(|_| TransferError::unsupported(edge.id, text))?;
                    return Ok(vec![Some(value)]);
                }
                Ok(vec![*state])
            }
            EdgeKind::Assume { truth } => {
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

    fn merge_operator(&self) -> MergePolicy {
        self.merge.unwrap_or(MergePolicy::Sep)
    }

    fn apply_function_summary(
        &self,
        _: &Self::State,
        _: &(),
        summaries: &[Arc<dyn SummaryInstance>],
        _: &CfaEdge,
        _: &CfaEdge,
    ) -> Result<Option<Vec<Self::State>>, TransferError> {
        let values: Vec<Self::State> = summaries
            .iter()
            .filter_map(|s| s.downcast_ref::<Returns>())
            .map(|r| Some(r.0))
            .collect();
        Ok((!values.is_empty()).then_some(values))
    }

    fn apply_external_loop_summary(
        &self,
        _: &Self::State,
        _: &(),
        summaries: &[Arc<dyn SummaryInstance>],
        loop_info: &Loop,
    ) -> Result<Option<Vec<(EdgeId, Self::State)>>, TransferError> {
        let Some(&exit) = loop_info.exit_edges.first() else {
            return Ok(None);
        };
        let pairs: Vec<(EdgeId, Self::State)> = summaries
            .iter()
            .filter_map(|s| s.downcast_ref::<LeavesWith>())
            .map(|l| (exit, Some(l.0)))
            .collect();
        Ok((!pairs.is_empty()).then_some(pairs))
    }
}

pub fn init(cpa: &CompositeCpa, cfa: &Cfa, order: TraversalOrder) -> ReachedSet {
    let mut reached = ReachedSet::for_cfa(order, cfa);
    reached
        .initialize(cpa, cfa.main_entry(), StateSpacePartition::default())
        .unwrap();
    reached
}
