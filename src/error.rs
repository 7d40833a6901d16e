//! Error types.
//!
//! Two tiers: [`TransferError`] is recoverable (the offending successor is
//! dropped and exploration continues), [`CpaError`] aborts the current
//! operation.

use thiserror::Error;

use crate::types::{ArgId, EdgeId, LoopId};

/// Failure of a domain to compute successors along one edge.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// The edge contains a construct the domain does not understand.
    #[error("unsupported code on {edge}: {message}")]
    UnsupportedCode { edge: EdgeId, message: String },
    /// Internal failure of a domain (e.g. an external solver gave up).
    #[error("{domain} failed on {edge}: {message}")]
    Domain {
        domain: String,
        edge: EdgeId,
        message: String,
    },
}

impl TransferError {
    pub fn unsupported(edge: EdgeId, message: impl Into<String>) -> Self {
        TransferError::UnsupportedCode {
            edge,
            message: message.into(),
        }
    }

    /// The edge on which the failure happened.
    pub fn edge(&self) -> EdgeId {
        match self {
            TransferError::UnsupportedCode { edge, .. } => *edge,
            TransferError::Domain { edge, .. } => *edge,
        }
    }
}

/// Fatal engine error.
#[derive(Debug, Error)]
pub enum CpaError {
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    /// Reached-set or ARG bookkeeping is inconsistent.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("unknown ARG state {0}")]
    UnknownState(ArgId),

    #[error("use of destroyed ARG state {0}")]
    DestroyedState(ArgId),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A `Join` merge or stop policy was configured for a domain without a join.
    #[error("domain '{0}' does not define a join")]
    JoinUnsupported(String),

    /// A loop summary produced a successor for an edge that does not leave the loop.
    #[error("summary for {loop_id} produced a successor on non-exit edge {edge}")]
    InvalidSummaryExit { loop_id: LoopId, edge: EdgeId },

    #[error("component count mismatch: expected {expected}, got {actual}")]
    ComponentMismatch { expected: usize, actual: usize },
}

impl CpaError {
    pub fn invariant(message: impl Into<String>) -> Self {
        CpaError::InvariantViolation(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        CpaError::InvalidConfiguration(message.into())
    }
}

pub type Result<T, E = CpaError> = std::result::Result<T, E>;
