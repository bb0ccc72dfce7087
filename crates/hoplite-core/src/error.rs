//! Pipeline error taxonomy
//!
//! Per-step failures are recorded in [`ExecutionState`](crate::types::ExecutionState)
//! and never abort sibling steps; stage-level failures end the stage.

use thiserror::Error;

use crate::types::{Stage, StepId};

/// Label of the whole-run deadline.
pub const GLOBAL_DEADLINE_LABEL: &str = "global";

/// Errors recorded on a run's error list.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("deadline exceeded: {label} after {budget_ms}ms")]
    DeadlineExceeded { label: String, budget_ms: u64 },

    #[error("query failed for step '{step_id}' on '{collection}': {message}")]
    QueryFailure {
        step_id: StepId,
        collection: String,
        message: String,
    },

    #[error("unresolved placeholder {reference} in step '{step_id}'")]
    UnresolvedPlaceholder { step_id: StepId, reference: String },

    #[error("no hop path for step '{step_id}' targeting '{collection}'")]
    UnresolvedHopPath { step_id: StepId, collection: String },

    #[error("malformed step '{step_id}': {reason}")]
    MalformedPlan { step_id: StepId, reason: String },

    #[error("stage {stage} failed: {message}")]
    StageFailure { stage: Stage, message: String },
}

impl PipelineError {
    pub fn deadline(label: impl Into<String>, budget_ms: u64) -> Self {
        Self::DeadlineExceeded {
            label: label.into(),
            budget_ms,
        }
    }

    pub fn stage(stage: Stage, message: impl Into<String>) -> Self {
        Self::StageFailure {
            stage,
            message: message.into(),
        }
    }

    /// Stable machine-readable tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::QueryFailure { .. } => "query_failure",
            Self::UnresolvedPlaceholder { .. } => "unresolved_placeholder",
            Self::UnresolvedHopPath { .. } => "unresolved_hop_path",
            Self::MalformedPlan { .. } => "malformed_plan",
            Self::StageFailure { .. } => "stage_failure",
        }
    }

    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }

    /// The whole-run budget ran out, as opposed to a single query or stage.
    pub fn is_global_deadline(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { label, .. } if label == GLOBAL_DEADLINE_LABEL)
    }
}
