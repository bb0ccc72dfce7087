//! External action abstractions
//!
//! The retrieval core only routes to the executor stage; performing the
//! action is up to the [`ActionExecutor`] implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::ExecutionState;

/// Action execution errors
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Action not supported: {0}")]
    Unsupported(String),

    #[error("Action failed: {0}")]
    Failed(String),
}

/// Request for explicit user approval before an action runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub action: String,
    pub reason: String,
    #[serde(default)]
    pub params: Value,
}

impl ApprovalRequest {
    pub fn new(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            reason: reason.into(),
            params: Value::Null,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Result of the executor stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Completed {
        #[serde(default)]
        results: Vec<Value>,
    },
    NeedsConfirmation { request: ApprovalRequest },
}

impl ActionOutcome {
    pub fn completed(results: Vec<Value>) -> Self {
        Self::Completed { results }
    }

    pub fn needs_confirmation(request: ApprovalRequest) -> Self {
        Self::NeedsConfirmation { request }
    }

    pub fn needs_confirmation_request(&self) -> Option<&ApprovalRequest> {
        match self {
            Self::NeedsConfirmation { request } => Some(request),
            Self::Completed { .. } => None,
        }
    }
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, state: &ExecutionState) -> Result<ActionOutcome, ActionError>;
}
