//! Planner module
//!
//! The Planner is responsible for:
//! - Understanding the user query
//! - Deciding which collections to fetch, hop into or aggregate
//! - Declaring dependencies between steps
//!
//! The Planner does NOT handle:
//! - Executing queries
//! - Resolving step references
//! - Deadlines or partial-failure recovery

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{EntityIdentifierCache, ExecutionState, Intent, Plan, PreviousQueryResult};

/// Planner errors
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Failed to understand query: {0}")]
    Understanding(String),

    #[error("Failed to generate plan: {0}")]
    Generation(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Planner output for one query
#[derive(Debug, Clone)]
pub struct PlannerOutput {
    pub plan: Plan,
    pub intent: Intent,
}

impl PlannerOutput {
    pub fn new(plan: Plan, intent: Intent) -> Self {
        Self { plan, intent }
    }
}

/// Context provided to the planner
#[derive(Debug, Clone, Copy)]
pub struct PlannerContext<'a> {
    pub query: &'a str,
    pub user_id: &'a str,
    /// Prior turns of the session, oldest first
    pub previous_results: &'a [PreviousQueryResult],
    /// Entities the user has already seen
    pub entity_cache: &'a EntityIdentifierCache,
}

impl<'a> PlannerContext<'a> {
    pub fn from_state(state: &'a ExecutionState) -> Self {
        Self {
            query: &state.query,
            user_id: state.user_id(),
            previous_results: &state.previous_results,
            entity_cache: &state.entity_cache,
        }
    }
}

/// Planner trait - turns a query into a retrieval plan
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, context: &PlannerContext<'_>) -> Result<PlannerOutput, PlanError>;
}
