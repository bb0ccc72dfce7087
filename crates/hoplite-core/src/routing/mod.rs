//! Stage transition table
//!
//! Every transition is a pure function of the finished stage and the run
//! state. A stage that failed without producing its output falls through to
//! the responder.

use crate::types::{ExecutionState, Stage};

/// Knobs the transition table reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingPolicy {
    /// Upper bound of critic -> analyzer round trips
    pub max_iterations: u32,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self { max_iterations: 2 }
    }
}

/// Stage to run after `stage` has finished.
pub fn next_stage(stage: Stage, state: &ExecutionState, policy: &RoutingPolicy) -> Stage {
    match stage {
        Stage::Planner => after_planner(state),
        Stage::Retriever => after_retriever(state),
        Stage::Hopper => Stage::Analyzer,
        Stage::Analyzer => after_analyzer(state),
        Stage::Critic => after_critic(state, policy),
        Stage::Executor => after_executor(state),
        Stage::Responder => Stage::Done,
        terminal @ (Stage::AwaitingConfirmation | Stage::Error | Stage::Done) => terminal,
    }
}

pub fn after_planner(state: &ExecutionState) -> Stage {
    if state.plan.is_some() {
        Stage::Retriever
    } else {
        Stage::Responder
    }
}

pub fn after_retriever(state: &ExecutionState) -> Stage {
    if state.budget_exhausted {
        return Stage::Error;
    }
    let Some(plan) = state.plan.as_ref() else {
        return Stage::Responder;
    };
    if plan.has_pipeline_aggregate() {
        return Stage::Analyzer;
    }
    if state.intent.requires_external_action() {
        return Stage::Executor;
    }
    if plan.has_hops() {
        return Stage::Hopper;
    }
    if plan.has_fetches() || !state.retrieved_data.is_empty() {
        return Stage::Analyzer;
    }
    Stage::Responder
}

pub fn after_analyzer(state: &ExecutionState) -> Stage {
    if state.analysis.is_none() {
        return Stage::Responder;
    }
    if state.intent.requires_external_action() {
        return Stage::Executor;
    }
    if state.plan.as_ref().is_some_and(|p| p.requires_validation) {
        return Stage::Critic;
    }
    Stage::Responder
}

pub fn after_critic(state: &ExecutionState, policy: &RoutingPolicy) -> Stage {
    let invalid = state.validation.as_ref().is_some_and(|v| !v.valid);
    if invalid && state.iteration < policy.max_iterations {
        return Stage::Analyzer;
    }
    if state.intent.requires_external_action() {
        Stage::Executor
    } else {
        Stage::Responder
    }
}

pub fn after_executor(state: &ExecutionState) -> Stage {
    match state
        .action_outcome
        .as_ref()
        .and_then(|o| o.needs_confirmation_request())
    {
        Some(_) => Stage::AwaitingConfirmation,
        None => Stage::Responder,
    }
}
