//! RunSummary - what a finished run hands to the session boundary

use serde::Serialize;

use hoplite_core::types::{ExecutionState, ResultCounts, Stage};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub query: String,
    pub final_stage: Stage,
    pub counts: ResultCounts,
    pub organizations: Vec<String>,
    pub people: Vec<String>,
    pub models: Vec<String>,
    /// Stable tags of every recorded error, in order
    pub error_kinds: Vec<String>,
    pub iterations: u32,
    pub elapsed_ms: u64,
    pub answer: Option<String>,
}

impl RunSummary {
    pub fn from_state(state: &ExecutionState) -> Self {
        Self {
            run_id: state.run_id.clone(),
            query: state.query.clone(),
            final_stage: state.next_stage,
            counts: ResultCounts::from_data(&state.retrieved_data),
            organizations: state.entity_cache.organizations.as_slice().to_vec(),
            people: state.entity_cache.people.as_slice().to_vec(),
            models: state.entity_cache.models.as_slice().to_vec(),
            error_kinds: state
                .errors()
                .iter()
                .map(|e| e.kind().to_string())
                .collect(),
            iterations: state.iteration,
            elapsed_ms: u64::try_from(state.elapsed().as_millis()).unwrap_or(u64::MAX),
            answer: state.answer.clone(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.final_stage == Stage::Done
    }

    pub fn has_deadline_error(&self) -> bool {
        self.error_kinds.iter().any(|k| k == "deadline_exceeded")
    }
}
