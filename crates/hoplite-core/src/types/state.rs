//! ExecutionState - mutable context threaded through every stage of a run

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::action::ActionOutcome;
use crate::analysis::{Analysis, Validation};
use crate::error::PipelineError;

use super::dataset::{Document, RetrievedData};
use super::entity::EntityIdentifierCache;
use super::intent::Intent;
use super::plan::Plan;
use super::schema::EntitySchema;
use super::session::{PreviousQueryResult, SessionKey, SessionSnapshot};

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planner,
    Retriever,
    Hopper,
    Analyzer,
    Critic,
    Executor,
    Responder,
    /// Stopped until the user approves a planned external action
    AwaitingConfirmation,
    /// Stopped on a stage-level failure
    Error,
    /// Normal completion after the responder
    Done,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::Planner,
        Stage::Retriever,
        Stage::Hopper,
        Stage::Analyzer,
        Stage::Critic,
        Stage::Executor,
        Stage::Responder,
        Stage::AwaitingConfirmation,
        Stage::Error,
        Stage::Done,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Retriever => "retriever",
            Self::Hopper => "hopper",
            Self::Analyzer => "analyzer",
            Self::Critic => "critic",
            Self::Executor => "executor",
            Self::Responder => "responder",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Error => "error",
            Self::Done => "done",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AwaitingConfirmation | Self::Error | Self::Done)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// State of one run. Owned exclusively by that run.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub run_id: String,
    pub query: String,
    pub session: SessionKey,
    pub plan: Option<Plan>,
    pub intent: Intent,
    pub retrieved_data: RetrievedData,
    pub flattened_data: Vec<Document>,
    pub entity_cache: EntityIdentifierCache,
    /// Prior turns of the session, oldest first
    pub previous_results: Vec<PreviousQueryResult>,
    pub analysis: Option<Analysis>,
    pub validation: Option<Validation>,
    pub action_outcome: Option<ActionOutcome>,
    pub answer: Option<String>,
    /// Critique loop counter
    pub iteration: u32,
    /// Set when retrieval found nothing to fetch and nothing to reuse
    pub empty_result: bool,
    /// Set when the global budget ran out
    pub budget_exhausted: bool,
    pub next_stage: Stage,
    pub started_at: Instant,
    stage_started: HashMap<Stage, Instant>,
    errors: Vec<PipelineError>,
}

impl ExecutionState {
    pub fn new(query: impl Into<String>, session: SessionKey) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            query: query.into(),
            session,
            plan: None,
            intent: Intent::default(),
            retrieved_data: RetrievedData::new(),
            flattened_data: Vec::new(),
            entity_cache: EntityIdentifierCache::new(),
            previous_results: Vec::new(),
            analysis: None,
            validation: None,
            action_outcome: None,
            answer: None,
            iteration: 0,
            empty_result: false,
            budget_exhausted: false,
            next_stage: Stage::Planner,
            started_at: Instant::now(),
            stage_started: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Seed prior-turn data read from the session store.
    pub fn with_snapshot(mut self, snapshot: SessionSnapshot) -> Self {
        self.previous_results = snapshot.previous_results;
        self.entity_cache = snapshot.entity_cache;
        self
    }

    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_intent(mut self, intent: Intent) -> Self {
        self.intent = intent;
        self
    }

    pub fn user_id(&self) -> &str {
        &self.session.user_id
    }

    /// Append an error. The list is never cleared during a run.
    pub fn push_error(&mut self, error: PipelineError) {
        self.errors.push(error);
    }

    pub fn errors(&self) -> &[PipelineError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn mark_stage_started(&mut self, stage: Stage) {
        self.stage_started.insert(stage, Instant::now());
    }

    /// Override a stage start time; used when resuming or replaying runs.
    pub fn set_stage_started(&mut self, stage: Stage, at: Instant) {
        self.stage_started.insert(stage, at);
    }

    pub fn stage_started(&self) -> &HashMap<Stage, Instant> {
        &self.stage_started
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Recompute the flattened document list and refresh the entity cache.
    pub fn refresh_derived(&mut self, schema: &EntitySchema) {
        self.flattened_data = self.retrieved_data.flatten();
        self.entity_cache.refresh_from(&self.retrieved_data, schema);
    }

    /// Most recent prior-turn result that actually holds data.
    pub fn latest_previous_data(&self) -> Option<&PreviousQueryResult> {
        self.previous_results
            .iter()
            .rev()
            .find(|r| !r.retrieved_data.is_empty())
    }
}
