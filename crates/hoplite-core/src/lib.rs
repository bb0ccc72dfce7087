//! # Hoplite Core
//!
//! Retrieval and hop orchestration for question answering over a
//! multi-collection business dataset.
//!
//! This crate contains:
//! - Plan / Step / Filter / RetrievedDataSet / ExecutionState definitions
//! - Deadline supervision, placeholder resolution and parallel fetch scheduling
//! - The retrieval engine, the hop resolver and the stage transition table
//! - Collaborator traits: planner, analysis stages, action executor, stores
//!
//! This crate does NOT care about:
//! - How plans are generated or answers are worded
//! - Which database backs the document store
//! - Transport (HTTP/SSE) concerns

pub mod action;
pub mod analysis;
pub mod deadline;
pub mod error;
pub mod hop;
pub mod planner;
pub mod query;
pub mod resolver;
pub mod retrieval;
pub mod routing;
pub mod scheduler;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::action::{ActionError, ActionExecutor, ActionOutcome, ApprovalRequest};
    pub use crate::analysis::{
        Analysis, AnalysisError, Analyzer, CountingResponder, Critic, Responder, Response,
        Validation,
    };
    pub use crate::deadline::{with_timeout, DeadlineBudgets, DeadlineSupervisor};
    pub use crate::error::PipelineError;
    pub use crate::hop::{HopReport, HopResolver, HopRule, HopSettings};
    pub use crate::planner::{PlanError, Planner, PlannerContext, PlannerOutput};
    pub use crate::resolver::{PlaceholderResolver, Resolution};
    pub use crate::retrieval::{RetrievalEngine, RetrievalReport, RetrievalSettings};
    pub use crate::routing::{next_stage, RoutingPolicy};
    pub use crate::scheduler::{ParallelFetchScheduler, ScheduleReport};
    pub use crate::store::{DocumentStore, Query, SessionStore, StoreError};
    pub use crate::types::{
        Cardinality, Document, EntityIdentifierCache, EntityKind, EntitySchema, ExecutionState,
        Filter, HopPath, Intent, IntentKind, Plan, PreviousQueryResult, RetrievalMethod,
        RetrievedData, RetrievedDataSet, SessionKey, SessionSnapshot, Stage, Step, StepId,
        StepKind, StepOutputRef,
    };
}

// Re-export key types at crate root
pub use deadline::DeadlineSupervisor;
pub use error::PipelineError;
pub use hop::HopResolver;
pub use retrieval::RetrievalEngine;
pub use store::{DocumentStore, SessionStore, StoreError};
pub use types::{ExecutionState, Plan, Stage, Step, StepId};
