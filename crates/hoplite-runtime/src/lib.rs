//! # Hoplite Runtime
//!
//! Drives a query through the stage machine:
//! - Orchestrator: planner → retriever → hopper → analyzer → critic → executor → responder
//! - Whole-run and per-stage deadlines with partial results on expiry
//! - Session memory read at run start and written at run end
//! - Progress reporting and run summaries
//! - Bootstrap from `hoplite.yaml`, including tracing setup

mod bootstrap;
mod orchestrator;
mod progress;
mod summary;

pub use bootstrap::{
    build_orchestrator, deadline_budgets, entity_schema, init_tracing_if_needed,
    orchestrator_config, BootstrapError, RuntimeApp,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunOutcome};
pub use progress::{RunProgressEvent, RunProgressReporter};
pub use summary::RunSummary;
