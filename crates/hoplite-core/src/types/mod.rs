//! Core type definitions for hoplite
//!
//! - Plan / Step / HopPath: what the planner asks for
//! - Filter: typed predicate tree with step references
//! - RetrievedData: per-collection accumulated results
//! - EntityIdentifierCache: cross-turn entity memory
//! - ExecutionState: everything threaded through the stages of one run

mod dataset;
mod entity;
mod filter;
mod intent;
mod plan;
mod schema;
mod session;
mod state;
mod step;

pub use dataset::{
    canonical_id, collect_ids, values_at_path, DataSetMetadata, Document, RetrievalMethod,
    RetrievedData, RetrievedDataSet,
};
pub use entity::{EntityIdentifierCache, IdList};
pub use filter::{Condition, EntityKind, Filter, FilterError, Operand, RefArity, StepOutputRef};
pub use intent::{Intent, IntentKind, INTERNAL_ACTIONS};
pub use plan::Plan;
pub use schema::EntitySchema;
pub use session::{PreviousQueryResult, ResultCounts, SessionKey, SessionSnapshot};
pub use state::{ExecutionState, Stage};
pub use step::{Cardinality, HopPath, SortOrder, SortSpec, Step, StepId, StepKind};
