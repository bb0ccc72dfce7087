//! Session boundary types: prior-turn results and per-session state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dataset::RetrievedData;
use super::entity::EntityIdentifierCache;

/// Identifies the conversation a run belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub session_id: String,
    pub user_id: String,
}

impl SessionKey {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Per-collection document counts of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResultCounts {
    pub total_documents: usize,
    pub per_collection: Vec<(String, usize)>,
}

impl ResultCounts {
    pub fn from_data(data: &RetrievedData) -> Self {
        Self {
            total_documents: data.total_documents(),
            per_collection: data
                .iter()
                .map(|s| (s.collection.clone(), s.len()))
                .collect(),
        }
    }
}

/// What an earlier turn of the session retrieved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousQueryResult {
    pub query: String,
    pub timestamp: DateTime<Utc>,
    pub retrieved_data: RetrievedData,
    pub counts: ResultCounts,
}

impl PreviousQueryResult {
    pub fn new(query: impl Into<String>, retrieved_data: RetrievedData) -> Self {
        let counts = ResultCounts::from_data(&retrieved_data);
        Self {
            query: query.into(),
            timestamp: Utc::now(),
            retrieved_data,
            counts,
        }
    }
}

/// Session state read at run start.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionSnapshot {
    /// Oldest first
    pub previous_results: Vec<PreviousQueryResult>,
    pub entity_cache: EntityIdentifierCache,
}
