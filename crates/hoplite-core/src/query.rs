//! Supervised data-store access shared by fetch, aggregate and hop execution

use serde_json::Value;
use std::time::Instant;

use crate::deadline::DeadlineSupervisor;
use crate::error::PipelineError;
use crate::store::{DocumentStore, Query};
use crate::types::{Document, StepId};

pub(crate) const MAX_LOG_JSON_CHARS: usize = 2_000;

pub(crate) fn truncate_for_log(input: &str, max_chars: usize) -> String {
    let char_count = input.chars().count();
    if char_count <= max_chars {
        return input.to_string();
    }
    let mut preview: String = input.chars().take(max_chars).collect();
    preview.push_str(&format!("... [truncated, total_chars={}]", char_count));
    preview
}

pub(crate) fn truncate_json_for_log(value: &Value, max_chars: usize) -> String {
    truncate_for_log(&value.to_string(), max_chars)
}

/// Issues store calls bounded by the query budget and by what is left of the run.
#[derive(Clone, Copy)]
pub struct QueryRunner<'a> {
    store: &'a dyn DocumentStore,
    supervisor: &'a DeadlineSupervisor,
    started_at: Instant,
}

impl<'a> QueryRunner<'a> {
    pub fn new(
        store: &'a dyn DocumentStore,
        supervisor: &'a DeadlineSupervisor,
        started_at: Instant,
    ) -> Self {
        Self {
            store,
            supervisor,
            started_at,
        }
    }

    pub fn supervisor(&self) -> &DeadlineSupervisor {
        self.supervisor
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub async fn find(
        &self,
        step_id: &StepId,
        query: &Query,
    ) -> Result<Vec<Document>, PipelineError> {
        let budget = self.supervisor.query_deadline(self.started_at)?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                step_id = %step_id,
                collection = %query.collection,
                filter = %truncate_json_for_log(&query.filter.to_json(), MAX_LOG_JSON_CHARS),
                limit = ?query.limit,
                "issuing query"
            );
        }
        let label = format!("query {} ({})", query.collection, step_id);
        self.supervisor
            .with_timeout(self.store.find(query), budget, &label)
            .await?
            .map_err(|e| PipelineError::QueryFailure {
                step_id: step_id.clone(),
                collection: query.collection.clone(),
                message: e.to_string(),
            })
    }

    pub async fn aggregate(
        &self,
        step_id: &StepId,
        collection: &str,
        pipeline: &[Value],
    ) -> Result<Vec<Document>, PipelineError> {
        let budget = self.supervisor.query_deadline(self.started_at)?;
        tracing::debug!(
            step_id = %step_id,
            collection = %collection,
            stages = pipeline.len(),
            "issuing aggregation"
        );
        let label = format!("aggregate {} ({})", collection, step_id);
        self.supervisor
            .with_timeout(self.store.aggregate(collection, pipeline), budget, &label)
            .await?
            .map_err(|e| PipelineError::QueryFailure {
                step_id: step_id.clone(),
                collection: collection.to_string(),
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_for_log_marks_cut() {
        let text = "x".repeat(20);
        assert_eq!(truncate_for_log(&text, 30), text);
        let cut = truncate_for_log(&text, 5);
        assert!(cut.starts_with("xxxxx..."));
        assert!(cut.ends_with("total_chars=20]"));
    }
}
