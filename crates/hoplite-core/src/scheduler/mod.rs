//! Parallel fetch scheduler
//!
//! Runs mutually independent fetch steps concurrently, bounded by a cap.
//! Each step's failure is isolated into an empty data set plus an error; the
//! shared data sets are only touched once every dispatched fetch has settled.

use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;

use crate::error::PipelineError;
use crate::query::QueryRunner;
use crate::store::Query;
use crate::types::{RetrievalMethod, RetrievedData, RetrievedDataSet, Step, StepId};

/// Result of one parallel batch.
#[derive(Debug, Default)]
pub struct ScheduleReport {
    /// Steps the scheduler dispatched, whether they succeeded or not
    pub dispatched: Vec<StepId>,
    /// Newly merged documents
    pub merged: usize,
    pub errors: Vec<PipelineError>,
}

impl ScheduleReport {
    pub fn dispatched_set(&self) -> HashSet<StepId> {
        self.dispatched.iter().cloned().collect()
    }
}

struct FetchOutcome {
    step_id: StepId,
    set: RetrievedDataSet,
    error: Option<PipelineError>,
}

pub struct ParallelFetchScheduler {
    max_parallel: usize,
    default_limit: usize,
}

impl ParallelFetchScheduler {
    pub fn new(max_parallel: usize, default_limit: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            default_limit,
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Independent fetch steps not yet executed, first `max_parallel` in plan order.
    pub fn select<'p>(&self, steps: &[&'p Step], completed: &HashSet<StepId>) -> Vec<&'p Step> {
        steps
            .iter()
            .copied()
            .filter(|s| s.is_independent() && !completed.contains(&s.id))
            .take(self.max_parallel)
            .collect()
    }

    /// Dispatch the selected steps concurrently and merge their results.
    pub async fn run(
        &self,
        steps: &[&Step],
        completed: &HashSet<StepId>,
        runner: QueryRunner<'_>,
        data: &mut RetrievedData,
        id_field: &str,
    ) -> ScheduleReport {
        let batch = self.select(steps, completed);
        let mut report = ScheduleReport::default();
        if batch.is_empty() {
            return report;
        }
        tracing::info!(
            dispatched = batch.len(),
            candidates = steps.len(),
            max_parallel = self.max_parallel,
            "parallel fetch batch started"
        );

        let mut in_flight = FuturesUnordered::new();
        for step in batch {
            report.dispatched.push(step.id.clone());
            let query = fetch_query(step, self.default_limit);
            in_flight.push(async move {
                let result = runner.find(&step.id, &query).await;
                let mut set = RetrievedDataSet::new(&step.collection, RetrievalMethod::Fetch, 1.0)
                    .with_limit(query.limit)
                    .with_sort(query.sort.clone());
                match result {
                    Ok(documents) => {
                        set.documents = documents;
                        set.metadata.count = set.documents.len();
                        FetchOutcome {
                            step_id: step.id.clone(),
                            set,
                            error: None,
                        }
                    }
                    Err(error) => FetchOutcome {
                        step_id: step.id.clone(),
                        set,
                        error: Some(error),
                    },
                }
            });
        }

        let mut outcomes = Vec::with_capacity(report.dispatched.len());
        while let Some(outcome) = in_flight.next().await {
            outcomes.push(outcome);
        }

        for outcome in outcomes {
            if let Some(error) = outcome.error {
                tracing::warn!(
                    step_id = %outcome.step_id,
                    collection = %outcome.set.collection,
                    error = %error,
                    "parallel fetch failed"
                );
                report.errors.push(error);
            } else {
                tracing::info!(
                    step_id = %outcome.step_id,
                    collection = %outcome.set.collection,
                    count = outcome.set.len(),
                    "parallel fetch completed"
                );
            }
            report.merged += data.merge(outcome.set, id_field);
        }
        report
    }
}

/// Query for a fetch step whose filter carries no references.
pub(crate) fn fetch_query(step: &Step, default_limit: usize) -> Query {
    Query::new(&step.collection, step.filter.clone())
        .with_sort(step.sort.clone())
        .with_limit(Some(step.limit.unwrap_or(default_limit)))
}
