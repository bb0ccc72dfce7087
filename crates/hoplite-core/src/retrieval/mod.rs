//! Retrieval engine
//!
//! Executes the fetch and aggregate steps of a plan:
//! - aggregates with a pipeline run against their collection and short-circuit
//! - aggregates without a pipeline degrade to fetches
//! - independent fetches go through the parallel scheduler
//! - remaining fetches run in plan order with references resolved
//!
//! Single-step failures are recorded and the engine moves on. Running out of
//! the whole-run budget aborts the stage.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use crate::deadline::DeadlineSupervisor;
use crate::error::PipelineError;
use crate::query::QueryRunner;
use crate::resolver::PlaceholderResolver;
use crate::scheduler::ParallelFetchScheduler;
use crate::store::{DocumentStore, Query};
use crate::types::{EntitySchema, ExecutionState, Plan, RetrievalMethod, RetrievedDataSet, Step};

pub const DEFAULT_USER_TOKEN: &str = "CURRENT_USER_ID";

/// Retrieval tuning
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalSettings {
    pub max_parallel_fetches: usize,
    pub parallel_fetch_enabled: bool,
    /// Limit for fetches that do not set one, including degraded aggregates
    pub default_limit: usize,
    /// Token in aggregation pipelines replaced by the acting user's id
    pub user_token: String,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            max_parallel_fetches: 4,
            parallel_fetch_enabled: true,
            default_limit: 100,
            user_token: DEFAULT_USER_TOKEN.to_string(),
        }
    }
}

/// What the engine did during one stage run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalReport {
    pub aggregated: usize,
    pub parallel_dispatched: usize,
    pub sequential_executed: usize,
    pub degraded: usize,
    pub failed_steps: usize,
    pub reused_prior: bool,
    pub aborted: bool,
}

pub struct RetrievalEngine {
    store: Arc<dyn DocumentStore>,
    schema: EntitySchema,
    settings: RetrievalSettings,
    scheduler: ParallelFetchScheduler,
}

impl RetrievalEngine {
    pub fn new(store: Arc<dyn DocumentStore>, schema: EntitySchema) -> Self {
        Self::with_settings(store, schema, RetrievalSettings::default())
    }

    pub fn with_settings(
        store: Arc<dyn DocumentStore>,
        schema: EntitySchema,
        settings: RetrievalSettings,
    ) -> Self {
        let scheduler =
            ParallelFetchScheduler::new(settings.max_parallel_fetches, settings.default_limit);
        Self {
            store,
            schema,
            settings,
            scheduler,
        }
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    /// Run the plan's fetch and aggregate steps against `state`.
    pub async fn execute(
        &self,
        state: &mut ExecutionState,
        supervisor: &DeadlineSupervisor,
    ) -> RetrievalReport {
        let mut report = RetrievalReport::default();
        let plan = state.plan.clone().unwrap_or_default();
        if let Err(error) = supervisor.check_global_budget(state.started_at) {
            abort(state, error, &mut report);
            return report;
        }
        let runner = QueryRunner::new(self.store.as_ref(), supervisor, state.started_at);

        if plan.has_pipeline_aggregate() {
            self.run_aggregates(&plan, runner, state, &mut report).await;
            state.refresh_derived(&self.schema);
            return report;
        }

        let fetches = self.fetch_partition(&plan, state, &mut report);
        if fetches.is_empty() {
            self.without_fetches(&plan, state, &mut report);
            state.refresh_derived(&self.schema);
            return report;
        }

        let mut completed = HashSet::new();
        if self.settings.parallel_fetch_enabled {
            let candidates: Vec<&Step> = fetches.iter().collect();
            let scheduled = self
                .scheduler
                .run(
                    &candidates,
                    &completed,
                    runner,
                    &mut state.retrieved_data,
                    &self.schema.id_field,
                )
                .await;
            report.parallel_dispatched = scheduled.dispatched.len();
            report.failed_steps += scheduled.errors.len();
            for error in scheduled.errors {
                if error.is_global_deadline() {
                    report.aborted = true;
                    state.budget_exhausted = true;
                }
                state.push_error(error);
            }
            completed.extend(scheduled.dispatched);
        }

        if !report.aborted {
            for step in fetches.iter().filter(|s| !completed.contains(&s.id)) {
                if let Err(error) = supervisor.check_global_budget(state.started_at) {
                    abort(state, error, &mut report);
                    break;
                }
                report.sequential_executed += 1;
                if let Err(error) = self.fetch_step(step, &plan, runner, state, &mut report).await {
                    abort(state, error, &mut report);
                    break;
                }
            }
        }

        state.refresh_derived(&self.schema);
        tracing::info!(
            run_id = %state.run_id,
            parallel = report.parallel_dispatched,
            sequential = report.sequential_executed,
            failed = report.failed_steps,
            collections = state.retrieved_data.len(),
            documents = state.retrieved_data.total_documents(),
            "retrieval finished"
        );
        report
    }

    /// Fetch steps in plan order, with pipeline-less aggregates degraded.
    fn fetch_partition(
        &self,
        plan: &Plan,
        state: &mut ExecutionState,
        report: &mut RetrievalReport,
    ) -> Vec<Step> {
        let mut fetches = Vec::new();
        for step in plan.fetch_like_steps() {
            if step.is_malformed_aggregate() {
                tracing::warn!(
                    run_id = %state.run_id,
                    step_id = %step.id,
                    collection = %step.collection,
                    "aggregate step without pipeline, degrading to fetch"
                );
                state.push_error(PipelineError::MalformedPlan {
                    step_id: step.id.clone(),
                    reason: "aggregate without pipeline, executed as fetch".to_string(),
                });
                report.degraded += 1;
                fetches.push(degrade(step, self.settings.default_limit));
            } else {
                fetches.push(step.clone());
            }
        }
        fetches
    }

    /// Returns `Err` only when the whole-run budget ran out.
    async fn fetch_step(
        &self,
        step: &Step,
        plan: &Plan,
        runner: QueryRunner<'_>,
        state: &mut ExecutionState,
        report: &mut RetrievalReport,
    ) -> Result<(), PipelineError> {
        let resolution = PlaceholderResolver::new(&self.schema).resolve_filter(
            &step.filter,
            &step.id,
            &step.depends_on,
            plan,
            &state.retrieved_data,
        );
        for error in resolution.errors(&step.id) {
            state.push_error(error);
        }

        let query = Query::new(&step.collection, resolution.filter)
            .with_sort(step.sort.clone())
            .with_limit(Some(step.limit.unwrap_or(self.settings.default_limit)));
        let mut set = RetrievedDataSet::new(&step.collection, RetrievalMethod::Fetch, 1.0)
            .with_limit(query.limit)
            .with_sort(query.sort.clone());

        match runner.find(&step.id, &query).await {
            Ok(documents) => {
                set.merge_documents(documents, &self.schema.id_field);
                tracing::info!(
                    run_id = %state.run_id,
                    step_id = %step.id,
                    collection = %step.collection,
                    count = set.len(),
                    "fetch completed"
                );
            }
            Err(error) if error.is_global_deadline() => return Err(error),
            Err(error) => {
                tracing::warn!(
                    run_id = %state.run_id,
                    step_id = %step.id,
                    collection = %step.collection,
                    error = %error,
                    "fetch failed"
                );
                report.failed_steps += 1;
                state.push_error(error);
            }
        }
        state.retrieved_data.merge(set, &self.schema.id_field);
        Ok(())
    }

    async fn run_aggregates(
        &self,
        plan: &Plan,
        runner: QueryRunner<'_>,
        state: &mut ExecutionState,
        report: &mut RetrievalReport,
    ) {
        for step in plan.pipeline_steps() {
            let Some(pipeline) = step.pipeline() else {
                continue;
            };
            let pipeline: Vec<Value> = pipeline
                .iter()
                .map(|stage| {
                    substitute_user_token(stage, &self.settings.user_token, state.user_id())
                })
                .collect();
            let mut set = RetrievedDataSet::new(&step.collection, RetrievalMethod::Aggregate, 1.0);
            match runner.aggregate(&step.id, &step.collection, &pipeline).await {
                Ok(documents) => {
                    set.merge_documents(documents, &self.schema.id_field);
                    report.aggregated += 1;
                    tracing::info!(
                        run_id = %state.run_id,
                        step_id = %step.id,
                        collection = %step.collection,
                        count = set.len(),
                        "aggregation completed"
                    );
                }
                Err(error) => {
                    let global = error.is_global_deadline();
                    tracing::warn!(
                        run_id = %state.run_id,
                        step_id = %step.id,
                        collection = %step.collection,
                        error = %error,
                        "aggregation failed"
                    );
                    report.failed_steps += 1;
                    if global {
                        abort(state, error, report);
                        break;
                    }
                    state.push_error(error);
                }
            }
            state.retrieved_data.merge(set, &self.schema.id_field);
        }
    }

    fn without_fetches(
        &self,
        plan: &Plan,
        state: &mut ExecutionState,
        report: &mut RetrievalReport,
    ) {
        if plan.has_hops() {
            tracing::debug!(run_id = %state.run_id, "no fetch steps, hopping from empty data");
            return;
        }
        let reused: Vec<RetrievedDataSet> = state
            .latest_previous_data()
            .map(|previous| previous.retrieved_data.iter().cloned().collect())
            .unwrap_or_default();
        if !reused.is_empty() {
            for mut set in reused {
                set.metadata.method = RetrievalMethod::Prior;
                state.retrieved_data.merge(set, &self.schema.id_field);
            }
            report.reused_prior = true;
            tracing::info!(
                run_id = %state.run_id,
                collections = state.retrieved_data.len(),
                "reusing previous turn results"
            );
            return;
        }
        if !state.intent.is_informational() {
            state.empty_result = true;
        }
    }
}

fn abort(state: &mut ExecutionState, error: PipelineError, report: &mut RetrievalReport) {
    tracing::error!(run_id = %state.run_id, error = %error, "retrieval aborted");
    report.aborted = true;
    state.budget_exhausted = true;
    state.push_error(error);
}

/// Fetch equivalent of an aggregate step that lacks a pipeline.
pub fn degrade(step: &Step, default_limit: usize) -> Step {
    let mut fetch = Step::fetch(step.id.clone(), step.collection.clone())
        .with_filter(step.filter.clone())
        .with_depends_on(step.depends_on.clone())
        .with_limit(default_limit);
    fetch.sort = step.sort.clone();
    fetch
}

/// Replace `token` with `user_id` in every string of a pipeline stage.
pub fn substitute_user_token(value: &Value, token: &str, user_id: &str) -> Value {
    match value {
        Value::String(s) if s.contains(token) => Value::String(s.replace(token, user_id)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute_user_token(v, token, user_id))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_user_token(v, token, user_id)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::DeadlineBudgets;
    use crate::test_support::RecordingStore;
    use crate::types::{
        Filter, Intent, IntentKind, PreviousQueryResult, RetrievedData, SessionKey, StepId,
    };
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn filter(value: Value) -> Filter {
        Filter::try_from(value).expect("filter")
    }

    fn state_with(plan: Plan) -> ExecutionState {
        ExecutionState::new("q", SessionKey::new("s1", "u1")).with_plan(plan)
    }

    fn engine(store: Arc<RecordingStore>) -> RetrievalEngine {
        RetrievalEngine::new(store, EntitySchema::default())
    }

    #[test]
    fn test_sequential_fetch_resolves_reference_from_parallel_batch() {
        tokio_test::block_on(async {
            let store = Arc::new(
                RecordingStore::new()
                    .with_collection(
                        "organizations",
                        json!([
                            {"_id": "A", "country": "US", "profileModelId": "m1"},
                            {"_id": "B", "country": "US"},
                            {"_id": "C", "country": "DE"}
                        ]),
                    )
                    .with_collection(
                        "deals",
                        json!([
                            {"_id": "d1", "organizationId": "A"},
                            {"_id": "d2", "organizationId": "Z"}
                        ]),
                    ),
            );
            let plan = Plan::new(vec![
                Step::fetch("0", "organizations").with_filter(filter(json!({"country": "US"}))),
                Step::fetch("1", "deals")
                    .with_filter(filter(json!({
                        "organizationId": {"$in": ["FROM_STEP_0_ORGANIZATION_IDS"]}
                    })))
                    .with_depends_on(vec!["0".into()]),
            ]);
            let mut state = state_with(plan);
            let supervisor = DeadlineSupervisor::default();

            let report = engine(store.clone()).execute(&mut state, &supervisor).await;

            assert_eq!(report.parallel_dispatched, 1);
            assert_eq!(report.sequential_executed, 1);
            let deals = store.queries_for("deals");
            assert_eq!(
                deals[0].filter.to_json(),
                json!({"organizationId": {"$in": ["A", "B"]}})
            );
            assert_eq!(state.retrieved_data.get("deals").expect("deals").len(), 1);
            assert_eq!(state.flattened_data.len(), 3);
            assert_eq!(state.entity_cache.organizations.as_slice(), ["A", "B"]);
            assert_eq!(state.entity_cache.models.as_slice(), ["m1"]);
            assert!(!state.has_errors());
        });
    }

    #[test]
    fn test_malformed_aggregate_degrades_to_fetch_with_default_limit() {
        tokio_test::block_on(async {
            let store = Arc::new(
                RecordingStore::new()
                    .with_collection("organizations", json!([{"_id": "o1", "industry": "fintech"}])),
            );
            let plan = Plan::new(vec![Step::aggregate("0", "organizations", None)
                .with_filter(filter(json!({"industry": "fintech"})))]);
            let mut state = state_with(plan);

            let report = engine(store.clone())
                .execute(&mut state, &DeadlineSupervisor::default())
                .await;

            assert_eq!(report.degraded, 1);
            let queries = store.queries_for("organizations");
            assert_eq!(queries.len(), 1);
            assert_eq!(queries[0].limit, Some(100));
            assert_eq!(queries[0].filter.to_json(), json!({"industry": "fintech"}));
            assert!(state.retrieved_data.has_documents("organizations"));
            assert_eq!(state.errors()[0].kind(), "malformed_plan");
            assert!(!report.aborted);
        });
    }

    #[test]
    fn test_aggregate_pipeline_substitutes_user_and_skips_fetches() {
        tokio_test::block_on(async {
            let store = Arc::new(
                RecordingStore::new()
                    .with_collection("deals", json!([{"_id": "open", "total": 3}])),
            );
            let pipeline = vec![
                json!({"$match": {"ownerId": "CURRENT_USER_ID"}}),
                json!({"$group": {"_id": "$stage", "total": {"$sum": 1}}}),
            ];
            let plan = Plan::new(vec![
                Step::aggregate("0", "deals", Some(pipeline)),
                Step::fetch("1", "organizations"),
            ]);
            let mut state = state_with(plan);

            let report = engine(store.clone())
                .execute(&mut state, &DeadlineSupervisor::default())
                .await;

            assert_eq!(report.aggregated, 1);
            assert!(store.queries().is_empty());
            let pipelines = store.pipelines.lock().expect("lock").clone();
            assert_eq!(pipelines[0].1[0], json!({"$match": {"ownerId": "u1"}}));
            let set = state.retrieved_data.get("deals").expect("deals");
            assert_eq!(set.metadata.method, RetrievalMethod::Aggregate);
        });
    }

    #[test]
    fn test_failed_fetch_is_recorded_and_siblings_continue() {
        tokio_test::block_on(async {
            let store = Arc::new(
                RecordingStore::new()
                    .with_collection("organizations", json!([{"_id": "o1"}]))
                    .failing("people"),
            );
            let plan = Plan::new(vec![
                Step::fetch("0", "people"),
                Step::fetch("1", "organizations"),
            ]);
            let mut state = state_with(plan);

            let report = RetrievalEngine::with_settings(
                store,
                EntitySchema::default(),
                RetrievalSettings {
                    parallel_fetch_enabled: false,
                    ..RetrievalSettings::default()
                },
            )
            .execute(&mut state, &DeadlineSupervisor::default())
            .await;

            assert_eq!(report.sequential_executed, 2);
            assert_eq!(report.failed_steps, 1);
            assert_eq!(state.errors()[0].kind(), "query_failure");
            assert!(state.retrieved_data.get("people").expect("empty set").is_empty());
            assert!(state.retrieved_data.has_documents("organizations"));
        });
    }

    #[test]
    fn test_exhausted_budget_aborts_stage() {
        tokio_test::block_on(async {
            let store = Arc::new(RecordingStore::new());
            let mut state = state_with(Plan::new(vec![Step::fetch("0", "organizations")]));
            state.started_at = Instant::now() - Duration::from_millis(200);
            let supervisor = DeadlineSupervisor::new(
                DeadlineBudgets::default().with_total(Duration::from_millis(100)),
            );

            let report = engine(store.clone()).execute(&mut state, &supervisor).await;

            assert!(report.aborted);
            assert!(state.budget_exhausted);
            assert!(state.errors()[0].is_global_deadline());
            assert!(store.queries().is_empty());
        });
    }

    #[test]
    fn test_no_steps_reuses_previous_turn() {
        tokio_test::block_on(async {
            let mut previous = RetrievedData::new();
            let mut set = RetrievedDataSet::new("organizations", RetrievalMethod::Fetch, 1.0);
            set.merge_documents(crate::test_support::docs(json!([{"_id": "o9"}])), "_id");
            previous.merge(set, "_id");

            let mut state = state_with(Plan::default());
            state.previous_results = vec![PreviousQueryResult::new("earlier", previous)];

            let report = engine(Arc::new(RecordingStore::new()))
                .execute(&mut state, &DeadlineSupervisor::default())
                .await;

            assert!(report.reused_prior);
            let reused = state.retrieved_data.get("organizations").expect("reused");
            assert_eq!(reused.metadata.method, RetrievalMethod::Prior);
            assert!(!state.empty_result);
        });
    }

    #[test]
    fn test_no_steps_and_no_history_marks_empty_result() {
        tokio_test::block_on(async {
            let engine = engine(Arc::new(RecordingStore::new()));

            let mut query = state_with(Plan::default());
            engine.execute(&mut query, &DeadlineSupervisor::default()).await;
            assert!(query.empty_result);
            assert!(query.retrieved_data.is_empty());

            let mut informational = state_with(Plan::default())
                .with_intent(Intent::new(IntentKind::Informational));
            engine
                .execute(&mut informational, &DeadlineSupervisor::default())
                .await;
            assert!(!informational.empty_result);
        });
    }

    #[test]
    fn test_substitute_user_token_walks_nested_values() {
        let stage = json!({"$match": {"$or": [{"owner": "CURRENT_USER_ID"}, {"tags": ["x"]}]}});
        assert_eq!(
            substitute_user_token(&stage, "CURRENT_USER_ID", "u7"),
            json!({"$match": {"$or": [{"owner": "u7"}, {"tags": ["x"]}]}})
        );
        let degraded = degrade(&Step::aggregate("a", "orgs", None), 100);
        assert!(degraded.is_fetch());
        assert_eq!(degraded.id, StepId::from("a"));
    }
}
