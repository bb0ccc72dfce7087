//! Hop resolver
//!
//! Executes relational joins ("hops") between collections:
//! - takes the step's explicit path or infers one from [`rules`]
//! - picks the source data set and extracts its join keys
//! - queries the target collection by key membership plus the step's own filter
//! - merges into the target's data set and refreshes the entity cache
//!
//! Hop failures only reduce what was retrieved; the stage never aborts the run.

pub mod rules;

use std::collections::HashSet;
use std::sync::Arc;

use crate::deadline::DeadlineSupervisor;
use crate::error::PipelineError;
use crate::query::QueryRunner;
use crate::resolver::PlaceholderResolver;
use crate::store::{DocumentStore, Query};
use crate::types::{
    collect_ids, EntitySchema, ExecutionState, Filter, HopPath, Plan, RetrievalMethod,
    RetrievedData, RetrievedDataSet, Step, StepOutputRef,
};

pub use rules::{default_rules, infer_path, HopContext, HopRule};

pub const DEFAULT_HOP_CONFIDENCE: f64 = 0.9;

#[derive(Debug, Clone, PartialEq)]
pub struct HopSettings {
    /// Confidence recorded on data sets created by a join
    pub confidence: f64,
    pub default_limit: usize,
}

impl Default for HopSettings {
    fn default() -> Self {
        Self {
            confidence: DEFAULT_HOP_CONFIDENCE,
            default_limit: 100,
        }
    }
}

/// What the resolver did during one stage run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HopReport {
    pub joined: usize,
    pub inferred: usize,
    pub fallback: usize,
    pub skipped: usize,
    pub failed: usize,
    pub merged_documents: usize,
}

/// Source data set chosen for a join and the keys read from it.
struct JoinSource {
    collection: String,
    keys: Vec<String>,
}

pub struct HopResolver {
    store: Arc<dyn DocumentStore>,
    schema: EntitySchema,
    rules: Vec<HopRule>,
    settings: HopSettings,
}

impl HopResolver {
    pub fn new(store: Arc<dyn DocumentStore>, schema: EntitySchema) -> Self {
        Self {
            store,
            schema,
            rules: default_rules(),
            settings: HopSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: HopSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_rules(mut self, rules: Vec<HopRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn rules(&self) -> &[HopRule] {
        &self.rules
    }

    /// Execute every hop step of the current plan.
    pub async fn resolve(
        &self,
        state: &mut ExecutionState,
        supervisor: &DeadlineSupervisor,
    ) -> HopReport {
        let mut report = HopReport::default();
        let plan = state.plan.clone().unwrap_or_default();
        let runner = QueryRunner::new(self.store.as_ref(), supervisor, state.started_at);

        for step in plan.hop_steps() {
            if let Err(error) = supervisor.check_global_budget(state.started_at) {
                tracing::error!(
                    run_id = %state.run_id,
                    step_id = %step.id,
                    error = %error,
                    "run budget spent before hop step"
                );
                state.push_error(error);
                break;
            }
            if let Err(error) = self.hop_step(step, &plan, runner, state, &mut report).await {
                tracing::error!(
                    run_id = %state.run_id,
                    step_id = %step.id,
                    error = %error,
                    "run budget ran out during hop query"
                );
                state.push_error(error);
                break;
            }
        }

        state.refresh_derived(&self.schema);
        tracing::info!(
            run_id = %state.run_id,
            joined = report.joined,
            fallback = report.fallback,
            skipped = report.skipped,
            failed = report.failed,
            documents = state.retrieved_data.total_documents(),
            "hop resolution finished"
        );
        report
    }

    /// Path of a hop step: explicit when given, inferred otherwise.
    pub fn path_for(&self, step: &Step, data: &RetrievedData) -> Option<(&'static str, HopPath)> {
        if let Some(path) = step.hop_path() {
            return Some(("explicit", path.clone()));
        }
        let ctx = HopContext {
            target: &step.collection,
            filter: &step.filter,
            data,
            schema: &self.schema,
        };
        infer_path(&self.rules, &ctx)
    }

    /// Returns `Err` only when the whole-run budget ran out.
    async fn hop_step(
        &self,
        step: &Step,
        plan: &Plan,
        runner: QueryRunner<'_>,
        state: &mut ExecutionState,
        report: &mut HopReport,
    ) -> Result<(), PipelineError> {
        let Some((rule, path)) = self.path_for(step, &state.retrieved_data) else {
            tracing::warn!(
                run_id = %state.run_id,
                step_id = %step.id,
                collection = %step.collection,
                "no hop path could be inferred, step skipped"
            );
            state.push_error(PipelineError::UnresolvedHopPath {
                step_id: step.id.clone(),
                collection: step.collection.clone(),
            });
            report.skipped += 1;
            return Ok(());
        };
        if step.hop_path().is_none() {
            report.inferred += 1;
            tracing::debug!(
                run_id = %state.run_id,
                step_id = %step.id,
                rule = rule,
                from = %path.from,
                to = %path.to,
                via = %path.via,
                "hop path inferred"
            );
        }

        // Reference clauses on the join field are replaced by the join keys;
        // everything else in the step's filter constrains the target as well.
        let (source_field, target_field) = path.join_fields(&self.schema.id_field);
        let join_refs: Vec<StepOutputRef> =
            step.filter.refs_on(target_field).into_iter().cloned().collect();
        let resolution = PlaceholderResolver::new(&self.schema).resolve_filter(
            &step.filter.without_refs_on(target_field),
            &step.id,
            &step.depends_on,
            plan,
            &state.retrieved_data,
        );
        for error in resolution.errors(&step.id) {
            state.push_error(error);
        }
        let own_filter = resolution.filter;
        let step_limit = step.limit.unwrap_or(self.settings.default_limit);

        let source = self.select_source(step, plan, &path, source_field, &state.retrieved_data);
        let query = match source {
            Some(source) => {
                let limit = step_limit.max(source.keys.len());
                tracing::info!(
                    run_id = %state.run_id,
                    step_id = %step.id,
                    source = %source.collection,
                    target = %step.collection,
                    keys = source.keys.len(),
                    "hop join started"
                );
                report.joined += 1;
                Query::new(
                    &step.collection,
                    own_filter.and(Filter::is_in(target_field, source.keys)),
                )
                .with_limit(Some(limit))
            }
            None if !own_filter.is_empty() => {
                self.record_unjoined_refs(step, &join_refs, state);
                tracing::info!(
                    run_id = %state.run_id,
                    step_id = %step.id,
                    target = %step.collection,
                    "no join source, querying with step filter only"
                );
                report.fallback += 1;
                Query::new(&step.collection, own_filter).with_limit(Some(step_limit))
            }
            None => {
                self.record_unjoined_refs(step, &join_refs, state);
                tracing::info!(
                    run_id = %state.run_id,
                    step_id = %step.id,
                    target = %step.collection,
                    "no join source and no own constraints, step skipped"
                );
                report.skipped += 1;
                return Ok(());
            }
        }
        .with_sort(step.sort.clone());

        match runner.find(&step.id, &query).await {
            Ok(documents) => {
                let matched: HashSet<String> =
                    collect_ids(&documents, target_field).into_iter().collect();
                let mut set = RetrievedDataSet::new(
                    &step.collection,
                    RetrievalMethod::Hop,
                    self.settings.confidence,
                )
                .with_limit(query.limit)
                .with_sort(query.sort.clone());
                set.merge_documents(documents, &self.schema.id_field);
                let returned = set.len();
                let added = state.retrieved_data.merge(set, &self.schema.id_field);
                report.merged_documents += added;
                tracing::info!(
                    run_id = %state.run_id,
                    step_id = %step.id,
                    collection = %step.collection,
                    returned = returned,
                    added = added,
                    matched_keys = matched.len(),
                    "hop completed"
                );
                Ok(())
            }
            Err(error) if error.is_global_deadline() => Err(error),
            Err(error) => {
                tracing::warn!(
                    run_id = %state.run_id,
                    step_id = %step.id,
                    collection = %step.collection,
                    error = %error,
                    "hop query failed"
                );
                report.failed += 1;
                state.push_error(error);
                Ok(())
            }
        }
    }

    /// Join-field references that no source data could stand in for.
    fn record_unjoined_refs(
        &self,
        step: &Step,
        join_refs: &[StepOutputRef],
        state: &mut ExecutionState,
    ) {
        for reference in join_refs {
            tracing::warn!(
                run_id = %state.run_id,
                step_id = %step.id,
                reference = %reference,
                "no source data for join reference, clause removed"
            );
            state.push_error(PipelineError::UnresolvedPlaceholder {
                step_id: step.id.clone(),
                reference: reference.token(),
            });
        }
    }

    /// Source preference: declared dependency, then the path's `from`
    /// collection, then any other data set carrying a foreign-key source
    /// field. Id-keyed joins only read from those two sets.
    fn select_source(
        &self,
        step: &Step,
        plan: &Plan,
        path: &HopPath,
        source_field: &str,
        data: &RetrievedData,
    ) -> Option<JoinSource> {
        let keys_from = |collection: &str| -> Option<JoinSource> {
            if collection == step.collection {
                return None;
            }
            let set = data.get(collection)?;
            let keys = set.ids(source_field);
            (!keys.is_empty()).then(|| JoinSource {
                collection: collection.to_string(),
                keys,
            })
        };

        step.depends_on
            .iter()
            .filter_map(|dep| plan.get_step(dep))
            .find_map(|dep| keys_from(&dep.collection))
            .or_else(|| keys_from(&path.from))
            .or_else(|| {
                if source_field == self.schema.id_field {
                    return None;
                }
                data.iter()
                    .filter(|set| set.collection != step.collection)
                    .find_map(|set| keys_from(&set.collection))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::DeadlineBudgets;
    use crate::test_support::{docs, RecordingStore};
    use crate::types::{Cardinality, SessionKey};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn filter(value: Value) -> Filter {
        Filter::try_from(value).expect("filter")
    }

    fn fetched(state: &mut ExecutionState, collection: &str, documents: Value) {
        let mut set = RetrievedDataSet::new(collection, RetrievalMethod::Fetch, 1.0);
        set.merge_documents(docs(documents), "_id");
        state.retrieved_data.merge(set, "_id");
    }

    fn ten_orgs() -> Value {
        Value::Array(
            (0..10)
                .map(|i| json!({"_id": format!("o{}", i), "country": "US"}))
                .collect(),
        )
    }

    fn people_store() -> Arc<RecordingStore> {
        Arc::new(RecordingStore::new().with_collection(
            "people",
            json!([
                {"_id": "p1", "organizationId": "o1"},
                {"_id": "p2", "organizationId": "o2"},
                {"_id": "p3", "organizationId": "zz"}
            ]),
        ))
    }

    #[test]
    fn test_inferred_people_hop_filters_by_fetched_organizations() {
        tokio_test::block_on(async {
            let store = people_store();
            let plan = Plan::new(vec![
                Step::fetch("0", "organizations")
                    .with_filter(filter(json!({"country": "US"})))
                    .with_limit(10),
                Step::hop("1", "people").with_depends_on(vec!["0".into()]),
            ]);
            let mut state = ExecutionState::new("q", SessionKey::new("s", "u")).with_plan(plan);
            fetched(&mut state, "organizations", ten_orgs());

            let resolver = HopResolver::new(store.clone(), EntitySchema::default());
            let report = resolver.resolve(&mut state, &DeadlineSupervisor::default()).await;

            assert_eq!(report.inferred, 1);
            assert_eq!(report.joined, 1);
            let queries = store.queries_for("people");
            assert_eq!(queries.len(), 1);
            let expected: Vec<String> = (0..10).map(|i| format!("o{}", i)).collect();
            assert_eq!(
                queries[0].filter.to_json(),
                json!({"organizationId": {"$in": expected}})
            );
            assert!(queries[0].limit.expect("limit") >= 10);

            let people = state.retrieved_data.get("people").expect("people");
            assert_eq!(people.len(), 2);
            assert_eq!(people.metadata.method, RetrievalMethod::Hop);
            assert!((people.metadata.confidence - 0.9).abs() < f64::EPSILON);
            assert_eq!(state.entity_cache.people.as_slice(), ["p1", "p2"]);
            assert_eq!(state.flattened_data.len(), 12);
        });
    }

    #[test]
    fn test_join_limit_covers_every_key() {
        tokio_test::block_on(async {
            let store = people_store();
            let plan = Plan::new(vec![
                Step::fetch("0", "organizations"),
                Step::hop("1", "people")
                    .with_depends_on(vec!["0".into()])
                    .with_limit(3),
            ]);
            let mut state = ExecutionState::new("q", SessionKey::new("s", "u")).with_plan(plan);
            fetched(&mut state, "organizations", ten_orgs());

            HopResolver::new(store.clone(), EntitySchema::default())
                .resolve(&mut state, &DeadlineSupervisor::default())
                .await;
            assert_eq!(store.queries_for("people")[0].limit, Some(10));
        });
    }

    static RULE_CALLS: AtomicUsize = AtomicUsize::new(0);

    #[test]
    fn test_explicit_path_skips_inference() {
        tokio_test::block_on(async {
            let counting = HopRule {
                name: "counting",
                when: |_| {
                    RULE_CALLS.fetch_add(1, Ordering::SeqCst);
                    false
                },
                path: |ctx| HopPath::new("x", ctx.target, "y", Cardinality::OneToOne),
            };
            let store = Arc::new(RecordingStore::new().with_collection(
                "organizations",
                json!([{"_id": "o1"}, {"_id": "o2"}]),
            ));
            let plan = Plan::new(vec![Step::hop("1", "organizations").with_hop_path(HopPath::new(
                "people",
                "organizations",
                "organizationId",
                Cardinality::ManyToOne,
            ))]);
            let mut state = ExecutionState::new("q", SessionKey::new("s", "u")).with_plan(plan);
            fetched(
                &mut state,
                "people",
                json!([{"_id": "p1", "organizationId": "o2"}]),
            );

            let report = HopResolver::new(store.clone(), EntitySchema::default())
                .with_rules(vec![counting])
                .resolve(&mut state, &DeadlineSupervisor::default())
                .await;

            assert_eq!(RULE_CALLS.load(Ordering::SeqCst), 0);
            assert_eq!(report.inferred, 0);
            assert_eq!(
                store.queries_for("organizations")[0].filter.to_json(),
                json!({"_id": {"$in": ["o2"]}})
            );
            assert_eq!(
                state.retrieved_data.get("organizations").expect("orgs").len(),
                1
            );
        });
    }

    #[test]
    fn test_unresolvable_path_is_skipped_not_fatal() {
        tokio_test::block_on(async {
            let store = Arc::new(RecordingStore::new());
            let plan = Plan::new(vec![Step::hop("1", "invoices")]);
            let mut state = ExecutionState::new("q", SessionKey::new("s", "u")).with_plan(plan);

            let report = HopResolver::new(store.clone(), EntitySchema::default())
                .resolve(&mut state, &DeadlineSupervisor::default())
                .await;

            assert_eq!(report.skipped, 1);
            assert_eq!(state.errors()[0].kind(), "unresolved_hop_path");
            assert!(store.queries().is_empty());
        });
    }

    #[test]
    fn test_fallback_queries_with_own_filter_when_source_is_empty() {
        tokio_test::block_on(async {
            let store = people_store();
            let plan = Plan::new(vec![
                Step::fetch("0", "organizations"),
                Step::hop("1", "people")
                    .with_filter(filter(json!({
                        "organizationId": {"$in": ["FROM_STEP_0_ORGANIZATION_IDS"]},
                        "title": "CTO"
                    })))
                    .with_depends_on(vec!["0".into()]),
            ]);
            let mut state = ExecutionState::new("q", SessionKey::new("s", "u")).with_plan(plan);
            fetched(&mut state, "organizations", json!([]));

            let report = HopResolver::new(store.clone(), EntitySchema::default())
                .resolve(&mut state, &DeadlineSupervisor::default())
                .await;

            assert_eq!(report.fallback, 1);
            let queries = store.queries_for("people");
            assert_eq!(queries[0].filter.to_json(), json!({"title": "CTO"}));
            assert_eq!(state.errors()[0].kind(), "unresolved_placeholder");
        });
    }

    #[test]
    fn test_running_twice_does_not_double_count() {
        tokio_test::block_on(async {
            let store = people_store();
            let plan = Plan::new(vec![
                Step::fetch("0", "organizations"),
                Step::hop("1", "people").with_depends_on(vec!["0".into()]),
            ]);
            let mut state = ExecutionState::new("q", SessionKey::new("s", "u")).with_plan(plan);
            fetched(&mut state, "organizations", ten_orgs());
            let resolver = HopResolver::new(store, EntitySchema::default());
            let supervisor = DeadlineSupervisor::default();

            let first = resolver.resolve(&mut state, &supervisor).await;
            let second = resolver.resolve(&mut state, &supervisor).await;

            assert_eq!(first.merged_documents, 2);
            assert_eq!(second.merged_documents, 0);
            let people = state.retrieved_data.get("people").expect("people");
            assert_eq!(people.metadata.count, 2);
            assert_eq!(people.len(), 2);
        });
    }

    #[test]
    fn test_failed_hop_query_is_recorded() {
        tokio_test::block_on(async {
            let store = Arc::new(RecordingStore::new().failing("people"));
            let plan = Plan::new(vec![
                Step::fetch("0", "organizations"),
                Step::hop("1", "people").with_depends_on(vec!["0".into()]),
            ]);
            let mut state = ExecutionState::new("q", SessionKey::new("s", "u")).with_plan(plan);
            fetched(&mut state, "organizations", ten_orgs());

            let report = HopResolver::new(store, EntitySchema::default())
                .resolve(&mut state, &DeadlineSupervisor::default())
                .await;

            assert_eq!(report.failed, 1);
            assert_eq!(state.errors()[0].kind(), "query_failure");
            assert!(!state.retrieved_data.contains("people"));
        });
    }

    #[test]
    fn test_literal_join_field_constraint_is_kept() {
        tokio_test::block_on(async {
            let store = people_store();
            let plan = Plan::new(vec![
                Step::fetch("0", "organizations"),
                Step::hop("1", "people")
                    .with_filter(filter(json!({"organizationId": "o1"})))
                    .with_depends_on(vec!["0".into()]),
            ]);
            let mut state = ExecutionState::new("q", SessionKey::new("s", "u")).with_plan(plan);
            fetched(
                &mut state,
                "organizations",
                json!([{"_id": "o1"}, {"_id": "o2"}]),
            );

            let report = HopResolver::new(store.clone(), EntitySchema::default())
                .resolve(&mut state, &DeadlineSupervisor::default())
                .await;

            assert_eq!(report.joined, 1);
            assert_eq!(
                store.queries_for("people")[0].filter.to_json(),
                json!({"$and": [
                    {"organizationId": "o1"},
                    {"organizationId": {"$in": ["o1", "o2"]}}
                ]})
            );
            let people = state.retrieved_data.get("people").expect("people");
            assert_eq!(people.len(), 1);
            assert_eq!(state.entity_cache.people.as_slice(), ["p1"]);
        });
    }

    #[test]
    fn test_id_join_does_not_borrow_keys_from_unrelated_collection() {
        tokio_test::block_on(async {
            let store = people_store();
            let plan = Plan::new(vec![
                Step::fetch("0", "organizations"),
                Step::hop("1", "people")
                    .with_filter(filter(json!({"title": "CTO"})))
                    .with_depends_on(vec!["0".into()]),
            ]);
            let mut state = ExecutionState::new("q", SessionKey::new("s", "u")).with_plan(plan);
            fetched(&mut state, "organizations", json!([]));
            fetched(&mut state, "deals", json!([{"_id": "d1"}, {"_id": "d2"}]));

            let report = HopResolver::new(store.clone(), EntitySchema::default())
                .resolve(&mut state, &DeadlineSupervisor::default())
                .await;

            assert_eq!(report.joined, 0);
            assert_eq!(report.fallback, 1);
            assert_eq!(
                store.queries_for("people")[0].filter.to_json(),
                json!({"title": "CTO"})
            );
        });
    }

    #[test]
    fn test_foreign_key_join_may_use_any_set_carrying_the_key() {
        tokio_test::block_on(async {
            let store = Arc::new(RecordingStore::new().with_collection(
                "organizations",
                json!([{"_id": "o1"}, {"_id": "o2"}]),
            ));
            let plan = Plan::new(vec![Step::hop("1", "organizations").with_hop_path(
                HopPath::new("people", "organizations", "organizationId", Cardinality::ManyToOne),
            )]);
            let mut state = ExecutionState::new("q", SessionKey::new("s", "u")).with_plan(plan);
            fetched(
                &mut state,
                "deals",
                json!([{"_id": "d1", "organizationId": "o1"}]),
            );

            let report = HopResolver::new(store.clone(), EntitySchema::default())
                .resolve(&mut state, &DeadlineSupervisor::default())
                .await;

            assert_eq!(report.joined, 1);
            assert_eq!(
                store.queries_for("organizations")[0].filter.to_json(),
                json!({"_id": {"$in": ["o1"]}})
            );
        });
    }

    #[test]
    fn test_slow_hop_query_is_cut_by_query_budget() {
        tokio_test::block_on(async {
            let store = Arc::new(
                RecordingStore::new()
                    .with_collection("people", json!([{"_id": "p1", "organizationId": "o1"}]))
                    .with_delay(Duration::from_millis(500)),
            );
            let plan = Plan::new(vec![
                Step::fetch("0", "organizations"),
                Step::hop("1", "people").with_depends_on(vec!["0".into()]),
            ]);
            let mut state = ExecutionState::new("q", SessionKey::new("s", "u")).with_plan(plan);
            fetched(&mut state, "organizations", json!([{"_id": "o1"}]));
            let supervisor = DeadlineSupervisor::new(
                DeadlineBudgets::default().with_query(Duration::from_millis(50)),
            );

            let report = HopResolver::new(store, EntitySchema::default())
                .resolve(&mut state, &supervisor)
                .await;

            assert_eq!(report.failed, 1);
            let error = &state.errors()[0];
            assert!(error.is_deadline());
            assert!(!error.is_global_deadline());
            assert!(!state.retrieved_data.contains("people"));
            assert!(state.retrieved_data.has_documents("organizations"));
        });
    }
}
