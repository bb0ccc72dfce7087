//! Orchestrator - drives one query through the stage machine
//!
//! planner → retriever → {executor | hopper | analyzer | error}, then
//! analyzer/critic/executor until the responder or an early terminal stage.
//! Transitions come from `hoplite_core::routing`; every stage runs under its
//! own budget and the whole run under the total budget.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::Instrument;

use hoplite_core::action::ActionExecutor;
use hoplite_core::analysis::{Analyzer, CountingResponder, Critic, Responder};
use hoplite_core::deadline::{DeadlineBudgets, DeadlineSupervisor};
use hoplite_core::error::{PipelineError, GLOBAL_DEADLINE_LABEL};
use hoplite_core::hop::HopResolver;
use hoplite_core::planner::{Planner, PlannerContext};
use hoplite_core::retrieval::RetrievalEngine;
use hoplite_core::routing::{next_stage, RoutingPolicy};
use hoplite_core::store::{DocumentStore, SessionStore};
use hoplite_core::types::{
    EntitySchema, ExecutionState, PreviousQueryResult, SessionKey, SessionSnapshot, Stage,
};

use crate::progress::{RunProgressEvent, RunProgressReporter};
use crate::summary::RunSummary;

const MAX_QUERY_LOG_CHARS: usize = 500;

/// Per-run knobs. Read at the start of every run, so reloaded config applies
/// to the next run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrchestratorConfig {
    pub budgets: DeadlineBudgets,
    pub routing: RoutingPolicy,
}

/// Final state of a run and its summary.
#[derive(Debug)]
pub struct RunOutcome {
    pub state: ExecutionState,
    pub summary: RunSummary,
}

/// Orchestrator - wires planner, retrieval core and answer stages
pub struct Orchestrator {
    pub planner: Arc<dyn Planner>,
    pub retrieval: RetrievalEngine,
    pub hopper: HopResolver,
    pub analyzer: Option<Arc<dyn Analyzer>>,
    pub critic: Option<Arc<dyn Critic>>,
    pub executor: Option<Arc<dyn ActionExecutor>>,
    pub responder: Arc<dyn Responder>,
    pub session_store: Option<Arc<dyn SessionStore>>,
    pub progress_reporter: Option<Arc<dyn RunProgressReporter>>,
    pub schema: EntitySchema,
    pub config: OrchestratorConfig,
}

impl Orchestrator {
    /// Create an orchestrator with default retrieval settings over `store`.
    pub fn new(
        planner: Arc<dyn Planner>,
        store: Arc<dyn DocumentStore>,
        schema: EntitySchema,
    ) -> Self {
        Self {
            planner,
            retrieval: RetrievalEngine::new(store.clone(), schema.clone()),
            hopper: HopResolver::new(store, schema.clone()),
            analyzer: None,
            critic: None,
            executor: None,
            responder: Arc::new(CountingResponder),
            session_store: None,
            progress_reporter: None,
            schema,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_retrieval(mut self, retrieval: RetrievalEngine) -> Self {
        self.retrieval = retrieval;
        self
    }

    pub fn with_hopper(mut self, hopper: HopResolver) -> Self {
        self.hopper = hopper;
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_critic(mut self, critic: Arc<dyn Critic>) -> Self {
        self.critic = Some(critic);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = responder;
        self
    }

    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    pub fn with_progress_reporter(mut self, reporter: Arc<dyn RunProgressReporter>) -> Self {
        self.progress_reporter = Some(reporter);
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Answer `query` for `session` with the orchestrator's own config.
    pub async fn run(&self, query: impl Into<String>, session: SessionKey) -> RunOutcome {
        self.run_with_config(query, session, &self.config).await
    }

    /// Answer `query` for `session` under `config`.
    pub async fn run_with_config(
        &self,
        query: impl Into<String>,
        session: SessionKey,
        config: &OrchestratorConfig,
    ) -> RunOutcome {
        let state = ExecutionState::new(query, session);
        let span = tracing::info_span!("run", run_id = %state.run_id);
        self.execute(state, config).instrument(span).await
    }

    async fn execute(&self, state: ExecutionState, config: &OrchestratorConfig) -> RunOutcome {
        let supervisor = DeadlineSupervisor::new(config.budgets.clone());
        let snapshot = self.load_session(&state, &supervisor).await;
        let mut state = state.with_snapshot(snapshot);
        tracing::info!(
            run_id = %state.run_id,
            session_id = %state.session.session_id,
            user_id = %state.session.user_id,
            query = %truncate_for_log(&state.query, MAX_QUERY_LOG_CHARS),
            previous_results = state.previous_results.len(),
            "run started"
        );

        let remaining = supervisor.total_budget().saturating_sub(state.elapsed());
        let driven = tokio::time::timeout(
            remaining,
            self.drive(&mut state, &supervisor, &config.routing),
        )
        .await;
        if driven.is_err() {
            let budget_ms = millis(supervisor.total_budget());
            tracing::error!(
                run_id = %state.run_id,
                stage = %state.next_stage,
                budget_ms = budget_ms,
                "run exceeded total budget, returning partial result"
            );
            state.push_error(PipelineError::deadline(GLOBAL_DEADLINE_LABEL, budget_ms));
            state.budget_exhausted = true;
            state.next_stage = Stage::Error;
            state.refresh_derived(&self.schema);
        }

        self.save_session(&state, &supervisor).await;
        let summary = RunSummary::from_state(&state);
        tracing::info!(
            run_id = %summary.run_id,
            final_stage = %summary.final_stage,
            documents = summary.counts.total_documents,
            errors = summary.error_kinds.len(),
            elapsed_ms = summary.elapsed_ms,
            "run finished"
        );
        let mut completed = RunProgressEvent::new(&state.run_id, Some(state.next_stage), "run_completed")
            .with_metadata(serde_json::to_value(&summary).unwrap_or_default());
        if state.budget_exhausted {
            completed = completed.with_message("deadline exceeded");
        }
        self.report(completed).await;

        RunOutcome { state, summary }
    }

    /// Run stages until a terminal one is reached.
    async fn drive(
        &self,
        state: &mut ExecutionState,
        supervisor: &DeadlineSupervisor,
        policy: &RoutingPolicy,
    ) {
        let mut stage = Stage::Planner;
        while !stage.is_terminal() {
            state.next_stage = stage;
            if let Err(error) = supervisor.check_global_budget(state.started_at) {
                tracing::error!(run_id = %state.run_id, stage = %stage, error = %error, "run out of budget");
                state.push_error(error);
                state.budget_exhausted = true;
                stage = Stage::Error;
                break;
            }

            self.report(RunProgressEvent::new(&state.run_id, Some(stage), "stage_started"))
                .await;
            state.mark_stage_started(stage);
            let errors_before = state.error_count();

            let next = match self.run_stage(stage, state, supervisor).await {
                Ok(()) => next_stage(stage, state, policy),
                Err(error) => self.stage_timed_out(stage, error, state).await,
            };
            let elapsed_ms = match supervisor.track_stage(stage, state.stage_started()) {
                Ok(elapsed) => millis(elapsed),
                Err(error) => {
                    tracing::warn!(run_id = %state.run_id, error = %error, "stage finished over budget");
                    millis(supervisor.stage_budget(stage))
                }
            };
            if stage == Stage::Critic && next == Stage::Analyzer {
                state.iteration += 1;
            }

            let new_errors = state.error_count() - errors_before;
            tracing::info!(
                run_id = %state.run_id,
                stage = %stage,
                next = %next,
                elapsed_ms = elapsed_ms,
                new_errors = new_errors,
                "stage finished"
            );
            self.report(
                RunProgressEvent::new(&state.run_id, Some(stage), "stage_completed").with_metadata(json!({
                    "next": next.name(),
                    "elapsed_ms": elapsed_ms,
                    "new_errors": new_errors,
                    "documents": state.retrieved_data.total_documents(),
                })),
            )
            .await;
            stage = next;
        }
        state.next_stage = stage;
    }

    /// Execute one stage. Collaborator failures are recorded on the state;
    /// only a blown stage budget is returned.
    async fn run_stage(
        &self,
        stage: Stage,
        state: &mut ExecutionState,
        supervisor: &DeadlineSupervisor,
    ) -> Result<(), PipelineError> {
        match stage {
            Stage::Planner => self.plan(state, supervisor).await,
            Stage::Retriever => {
                let report = supervisor
                    .with_stage_timeout(stage, self.retrieval.execute(state, supervisor))
                    .await?;
                tracing::debug!(run_id = %state.run_id, report = ?report, "retrieval report");
                Ok(())
            }
            Stage::Hopper => {
                let report = supervisor
                    .with_stage_timeout(stage, self.hopper.resolve(state, supervisor))
                    .await?;
                tracing::debug!(run_id = %state.run_id, report = ?report, "hop report");
                Ok(())
            }
            Stage::Analyzer => self.analyze(state, supervisor).await,
            Stage::Critic => self.critique(state, supervisor).await,
            Stage::Executor => self.execute_actions(state, supervisor).await,
            Stage::Responder => self.respond(state, supervisor).await,
            Stage::AwaitingConfirmation | Stage::Error | Stage::Done => Ok(()),
        }
    }

    /// A stage ran past its own budget: keep partial data and move on.
    async fn stage_timed_out(
        &self,
        stage: Stage,
        error: PipelineError,
        state: &mut ExecutionState,
    ) -> Stage {
        tracing::error!(run_id = %state.run_id, stage = %stage, error = %error, "stage timed out");
        state.push_error(error);
        match stage {
            Stage::Retriever | Stage::Hopper => {
                state.refresh_derived(&self.schema);
                Stage::Responder
            }
            Stage::Responder => {
                state.answer = Some(fallback_answer(state).await);
                Stage::Done
            }
            _ => Stage::Responder,
        }
    }

    async fn plan(
        &self,
        state: &mut ExecutionState,
        supervisor: &DeadlineSupervisor,
    ) -> Result<(), PipelineError> {
        let result = {
            let context = PlannerContext::from_state(state);
            supervisor
                .with_stage_timeout(Stage::Planner, self.planner.plan(&context))
                .await?
        };
        match result {
            Ok(output) => {
                tracing::info!(
                    run_id = %state.run_id,
                    steps = output.plan.steps.len(),
                    intent = ?output.intent.kind,
                    requires_validation = output.plan.requires_validation,
                    "plan ready"
                );
                state.plan = Some(output.plan);
                state.intent = output.intent;
            }
            Err(error) => {
                tracing::error!(run_id = %state.run_id, error = %error, "planner failed");
                state.push_error(PipelineError::stage(Stage::Planner, error.to_string()));
            }
        }
        Ok(())
    }

    async fn analyze(
        &self,
        state: &mut ExecutionState,
        supervisor: &DeadlineSupervisor,
    ) -> Result<(), PipelineError> {
        let Some(analyzer) = &self.analyzer else {
            tracing::debug!(run_id = %state.run_id, "no analyzer configured");
            state.analysis = None;
            return Ok(());
        };
        let result = supervisor
            .with_stage_timeout(Stage::Analyzer, analyzer.analyze(&*state))
            .await?;
        match result {
            Ok(analysis) => state.analysis = Some(analysis),
            Err(error) => {
                tracing::warn!(run_id = %state.run_id, error = %error, "analysis failed");
                state.analysis = None;
                state.push_error(PipelineError::stage(Stage::Analyzer, error.to_string()));
            }
        }
        Ok(())
    }

    async fn critique(
        &self,
        state: &mut ExecutionState,
        supervisor: &DeadlineSupervisor,
    ) -> Result<(), PipelineError> {
        let Some(critic) = &self.critic else {
            state.validation = None;
            return Ok(());
        };
        let result = supervisor
            .with_stage_timeout(Stage::Critic, critic.critique(&*state))
            .await?;
        match result {
            Ok(validation) => {
                tracing::info!(
                    run_id = %state.run_id,
                    valid = validation.valid,
                    iteration = state.iteration,
                    "critique finished"
                );
                state.validation = Some(validation);
            }
            Err(error) => {
                tracing::warn!(run_id = %state.run_id, error = %error, "critique failed");
                state.validation = None;
                state.push_error(PipelineError::stage(Stage::Critic, error.to_string()));
            }
        }
        Ok(())
    }

    async fn execute_actions(
        &self,
        state: &mut ExecutionState,
        supervisor: &DeadlineSupervisor,
    ) -> Result<(), PipelineError> {
        let Some(executor) = &self.executor else {
            tracing::warn!(run_id = %state.run_id, actions = ?state.intent.actions, "no action executor configured");
            state.push_error(PipelineError::stage(Stage::Executor, "no action executor configured"));
            return Ok(());
        };
        let result = supervisor
            .with_stage_timeout(Stage::Executor, executor.execute(&*state))
            .await?;
        match result {
            Ok(outcome) => {
                if let Some(request) = outcome.needs_confirmation_request() {
                    tracing::info!(run_id = %state.run_id, action = %request.action, "action awaiting confirmation");
                }
                state.action_outcome = Some(outcome);
            }
            Err(error) => {
                tracing::warn!(run_id = %state.run_id, error = %error, "action execution failed");
                state.push_error(PipelineError::stage(Stage::Executor, error.to_string()));
            }
        }
        Ok(())
    }

    async fn respond(
        &self,
        state: &mut ExecutionState,
        supervisor: &DeadlineSupervisor,
    ) -> Result<(), PipelineError> {
        let result = supervisor
            .with_stage_timeout(Stage::Responder, self.responder.respond(&*state))
            .await?;
        let message = match result {
            Ok(response) => response.message,
            Err(error) => {
                tracing::warn!(run_id = %state.run_id, error = %error, "responder failed, using fallback");
                state.push_error(PipelineError::stage(Stage::Responder, error.to_string()));
                fallback_answer(state).await
            }
        };
        state.answer = Some(message);
        Ok(())
    }

    async fn load_session(
        &self,
        state: &ExecutionState,
        supervisor: &DeadlineSupervisor,
    ) -> SessionSnapshot {
        let Some(store) = &self.session_store else {
            return SessionSnapshot::default();
        };
        match supervisor
            .with_timeout(store.load(&state.session), supervisor.query_budget(), "session load")
            .await
        {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(error)) => {
                tracing::warn!(run_id = %state.run_id, error = %error, "failed to load session");
                SessionSnapshot::default()
            }
            Err(error) => {
                tracing::warn!(run_id = %state.run_id, error = %error, "session load timed out");
                SessionSnapshot::default()
            }
        }
    }

    async fn save_session(&self, state: &ExecutionState, supervisor: &DeadlineSupervisor) {
        let Some(store) = &self.session_store else {
            return;
        };
        let result = PreviousQueryResult::new(state.query.clone(), state.retrieved_data.clone());
        match supervisor
            .with_timeout(
                store.save(&state.session, result, &state.entity_cache),
                supervisor.query_budget(),
                "session save",
            )
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::warn!(run_id = %state.run_id, error = %error, "failed to save session");
            }
            Err(error) => {
                tracing::warn!(run_id = %state.run_id, error = %error, "session save timed out");
            }
        }
    }

    async fn report(&self, event: RunProgressEvent) {
        if let Some(reporter) = &self.progress_reporter {
            if let Err(err) = reporter.report(event).await {
                tracing::warn!("failed to report run progress: {}", err);
            }
        }
    }
}

async fn fallback_answer(state: &ExecutionState) -> String {
    match CountingResponder.respond(state).await {
        Ok(response) => response.message,
        Err(_) => "No answer could be produced.".to_string(),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    let char_count = input.chars().count();
    if char_count <= max_chars {
        return input.to_string();
    }
    let mut preview: String = input.chars().take(max_chars).collect();
    preview.push_str(&format!("... [truncated, total_chars={}]", char_count));
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use hoplite_core::action::{ActionError, ActionOutcome, ApprovalRequest};
    use hoplite_core::analysis::{Analysis, AnalysisError, Validation};
    use hoplite_core::planner::{PlanError, PlannerOutput};
    use hoplite_core::store::{Query, StoreError};
    use hoplite_core::types::{Document, Filter, Intent, IntentKind, Plan, RetrievalMethod, Step};
    use hoplite_stores::{InMemoryDocumentStore, InMemorySessionStore};

    struct ScriptedPlanner {
        output: Option<PlannerOutput>,
    }

    #[async_trait]
    impl Planner for ScriptedPlanner {
        async fn plan(&self, _context: &PlannerContext<'_>) -> Result<PlannerOutput, PlanError> {
            self.output
                .clone()
                .ok_or_else(|| PlanError::Generation("no plan".to_string()))
        }
    }

    fn planner(plan: Plan, intent: Intent) -> Arc<dyn Planner> {
        Arc::new(ScriptedPlanner {
            output: Some(PlannerOutput::new(plan, intent)),
        })
    }

    struct CountingAnalyzer {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingAnalyzer {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl Analyzer for CountingAnalyzer {
        async fn analyze(&self, state: &ExecutionState) -> Result<Analysis, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(Analysis::new(format!(
                "{} documents",
                state.retrieved_data.total_documents()
            )))
        }
    }

    struct RejectingCritic;

    #[async_trait]
    impl Critic for RejectingCritic {
        async fn critique(&self, _state: &ExecutionState) -> Result<Validation, AnalysisError> {
            Ok(Validation::invalid("missing revenue figures"))
        }
    }

    struct ApprovalExecutor;

    #[async_trait]
    impl ActionExecutor for ApprovalExecutor {
        async fn execute(&self, _state: &ExecutionState) -> Result<ActionOutcome, ActionError> {
            Ok(ActionOutcome::needs_confirmation(ApprovalRequest::new(
                "send_email",
                "outbound email needs approval",
            )))
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        events: Mutex<Vec<(String, Option<Stage>)>>,
    }

    impl RecordingReporter {
        fn started_stages(&self) -> Vec<Stage> {
            self.events
                .lock()
                .expect("events")
                .iter()
                .filter(|(phase, _)| phase == "stage_started")
                .filter_map(|(_, stage)| *stage)
                .collect()
        }
    }

    #[async_trait]
    impl RunProgressReporter for RecordingReporter {
        async fn report(&self, event: RunProgressEvent) -> Result<(), String> {
            self.events
                .lock()
                .map_err(|e| e.to_string())?
                .push((event.phase, event.stage));
            Ok(())
        }
    }

    /// Delays reads of one collection.
    struct SlowStore {
        inner: InMemoryDocumentStore,
        slow_collection: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl DocumentStore for SlowStore {
        async fn find(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
            if query.collection == self.slow_collection {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.find(query).await
        }

        async fn aggregate(
            &self,
            collection: &str,
            pipeline: &[Value],
        ) -> Result<Vec<Document>, StoreError> {
            self.inner.aggregate(collection, pipeline).await
        }
    }

    fn crm() -> InMemoryDocumentStore {
        let mut organizations = Vec::new();
        let mut people = Vec::new();
        for i in 0..11 {
            let country = if i < 10 { "US" } else { "DE" };
            organizations.push(json!({"_id": format!("o{}", i), "country": country}));
            people.push(json!({"_id": format!("p{}", i), "organizationId": format!("o{}", i)}));
        }
        InMemoryDocumentStore::new()
            .with_collection("organizations", Value::Array(organizations))
            .with_collection("people", Value::Array(people))
    }

    fn org_then_people() -> Plan {
        Plan::new(vec![
            Step::fetch("0", "organizations")
                .with_filter(Filter::eq("country", "US"))
                .with_limit(10),
            Step::hop("1", "people").with_depends_on(vec!["0".into()]),
        ])
    }

    fn session() -> SessionKey {
        SessionKey::new("s1", "u1")
    }

    #[tokio::test]
    async fn test_fetch_then_hop_run_completes() {
        let analyzer = Arc::new(CountingAnalyzer::new());
        let sessions = Arc::new(InMemorySessionStore::new());
        let reporter = Arc::new(RecordingReporter::default());
        let orchestrator = Orchestrator::new(
            planner(org_then_people(), Intent::default()),
            Arc::new(crm()),
            EntitySchema::default(),
        )
        .with_analyzer(analyzer.clone())
        .with_session_store(sessions.clone())
        .with_progress_reporter(reporter.clone());

        let outcome = orchestrator.run("people at US companies", session()).await;

        assert_eq!(outcome.summary.final_stage, Stage::Done);
        assert!(outcome.summary.error_kinds.is_empty());
        let people = outcome.state.retrieved_data.get("people").expect("people");
        assert_eq!(people.len(), 10);
        assert_eq!(people.metadata.method, RetrievalMethod::Hop);
        assert_eq!(outcome.summary.organizations.len(), 10);
        assert_eq!(outcome.summary.people.len(), 10);
        assert_eq!(outcome.state.flattened_data.len(), 20);
        assert_eq!(outcome.state.answer.as_deref(), Some("Found 10 organizations, 10 people."));
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            reporter.started_stages(),
            vec![
                Stage::Planner,
                Stage::Retriever,
                Stage::Hopper,
                Stage::Analyzer,
                Stage::Responder
            ]
        );

        let snapshot = sessions.load(&session()).await.expect("session");
        assert_eq!(snapshot.previous_results.len(), 1);
        assert_eq!(snapshot.entity_cache.people.len(), 10);
    }

    #[tokio::test]
    async fn test_informational_query_goes_straight_to_responder() {
        let reporter = Arc::new(RecordingReporter::default());
        let orchestrator = Orchestrator::new(
            planner(Plan::default(), Intent::new(IntentKind::Informational)),
            Arc::new(crm()),
            EntitySchema::default(),
        )
        .with_progress_reporter(reporter.clone());

        let outcome = orchestrator.run("what can you do?", session()).await;

        assert_eq!(outcome.summary.final_stage, Stage::Done);
        assert!(outcome.state.retrieved_data.is_empty());
        assert!(!outcome.state.empty_result);
        assert_eq!(
            reporter.started_stages(),
            vec![Stage::Planner, Stage::Retriever, Stage::Responder]
        );
        assert_eq!(
            outcome.state.answer.as_deref(),
            Some("No matching records were found.")
        );
    }

    #[tokio::test]
    async fn test_critique_loop_stops_at_max_iterations() {
        let analyzer = Arc::new(CountingAnalyzer::new());
        let plan = Plan::new(vec![Step::fetch("0", "organizations")]).with_validation();
        let orchestrator = Orchestrator::new(planner(plan, Intent::default()), Arc::new(crm()), EntitySchema::default())
            .with_analyzer(analyzer.clone())
            .with_critic(Arc::new(RejectingCritic));

        let outcome = orchestrator.run("top companies", session()).await;

        assert_eq!(outcome.summary.final_stage, Stage::Done);
        assert_eq!(outcome.state.iteration, 2);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.state.validation, Some(Validation::invalid("missing revenue figures")));
    }

    #[tokio::test]
    async fn test_external_action_stops_for_confirmation() {
        let intent = Intent::new(IntentKind::Execute).with_actions(vec!["send_email".to_string()]);
        let plan = Plan::new(vec![Step::fetch("0", "people")]);
        let orchestrator = Orchestrator::new(planner(plan, intent), Arc::new(crm()), EntitySchema::default())
            .with_executor(Arc::new(ApprovalExecutor));

        let outcome = orchestrator.run("email everyone", session()).await;

        assert_eq!(outcome.summary.final_stage, Stage::AwaitingConfirmation);
        assert!(outcome.state.answer.is_none());
        assert!(outcome.state.retrieved_data.has_documents("people"));
        let request = outcome
            .state
            .action_outcome
            .as_ref()
            .and_then(|o| o.needs_confirmation_request())
            .expect("approval request");
        assert_eq!(request.action, "send_email");
    }

    #[tokio::test]
    async fn test_planner_failure_still_answers() {
        let orchestrator = Orchestrator::new(
            Arc::new(ScriptedPlanner { output: None }),
            Arc::new(crm()),
            EntitySchema::default(),
        );

        let outcome = orchestrator.run("???", session()).await;

        assert_eq!(outcome.summary.final_stage, Stage::Done);
        assert_eq!(outcome.summary.error_kinds, vec!["stage_failure".to_string()]);
        assert!(outcome.state.plan.is_none());
        assert!(outcome.state.answer.is_some());
    }

    #[tokio::test]
    async fn test_global_deadline_returns_partial_data() {
        let store = SlowStore {
            inner: crm(),
            slow_collection: "people",
            delay: Duration::from_secs(5),
        };
        let analyzer = Arc::new(CountingAnalyzer {
            calls: AtomicUsize::new(0),
            delay: Duration::from_secs(5),
        });
        let config = OrchestratorConfig {
            budgets: DeadlineBudgets::default().with_total(Duration::from_millis(300)),
            routing: RoutingPolicy::default(),
        };
        let orchestrator = Orchestrator::new(
            planner(org_then_people(), Intent::default()),
            Arc::new(store),
            EntitySchema::default(),
        )
        .with_analyzer(analyzer)
        .with_config(config);

        let outcome = orchestrator.run("people at US companies", session()).await;

        assert_eq!(outcome.summary.final_stage, Stage::Error);
        assert!(outcome.summary.has_deadline_error());
        assert!(outcome.state.budget_exhausted);
        assert!(outcome
            .state
            .errors()
            .iter()
            .any(|e| e.is_global_deadline()));
        assert!(outcome.state.retrieved_data.has_documents("organizations"));
        assert!(!outcome.state.retrieved_data.has_documents("people"));
        assert!(outcome.state.answer.is_none());
    }

    #[tokio::test]
    async fn test_stage_over_budget_answers_with_partial_data() {
        let store = SlowStore {
            inner: crm(),
            slow_collection: "people",
            delay: Duration::from_secs(2),
        };
        let reporter = Arc::new(RecordingReporter::default());
        let config = OrchestratorConfig {
            budgets: DeadlineBudgets::default()
                .with_stage(Stage::Hopper, Duration::from_millis(100)),
            routing: RoutingPolicy::default(),
        };
        let orchestrator = Orchestrator::new(
            planner(org_then_people(), Intent::default()),
            Arc::new(store),
            EntitySchema::default(),
        )
        .with_analyzer(Arc::new(CountingAnalyzer::new()))
        .with_progress_reporter(reporter.clone())
        .with_config(config);

        let outcome = orchestrator.run("people at US companies", session()).await;

        assert_eq!(outcome.summary.final_stage, Stage::Done);
        assert!(!outcome.state.budget_exhausted);
        assert!(outcome.state.errors().iter().any(|e| matches!(
            e,
            PipelineError::DeadlineExceeded { label, .. } if label == "hopper"
        )));
        assert!(outcome
            .summary
            .error_kinds
            .contains(&"deadline_exceeded".to_string()));
        let organizations = outcome
            .state
            .retrieved_data
            .get("organizations")
            .expect("organizations");
        assert_eq!(organizations.len(), 10);
        assert!(!outcome.state.retrieved_data.has_documents("people"));
        assert_eq!(outcome.state.flattened_data.len(), 10);
        assert!(outcome.state.answer.is_some());
        assert_eq!(
            reporter.started_stages(),
            vec![
                Stage::Planner,
                Stage::Retriever,
                Stage::Hopper,
                Stage::Responder
            ]
        );
    }

    #[tokio::test]
    async fn test_follow_up_turn_reuses_prior_data() {
        let sessions = Arc::new(InMemorySessionStore::new());
        let store: Arc<dyn DocumentStore> = Arc::new(crm());

        let first = Orchestrator::new(
            planner(org_then_people(), Intent::default()),
            store.clone(),
            EntitySchema::default(),
        )
        .with_session_store(sessions.clone());
        first.run("people at US companies", session()).await;

        let follow_up = Orchestrator::new(planner(Plan::default(), Intent::default()), store, EntitySchema::default())
            .with_session_store(sessions.clone());
        let outcome = follow_up.run("summarise those", session()).await;

        assert_eq!(outcome.summary.final_stage, Stage::Done);
        assert_eq!(outcome.state.previous_results.len(), 1);
        assert_eq!(outcome.state.entity_cache.organizations.len(), 10);
        assert!(outcome
            .state
            .retrieved_data
            .iter()
            .all(|set| set.metadata.method == RetrievalMethod::Prior));
        assert_eq!(outcome.state.retrieved_data.total_documents(), 20);
        assert_eq!(
            sessions.load(&session()).await.expect("session").previous_results.len(),
            2
        );
    }
}
