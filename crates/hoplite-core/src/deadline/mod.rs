//! Deadline supervisor
//!
//! Bounds every awaited operation with a hard timeout and tracks elapsed time
//! against the per-stage and whole-run budgets. Raising the failure is its only
//! side effect; callers decide between aborting and degrading.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{PipelineError, GLOBAL_DEADLINE_LABEL};
use crate::types::Stage;

/// Time budgets of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadlineBudgets {
    pub total: Duration,
    /// Remaining-time threshold that triggers a warning
    pub low_water: Duration,
    /// Budget of a single data-store query
    pub query: Duration,
    pub default_stage: Duration,
    pub stages: HashMap<Stage, Duration>,
}

impl Default for DeadlineBudgets {
    fn default() -> Self {
        let stages = [
            (Stage::Planner, 20_000),
            (Stage::Retriever, 30_000),
            (Stage::Hopper, 20_000),
            (Stage::Analyzer, 30_000),
            (Stage::Critic, 15_000),
            (Stage::Executor, 30_000),
            (Stage::Responder, 30_000),
        ]
        .into_iter()
        .map(|(stage, ms)| (stage, Duration::from_millis(ms)))
        .collect();
        Self {
            total: Duration::from_millis(90_000),
            low_water: Duration::from_millis(15_000),
            query: Duration::from_millis(10_000),
            default_stage: Duration::from_millis(30_000),
            stages,
        }
    }
}

impl DeadlineBudgets {
    pub fn with_total(mut self, total: Duration) -> Self {
        self.total = total;
        self
    }

    pub fn with_query(mut self, query: Duration) -> Self {
        self.query = query;
        self
    }

    pub fn with_stage(mut self, stage: Stage, budget: Duration) -> Self {
        self.stages.insert(stage, budget);
        self
    }

    pub fn stage(&self, stage: Stage) -> Duration {
        self.stages.get(&stage).copied().unwrap_or(self.default_stage)
    }
}

/// Await `operation` for at most `duration`.
pub async fn with_timeout<F>(
    operation: F,
    duration: Duration,
    label: &str,
) -> Result<F::Output, PipelineError>
where
    F: Future,
{
    tokio::time::timeout(duration, operation)
        .await
        .map_err(|_| PipelineError::deadline(label, millis(duration)))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Per-run deadline supervisor. Create one for each run.
#[derive(Debug)]
pub struct DeadlineSupervisor {
    budgets: DeadlineBudgets,
    low_water_warned: AtomicBool,
}

impl DeadlineSupervisor {
    pub fn new(budgets: DeadlineBudgets) -> Self {
        Self {
            budgets,
            low_water_warned: AtomicBool::new(false),
        }
    }

    pub fn budgets(&self) -> &DeadlineBudgets {
        &self.budgets
    }

    pub fn total_budget(&self) -> Duration {
        self.budgets.total
    }

    pub fn query_budget(&self) -> Duration {
        self.budgets.query
    }

    pub fn stage_budget(&self, stage: Stage) -> Duration {
        self.budgets.stage(stage)
    }

    pub async fn with_timeout<F>(
        &self,
        operation: F,
        duration: Duration,
        label: &str,
    ) -> Result<F::Output, PipelineError>
    where
        F: Future,
    {
        with_timeout(operation, duration, label).await
    }

    /// Run a stage body under that stage's budget.
    pub async fn with_stage_timeout<F>(
        &self,
        stage: Stage,
        operation: F,
    ) -> Result<F::Output, PipelineError>
    where
        F: Future,
    {
        with_timeout(operation, self.stage_budget(stage), stage.name()).await
    }

    /// Time left in the run, failing once the total budget is spent.
    pub fn check_global_budget(&self, started_at: Instant) -> Result<Duration, PipelineError> {
        let elapsed = started_at.elapsed();
        if elapsed > self.budgets.total {
            return Err(PipelineError::deadline(
                GLOBAL_DEADLINE_LABEL,
                millis(self.budgets.total),
            ));
        }
        let remaining = self.budgets.total - elapsed;
        if remaining < self.budgets.low_water
            && !self.low_water_warned.swap(true, Ordering::Relaxed)
        {
            tracing::warn!(
                remaining_ms = millis(remaining),
                total_ms = millis(self.budgets.total),
                "execution budget running low"
            );
        }
        Ok(remaining)
    }

    /// Elapsed time of `stage`, failing when it exceeds the stage budget.
    /// A stage without a recorded start has used nothing.
    pub fn track_stage(
        &self,
        stage: Stage,
        stage_started: &HashMap<Stage, Instant>,
    ) -> Result<Duration, PipelineError> {
        let Some(started) = stage_started.get(&stage) else {
            return Ok(Duration::ZERO);
        };
        let elapsed = started.elapsed();
        let budget = self.stage_budget(stage);
        if elapsed > budget {
            return Err(PipelineError::deadline(stage.name(), millis(budget)));
        }
        Ok(elapsed)
    }

    /// Shortest of the query budget and the time left in the run.
    pub fn query_deadline(&self, started_at: Instant) -> Result<Duration, PipelineError> {
        let remaining = self.check_global_budget(started_at)?;
        Ok(remaining.min(self.budgets.query))
    }

    pub fn low_water_warned(&self) -> bool {
        self.low_water_warned.load(Ordering::Relaxed)
    }
}

impl Default for DeadlineSupervisor {
    fn default() -> Self {
        Self::new(DeadlineBudgets::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_timeout_reports_label_and_budget() {
        tokio_test::block_on(async {
            let result = with_timeout(
                tokio::time::sleep(Duration::from_millis(200)),
                Duration::from_millis(10),
                "organizations query",
            )
            .await;
            match result {
                Err(PipelineError::DeadlineExceeded { label, budget_ms }) => {
                    assert_eq!(label, "organizations query");
                    assert_eq!(budget_ms, 10);
                }
                other => panic!("unexpected: {:?}", other),
            }
        });
    }

    #[test]
    fn test_with_timeout_passes_through_fast_result() {
        tokio_test::block_on(async {
            let value = with_timeout(async { 7 }, Duration::from_secs(1), "fast")
                .await
                .expect("in time");
            assert_eq!(value, 7);
        });
    }

    #[test]
    fn test_global_budget_exhausted() {
        let supervisor =
            DeadlineSupervisor::new(DeadlineBudgets::default().with_total(Duration::from_millis(50)));
        let started = Instant::now() - Duration::from_millis(100);
        let err = supervisor.check_global_budget(started).expect_err("exhausted");
        assert_eq!(err.kind(), "deadline_exceeded");
        assert!(err.is_global_deadline());
    }

    #[test]
    fn test_low_water_warning_fires_once() {
        let budgets = DeadlineBudgets {
            total: Duration::from_secs(10),
            low_water: Duration::from_secs(5),
            ..DeadlineBudgets::default()
        };
        let supervisor = DeadlineSupervisor::new(budgets);
        assert!(supervisor.check_global_budget(Instant::now()).is_ok());
        assert!(!supervisor.low_water_warned());

        let late = Instant::now() - Duration::from_secs(6);
        assert!(supervisor.check_global_budget(late).is_ok());
        assert!(supervisor.low_water_warned());
        assert!(supervisor.check_global_budget(late).is_ok());
    }

    #[test]
    fn test_track_stage_uses_stage_budget() {
        let supervisor = DeadlineSupervisor::new(
            DeadlineBudgets::default().with_stage(Stage::Hopper, Duration::from_millis(20)),
        );
        let mut started = HashMap::new();
        assert_eq!(
            supervisor.track_stage(Stage::Hopper, &started).expect("untracked"),
            Duration::ZERO
        );

        started.insert(Stage::Hopper, Instant::now() - Duration::from_millis(50));
        started.insert(Stage::Analyzer, Instant::now() - Duration::from_millis(50));
        assert!(supervisor.track_stage(Stage::Hopper, &started).is_err());
        assert!(supervisor.track_stage(Stage::Analyzer, &started).is_ok());
    }
}
