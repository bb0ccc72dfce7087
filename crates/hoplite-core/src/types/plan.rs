//! Plan type definitions

use serde::{Deserialize, Serialize};

use super::step::{Step, StepId};

/// Ordered retrieval plan produced by the planner for one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Plan {
    /// Steps in planner order
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Whether analysis output must pass a validation round
    #[serde(default)]
    pub requires_validation: bool,
}

impl Plan {
    /// Create a new plan
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            requires_validation: false,
        }
    }

    /// Require a critique pass after analysis
    pub fn with_validation(mut self) -> Self {
        self.requires_validation = true;
        self
    }

    /// Get a step by ID
    pub fn get_step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub fn fetch_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.is_fetch())
    }

    pub fn hop_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.is_hop())
    }

    /// Fetch steps plus aggregates that will be degraded to fetches.
    pub fn fetch_like_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps
            .iter()
            .filter(|s| s.is_fetch() || s.is_malformed_aggregate())
    }

    pub fn has_fetches(&self) -> bool {
        self.fetch_like_steps().next().is_some()
    }

    pub fn has_hops(&self) -> bool {
        self.steps.iter().any(Step::is_hop)
    }

    /// Aggregate steps carrying a usable pipeline.
    pub fn pipeline_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.pipeline().is_some_and(|p| !p.is_empty()))
    }

    pub fn has_pipeline_aggregate(&self) -> bool {
        self.pipeline_steps().next().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
