//! Intent descriptor produced alongside the plan

use serde::{Deserialize, Serialize};

/// Actions the retrieval core performs itself.
pub const INTERNAL_ACTIONS: [&str; 3] = ["fetch", "hop", "aggregate"];

/// Coarse classification of what the user asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    /// Answer from retrieved data
    #[default]
    Query,
    /// Perform an external action
    Execute,
    /// Answerable without any data
    Informational,
}

/// Planner's reading of the user query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Intent {
    #[serde(rename = "type", default)]
    pub kind: IntentKind,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default, rename = "requiresHopping", alias = "requires_hopping")]
    pub requires_hopping: bool,
    #[serde(default)]
    pub collections: Vec<String>,
}

impl Intent {
    pub fn new(kind: IntentKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn with_actions(mut self, actions: Vec<String>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_collections(mut self, collections: Vec<String>) -> Self {
        self.collections = collections;
        self
    }

    /// Explicit execute intent, or any action outside fetch/hop/aggregate.
    pub fn requires_external_action(&self) -> bool {
        self.kind == IntentKind::Execute
            || self.actions.iter().any(|action| {
                !INTERNAL_ACTIONS
                    .iter()
                    .any(|internal| action.eq_ignore_ascii_case(internal))
            })
    }

    pub fn is_informational(&self) -> bool {
        self.kind == IntentKind::Informational
    }
}
