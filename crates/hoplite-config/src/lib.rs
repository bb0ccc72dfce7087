//! # Hoplite Config
//!
//! Unified single-file configuration for hoplite.
//! A single `hoplite.yaml` configures time budgets, retrieval limits, the
//! dataset layout, session memory and observability. Every field has a
//! default, so an empty file is a valid configuration.

mod loader;

pub use loader::{load_config, parse_config, ConfigError, ConfigManager, ConfigWatcher};

use serde::Deserialize;
use std::collections::BTreeMap;

/// Top-level configuration schema for hoplite.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HopliteConfig {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub budgets: BudgetsConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_env")]
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            environment: default_env(),
        }
    }
}

fn default_app_name() -> String {
    "hoplite".to_string()
}

fn default_env() -> String {
    "development".to_string()
}

/// Time budgets in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct BudgetsConfig {
    #[serde(default = "default_total_ms")]
    pub total_ms: u64,
    /// Remaining time below which a warning is logged once per run.
    #[serde(default = "default_low_water_ms")]
    pub low_water_ms: u64,
    #[serde(default = "default_query_ms")]
    pub query_ms: u64,
    /// Keyed by stage name (`planner`, `retriever`, ...).
    #[serde(default = "default_stage_ms")]
    pub stage_ms: BTreeMap<String, u64>,
    #[serde(default = "default_default_stage_ms")]
    pub default_stage_ms: u64,
}

impl Default for BudgetsConfig {
    fn default() -> Self {
        Self {
            total_ms: default_total_ms(),
            low_water_ms: default_low_water_ms(),
            query_ms: default_query_ms(),
            stage_ms: default_stage_ms(),
            default_stage_ms: default_default_stage_ms(),
        }
    }
}

fn default_total_ms() -> u64 {
    90_000
}

fn default_low_water_ms() -> u64 {
    15_000
}

fn default_query_ms() -> u64 {
    10_000
}

fn default_default_stage_ms() -> u64 {
    30_000
}

fn default_stage_ms() -> BTreeMap<String, u64> {
    [
        ("planner", 20_000),
        ("retriever", 30_000),
        ("hopper", 20_000),
        ("analyzer", 30_000),
        ("critic", 15_000),
        ("executor", 30_000),
        ("responder", 30_000),
    ]
    .into_iter()
    .map(|(name, ms)| (name.to_string(), ms))
    .collect()
}

/// Stage names accepted in `budgets.stage_ms`.
pub const STAGE_NAMES: [&str; 7] = [
    "planner",
    "retriever",
    "hopper",
    "analyzer",
    "critic",
    "executor",
    "responder",
];

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_parallel_fetches")]
    pub max_parallel_fetches: usize,
    #[serde(default = "default_true")]
    pub parallel_fetch_enabled: bool,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    /// Critique loop bound.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_hop_confidence")]
    pub hop_confidence: f64,
    /// Filter value replaced by the requesting user's id.
    #[serde(default = "default_user_token")]
    pub user_token: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_parallel_fetches: default_max_parallel_fetches(),
            parallel_fetch_enabled: true,
            default_limit: default_limit(),
            max_iterations: default_max_iterations(),
            hop_confidence: default_hop_confidence(),
            user_token: default_user_token(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_parallel_fetches() -> usize {
    4
}

fn default_limit() -> usize {
    100
}

fn default_max_iterations() -> u32 {
    2
}

fn default_hop_confidence() -> f64 {
    0.9
}

fn default_user_token() -> String {
    "CURRENT_USER_ID".to_string()
}

/// Collection and field names of the business dataset.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    #[serde(default = "default_organizations")]
    pub organizations: String,
    #[serde(default = "default_people")]
    pub people: String,
    #[serde(default = "default_persona")]
    pub persona: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_organization_ref_field")]
    pub organization_ref_field: String,
    #[serde(default = "default_person_ref_field")]
    pub person_ref_field: String,
    #[serde(default = "default_model_ref_field")]
    pub model_ref_field: String,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            organizations: default_organizations(),
            people: default_people(),
            persona: default_persona(),
            id_field: default_id_field(),
            organization_ref_field: default_organization_ref_field(),
            person_ref_field: default_person_ref_field(),
            model_ref_field: default_model_ref_field(),
        }
    }
}

impl SchemaConfig {
    /// `(yaml key, value)` pairs, for validation and diagnostics.
    pub fn entries(&self) -> [(&'static str, &str); 7] {
        [
            ("organizations", &self.organizations),
            ("people", &self.people),
            ("persona", &self.persona),
            ("id_field", &self.id_field),
            ("organization_ref_field", &self.organization_ref_field),
            ("person_ref_field", &self.person_ref_field),
            ("model_ref_field", &self.model_ref_field),
        ]
    }
}

fn default_organizations() -> String {
    "organizations".to_string()
}

fn default_people() -> String {
    "people".to_string()
}

fn default_persona() -> String {
    "persona_intelligence".to_string()
}

fn default_id_field() -> String {
    "_id".to_string()
}

fn default_organization_ref_field() -> String {
    "organizationId".to_string()
}

fn default_person_ref_field() -> String {
    "personId".to_string()
}

fn default_model_ref_field() -> String {
    "profileModelId".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_results_per_session")]
    pub max_results_per_session: usize,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_results_per_session: default_max_results_per_session(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_max_results_per_session() -> usize {
    10
}

fn default_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub traces_enabled: bool,
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            traces_enabled: false,
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
