//! Bootstrap helpers for starting hoplite from a single YAML config.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use thiserror::Error;

use hoplite_config::{
    BudgetsConfig, ConfigError, ConfigManager, ConfigWatcher, HopliteConfig, ObservabilityConfig,
    SchemaConfig,
};
use hoplite_core::deadline::DeadlineBudgets;
use hoplite_core::hop::{HopResolver, HopSettings};
use hoplite_core::planner::Planner;
use hoplite_core::retrieval::{RetrievalEngine, RetrievalSettings};
use hoplite_core::routing::RoutingPolicy;
use hoplite_core::store::DocumentStore;
use hoplite_core::types::{EntitySchema, SessionKey, Stage};
use hoplite_stores::{InMemoryDocumentStore, InMemorySessionStore};

use crate::orchestrator::{Orchestrator, OrchestratorConfig, RunOutcome};

/// Runtime bootstrap errors.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("unknown stage in budgets.stage_ms: {0}")]
    UnknownStage(String),
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Running app bundle created from a config file.
pub struct RuntimeApp {
    pub orchestrator: Orchestrator,
    pub session_store: Arc<InMemorySessionStore>,
    pub config_manager: Arc<ConfigManager>,
    _config_watcher: Option<ConfigWatcher>,
}

impl RuntimeApp {
    /// Create a runnable app from `hoplite.yaml` over an in-memory document store.
    pub async fn from_config_path(
        path: impl Into<PathBuf>,
        planner: Arc<dyn Planner>,
        document_store: Arc<InMemoryDocumentStore>,
    ) -> Result<Self, BootstrapError> {
        Self::from_config_path_with_store(path, planner, document_store).await
    }

    /// Create a runnable app over any document store.
    pub async fn from_config_path_with_store(
        path: impl Into<PathBuf>,
        planner: Arc<dyn Planner>,
        document_store: Arc<dyn DocumentStore>,
    ) -> Result<Self, BootstrapError> {
        let config_manager = Arc::new(ConfigManager::new(path.into()));
        config_manager.load().await?;
        let config = config_manager.snapshot().await;
        init_tracing_if_needed(&config.observability);

        let session_store = Arc::new(InMemorySessionStore::with_limits(
            config.session.max_results_per_session,
            config.session.ttl_secs,
        ));
        let orchestrator = build_orchestrator(&config, planner, document_store)?
            .with_session_store(session_store.clone());
        tracing::info!(
            app = %config.app.name,
            environment = %config.app.environment,
            total_budget_ms = config.budgets.total_ms,
            max_parallel_fetches = config.retrieval.max_parallel_fetches,
            "hoplite runtime ready"
        );

        Ok(Self {
            orchestrator,
            session_store,
            config_manager,
            _config_watcher: None,
        })
    }

    /// Reload the config file on change. Budgets and the critique bound apply
    /// from the next run; other sections require a rebuild.
    pub fn watch_config(&mut self) -> Result<(), BootstrapError> {
        self._config_watcher = Some(self.config_manager.start_watching()?);
        Ok(())
    }

    /// Answer `query` with the currently loaded config.
    pub async fn run(&self, query: impl Into<String>, session: SessionKey) -> RunOutcome {
        let config = self.config_manager.snapshot().await;
        let run_config = match orchestrator_config(&config) {
            Ok(run_config) => run_config,
            Err(error) => {
                tracing::warn!(error = %error, "reloaded config unusable, keeping previous budgets");
                self.orchestrator.config.clone()
            }
        };
        self.orchestrator
            .run_with_config(query, session, &run_config)
            .await
    }
}

/// Wire an orchestrator from config.
pub fn build_orchestrator(
    config: &HopliteConfig,
    planner: Arc<dyn Planner>,
    document_store: Arc<dyn DocumentStore>,
) -> Result<Orchestrator, BootstrapError> {
    let schema = entity_schema(&config.schema);
    let retrieval = RetrievalEngine::with_settings(
        document_store.clone(),
        schema.clone(),
        RetrievalSettings {
            max_parallel_fetches: config.retrieval.max_parallel_fetches,
            parallel_fetch_enabled: config.retrieval.parallel_fetch_enabled,
            default_limit: config.retrieval.default_limit,
            user_token: config.retrieval.user_token.clone(),
        },
    );
    let hopper = HopResolver::new(document_store.clone(), schema.clone()).with_settings(HopSettings {
        confidence: config.retrieval.hop_confidence,
        default_limit: config.retrieval.default_limit,
    });
    Ok(Orchestrator::new(planner, document_store, schema)
        .with_retrieval(retrieval)
        .with_hopper(hopper)
        .with_config(orchestrator_config(config)?))
}

pub fn orchestrator_config(config: &HopliteConfig) -> Result<OrchestratorConfig, BootstrapError> {
    Ok(OrchestratorConfig {
        budgets: deadline_budgets(&config.budgets)?,
        routing: RoutingPolicy {
            max_iterations: config.retrieval.max_iterations,
        },
    })
}

pub fn deadline_budgets(config: &BudgetsConfig) -> Result<DeadlineBudgets, BootstrapError> {
    let mut budgets = DeadlineBudgets {
        total: Duration::from_millis(config.total_ms),
        low_water: Duration::from_millis(config.low_water_ms),
        query: Duration::from_millis(config.query_ms),
        default_stage: Duration::from_millis(config.default_stage_ms),
        stages: Default::default(),
    };
    for (name, ms) in &config.stage_ms {
        let stage =
            Stage::from_name(name).ok_or_else(|| BootstrapError::UnknownStage(name.clone()))?;
        budgets = budgets.with_stage(stage, Duration::from_millis(*ms));
    }
    Ok(budgets)
}

pub fn entity_schema(config: &SchemaConfig) -> EntitySchema {
    EntitySchema {
        organizations: config.organizations.clone(),
        people: config.people.clone(),
        persona: config.persona.clone(),
        id_field: config.id_field.clone(),
        organization_ref_field: config.organization_ref_field.clone(),
        person_ref_field: config.person_ref_field.clone(),
        model_ref_field: config.model_ref_field.clone(),
    }
}

/// Install the global tracing subscriber once per process.
pub fn init_tracing_if_needed(observability: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let log_file_path = std::env::var("HOPLITE_LOG_FILE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| observability.log_file.clone());
        let file_writer = log_file_path.as_deref().and_then(create_log_writer);
        let fallback_level = match observability.log_level.trim().to_ascii_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" => "warn",
            "error" => "error",
            _ => "info",
        };

        let make_filter = || {
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(fallback_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        };
        let span_events = if observability.traces_enabled {
            tracing_subscriber::fmt::format::FmtSpan::NEW
                | tracing_subscriber::fmt::format::FmtSpan::CLOSE
        } else {
            tracing_subscriber::fmt::format::FmtSpan::NONE
        };

        match file_writer {
            Some(writer) => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(make_filter())
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_span_events(span_events)
                    .try_init();
            }
            None => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(make_filter())
                    .with_target(true)
                    .with_span_events(span_events)
                    .try_init();
            }
        }

        tracing::info!(
            log_level = %observability.log_level,
            traces_enabled = observability.traces_enabled,
            log_file = log_file_path.as_deref().unwrap_or("(stdout)"),
            "tracing initialized"
        );
    });
}

fn create_log_writer(path: &str) -> Option<SharedFileMakeWriter> {
    use std::fs::{create_dir_all, OpenOptions};
    use std::path::Path;

    let file_path = Path::new(path);
    if let Some(parent) = file_path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = create_dir_all(parent) {
                eprintln!(
                    "failed to create log directory '{}': {}",
                    parent.display(),
                    err
                );
                return None;
            }
        }
    }
    let file = match OpenOptions::new().create(true).append(true).open(file_path) {
        Ok(f) => f,
        Err(err) => {
            eprintln!("failed to open log file '{}': {}", file_path.display(), err);
            return None;
        }
    };
    Some(SharedFileMakeWriter::new(file))
}

#[derive(Clone)]
struct SharedFileMakeWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl SharedFileMakeWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

struct SharedFileWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedFileMakeWriter {
    type Writer = SharedFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SharedFileWriter {
            file: self.file.clone(),
        }
    }
}

impl std::io::Write for SharedFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| std::io::Error::other("log file mutex poisoned"))?;
        std::io::Write::write(&mut *file, buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| std::io::Error::other("log file mutex poisoned"))?;
        std::io::Write::flush(&mut *file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoplite_config::parse_config;

    #[test]
    fn test_budgets_follow_config() {
        let config = parse_config(
            "budgets:\n  total_ms: 4000\n  low_water_ms: 500\n  stage_ms:\n    hopper: 1500\n",
        )
        .expect("config");
        let run_config = orchestrator_config(&config).expect("run config");
        assert_eq!(run_config.budgets.total, Duration::from_millis(4000));
        assert_eq!(run_config.budgets.stage(Stage::Hopper), Duration::from_millis(1500));
        assert_eq!(run_config.budgets.stage(Stage::Critic), Duration::from_millis(30_000));
        assert_eq!(run_config.routing.max_iterations, 2);
    }

    #[test]
    fn test_schema_follows_config() {
        let config = parse_config("schema:\n  organizations: companies\n  id_field: id\n")
            .expect("config");
        let schema = entity_schema(&config.schema);
        assert_eq!(schema.organizations, "companies");
        assert_eq!(schema.id_field, "id");
        assert_eq!(schema.people, "people");
    }
}
