//! Configuration loading and hot-reload support.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::{HopliteConfig, STAGE_NAMES};

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("File watch error: {0}")]
    Notify(#[from] notify::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Load and validate configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<HopliteConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from YAML text. Blank input yields defaults.
pub fn parse_config(content: &str) -> Result<HopliteConfig, ConfigError> {
    let config: HopliteConfig = if content.trim().is_empty() {
        HopliteConfig::default()
    } else {
        serde_yaml::from_str(content)?
    };
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &HopliteConfig) -> Result<(), ConfigError> {
    if config.app.name.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "app.name must not be empty".to_string(),
        ));
    }

    let budgets = &config.budgets;
    for (name, value) in [
        ("total_ms", budgets.total_ms),
        ("low_water_ms", budgets.low_water_ms),
        ("query_ms", budgets.query_ms),
        ("default_stage_ms", budgets.default_stage_ms),
    ] {
        if value == 0 {
            return Err(ConfigError::Invalid(format!(
                "budgets.{} must be > 0",
                name
            )));
        }
    }
    if budgets.low_water_ms >= budgets.total_ms {
        return Err(ConfigError::Invalid(
            "budgets.low_water_ms must be less than budgets.total_ms".to_string(),
        ));
    }
    for (stage, ms) in &budgets.stage_ms {
        if !STAGE_NAMES.contains(&stage.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "budgets.stage_ms has unknown stage '{}'",
                stage
            )));
        }
        if *ms == 0 {
            return Err(ConfigError::Invalid(format!(
                "budgets.stage_ms.{} must be > 0",
                stage
            )));
        }
    }

    let retrieval = &config.retrieval;
    if retrieval.max_parallel_fetches == 0 {
        return Err(ConfigError::Invalid(
            "retrieval.max_parallel_fetches must be > 0".to_string(),
        ));
    }
    if retrieval.default_limit == 0 {
        return Err(ConfigError::Invalid(
            "retrieval.default_limit must be > 0".to_string(),
        ));
    }
    if !(retrieval.hop_confidence > 0.0 && retrieval.hop_confidence <= 1.0) {
        return Err(ConfigError::Invalid(
            "retrieval.hop_confidence must be in (0, 1]".to_string(),
        ));
    }
    if retrieval.user_token.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "retrieval.user_token must not be empty".to_string(),
        ));
    }

    for (key, value) in config.schema.entries() {
        if value.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "schema.{} must not be empty",
                key
            )));
        }
    }

    if config.session.max_results_per_session == 0 {
        return Err(ConfigError::Invalid(
            "session.max_results_per_session must be > 0".to_string(),
        ));
    }

    Ok(())
}

/// Manages configuration with hot-reload support.
pub struct ConfigManager {
    path: PathBuf,
    config: Arc<RwLock<HopliteConfig>>,
}

impl ConfigManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            config: Arc::new(RwLock::new(HopliteConfig::default())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shared handle to the current config.
    pub fn config(&self) -> Arc<RwLock<HopliteConfig>> {
        self.config.clone()
    }

    /// Clone of the current config.
    pub async fn snapshot(&self) -> HopliteConfig {
        self.config.read().await.clone()
    }

    /// Load configuration from file. A failed load keeps the previous config.
    pub async fn load(&self) -> Result<(), ConfigError> {
        let config = load_config(&self.path)?;
        let mut current = self.config.write().await;
        *current = config;
        Ok(())
    }

    /// Start watching for config file changes.
    pub fn start_watching(self: &Arc<Self>) -> Result<ConfigWatcher, ConfigError> {
        let manager = Arc::clone(self);
        let handle = tokio::runtime::Handle::current();

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    if matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                    ) {
                        let manager = Arc::clone(&manager);
                        handle.spawn(async move {
                            if let Err(e) = manager.load().await {
                                tracing::error!(path = %manager.path.display(), "Failed to reload config: {}", e);
                            } else {
                                tracing::info!(path = %manager.path.display(), "Config reloaded successfully");
                            }
                        });
                    }
                }
            })?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        Ok(ConfigWatcher { _watcher: watcher })
    }
}

/// Keeps the file watcher alive.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}
