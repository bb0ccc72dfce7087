//! Run progress reporting.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use hoplite_core::types::Stage;

/// A progress event emitted by the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct RunProgressEvent {
    pub run_id: String,
    pub stage: Option<Stage>,
    /// Phase label, e.g. stage_started/stage_completed/run_completed.
    pub phase: String,
    /// Optional human-readable message.
    pub message: Option<String>,
    /// Extra structured metadata.
    pub metadata: Value,
}

impl RunProgressEvent {
    pub fn new(run_id: impl Into<String>, stage: Option<Stage>, phase: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stage,
            phase: phase.into(),
            message: None,
            metadata: Value::Null,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Sink interface for run progress reporting.
#[async_trait]
pub trait RunProgressReporter: Send + Sync {
    async fn report(&self, event: RunProgressEvent) -> Result<(), String>;
}
