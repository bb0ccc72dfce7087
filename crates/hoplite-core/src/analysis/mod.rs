//! Analysis, critique and response abstractions.
//!
//! These stages consume the retrieved data of a run. They must cope with
//! partial or empty data; the retrieval core always hands them a well-formed
//! (possibly empty) data set list.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::ExecutionState;

/// Analysis / critique / response errors
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis failed: {0}")]
    Failed(String),

    #[error("model unavailable: {0}")]
    Unavailable(String),
}

/// Output of the analysis stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub summary: String,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl Analysis {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            insights: Vec::new(),
            metadata: Value::Null,
        }
    }

    pub fn with_insights(mut self, insights: Vec<String>) -> Self {
        self.insights = insights;
        self
    }
}

/// Verdict of the critique stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    pub valid: bool,
    #[serde(default)]
    pub feedback: Option<String>,
}

impl Validation {
    pub fn valid() -> Self {
        Self {
            valid: true,
            feedback: None,
        }
    }

    pub fn invalid(feedback: impl Into<String>) -> Self {
        Self {
            valid: false,
            feedback: Some(feedback.into()),
        }
    }
}

/// User-facing answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub message: String,
    #[serde(default)]
    pub metadata: Value,
}

impl Response {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, state: &ExecutionState) -> Result<Analysis, AnalysisError>;
}

#[async_trait]
pub trait Critic: Send + Sync {
    async fn critique(&self, state: &ExecutionState) -> Result<Validation, AnalysisError>;
}

#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, state: &ExecutionState) -> Result<Response, AnalysisError>;
}

/// Deterministic fallback responder that reports document counts.
pub struct CountingResponder;

#[async_trait]
impl Responder for CountingResponder {
    async fn respond(&self, state: &ExecutionState) -> Result<Response, AnalysisError> {
        if state.empty_result || state.retrieved_data.total_documents() == 0 {
            return Ok(Response::new("No matching records were found."));
        }
        let parts: Vec<String> = state
            .retrieved_data
            .iter()
            .map(|set| format!("{} {}", set.len(), set.collection))
            .collect();
        Ok(Response::new(format!("Found {}.", parts.join(", "))))
    }
}
