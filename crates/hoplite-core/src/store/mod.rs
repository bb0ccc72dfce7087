//! Store module
//!
//! This module provides storage abstractions:
//! - DocumentStore: filtered reads and aggregation pipelines over collections
//! - SessionStore: prior-turn results and entity caches between runs
//!
//! Note: Implementations are in hoplite-stores crate

mod document_store;
mod session_store;

pub use document_store::{DocumentStore, Query};
pub use session_store::SessionStore;

use thiserror::Error;

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Collection not found: {0}")]
    NotFound(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
