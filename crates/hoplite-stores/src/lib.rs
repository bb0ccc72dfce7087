//! # Hoplite Stores
//!
//! In-memory store implementations for the hoplite runtime.
//!
//! This crate provides:
//! - InMemory DocumentStore (filters, sort/limit, aggregation pipeline subset)
//! - InMemory SessionStore (per-session ring buffer with TTL eviction)

mod aggregate;
mod document_store;
mod matcher;
mod session_store;

pub use document_store::InMemoryDocumentStore;
pub use session_store::{
    InMemorySessionStore, DEFAULT_MAX_RESULTS_PER_SESSION, DEFAULT_SESSION_TTL_SECS,
};

// Re-export core traits for convenience
pub use hoplite_core::store::{DocumentStore, Query, SessionStore, StoreError};
