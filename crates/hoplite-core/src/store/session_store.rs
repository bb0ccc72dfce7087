//! SessionStore - prior-turn memory trait

use async_trait::async_trait;

use super::StoreError;
use crate::types::{EntityIdentifierCache, PreviousQueryResult, SessionKey, SessionSnapshot};

/// Session persistence interface.
///
/// Read once at run start and written once at run end. Concurrent runs for the
/// same key resolve last-writer-wins.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load prior results (oldest first) and the entity cache
    async fn load(&self, key: &SessionKey) -> Result<SessionSnapshot, StoreError>;

    /// Append a finished run's result and replace the entity cache
    async fn save(
        &self,
        key: &SessionKey,
        result: PreviousQueryResult,
        entity_cache: &EntityIdentifierCache,
    ) -> Result<(), StoreError>;

    /// Drop everything held for a session
    async fn clear(&self, key: &SessionKey) -> Result<(), StoreError>;
}
