//! SessionStore in-memory implementation.
//!
//! Prior results are kept in a bounded ring buffer per (session, user). Entries
//! older than the TTL are evicted on read, or eagerly through
//! [`InMemorySessionStore::evict_expired_at`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use hoplite_core::store::{SessionStore, StoreError};
use hoplite_core::types::{EntityIdentifierCache, PreviousQueryResult, SessionKey, SessionSnapshot};

pub const DEFAULT_MAX_RESULTS_PER_SESSION: usize = 10;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 3600;

#[derive(Debug, Default)]
struct SessionEntry {
    results: VecDeque<PreviousQueryResult>,
    entity_cache: EntityIdentifierCache,
    touched_at: Option<DateTime<Utc>>,
}

/// In-memory session memory, injected into the runtime.
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionKey, SessionEntry>>,
    max_results: usize,
    ttl: Duration,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_RESULTS_PER_SESSION, DEFAULT_SESSION_TTL_SECS)
    }

    pub fn with_limits(max_results: usize, ttl_secs: u64) -> Self {
        let ttl_secs = i64::try_from(ttl_secs).unwrap_or(i64::MAX / 1_000);
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_results: max_results.max(1),
            ttl: Duration::try_seconds(ttl_secs).unwrap_or(Duration::MAX),
        }
    }

    /// Drop expired results, and whole sessions untouched for longer than the TTL.
    /// Returns the number of results removed.
    pub fn evict_expired_at(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let mut removed = 0;
        sessions.retain(|_, entry| {
            removed += prune(entry, now, self.ttl);
            entry
                .touched_at
                .is_some_and(|touched| now.signed_duration_since(touched) <= self.ttl)
        });
        if removed > 0 {
            tracing::debug!(removed, "evicted expired session results");
        }
        Ok(removed)
    }

    pub fn evict_expired(&self) -> Result<usize, StoreError> {
        self.evict_expired_at(Utc::now())
    }

    pub fn session_count(&self) -> Result<usize, StoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(sessions.len())
    }

    fn load_at(&self, key: &SessionKey, now: DateTime<Utc>) -> Result<SessionSnapshot, StoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let Some(entry) = sessions.get(key) else {
            return Ok(SessionSnapshot::default());
        };
        Ok(SessionSnapshot {
            previous_results: entry
                .results
                .iter()
                .filter(|r| now.signed_duration_since(r.timestamp) <= self.ttl)
                .cloned()
                .collect(),
            entity_cache: entry.entity_cache.clone(),
        })
    }
}

fn prune(entry: &mut SessionEntry, now: DateTime<Utc>, ttl: Duration) -> usize {
    let before = entry.results.len();
    entry
        .results
        .retain(|r| now.signed_duration_since(r.timestamp) <= ttl);
    before - entry.results.len()
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, key: &SessionKey) -> Result<SessionSnapshot, StoreError> {
        self.load_at(key, Utc::now())
    }

    async fn save(
        &self,
        key: &SessionKey,
        result: PreviousQueryResult,
        entity_cache: &EntityIdentifierCache,
    ) -> Result<(), StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let entry = sessions.entry(key.clone()).or_default();
        while entry.results.len() >= self.max_results {
            entry.results.pop_front();
        }
        entry.results.push_back(result);
        entry.entity_cache = entity_cache.clone();
        entry.touched_at = Some(Utc::now());
        tracing::debug!(
            session_id = %key.session_id,
            user_id = %key.user_id,
            stored = entry.results.len(),
            "saved session result"
        );
        Ok(())
    }

    async fn clear(&self, key: &SessionKey) -> Result<(), StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        sessions.remove(key);
        Ok(())
    }
}
