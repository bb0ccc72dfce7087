//! DocumentStore in-memory implementation.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

use hoplite_core::store::{DocumentStore, Query, StoreError};
use hoplite_core::types::Document;

use crate::aggregate::run_pipeline;
use crate::matcher::{sort_documents, Matcher};

/// In-memory collections for development and testing.
///
/// Unknown collections read as empty unless the store is strict.
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    strict: bool,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            strict: false,
        }
    }

    /// Reject reads against collections that were never inserted into.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Builder form of [`insert_many`](Self::insert_many) for fixtures.
    ///
    /// Non-object values are skipped.
    pub fn with_collection(self, collection: impl Into<String>, documents: Value) -> Self {
        let documents = match documents {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
            Value::Object(map) => vec![map],
            _ => Vec::new(),
        };
        if let Ok(mut collections) = self.collections.write() {
            collections
                .entry(collection.into())
                .or_default()
                .extend(documents);
        }
        self
    }

    pub fn insert(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        self.insert_many(collection, vec![document])
    }

    pub fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<(), StoreError> {
        let mut collections = self
            .collections
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        collections
            .entry(collection.to_string())
            .or_default()
            .extend(documents);
        Ok(())
    }

    pub fn count(&self, collection: &str) -> Result<usize, StoreError> {
        let collections = self
            .collections
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(collections.get(collection).map_or(0, Vec::len))
    }

    fn snapshot(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let collections = self
            .collections
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        match collections.get(collection) {
            Some(documents) => Ok(documents.clone()),
            None if self.strict => Err(StoreError::NotFound(collection.to_string())),
            None => Ok(Vec::new()),
        }
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn find(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let matcher = Matcher::compile(&query.filter)?;
        let mut documents: Vec<Document> = self
            .snapshot(&query.collection)?
            .into_iter()
            .filter(|d| matcher.matches(d))
            .collect();
        if let Some(sort) = &query.sort {
            sort_documents(&mut documents, sort);
        }
        if let Some(limit) = query.limit {
            documents.truncate(limit);
        }
        tracing::trace!(
            collection = %query.collection,
            matched = documents.len(),
            "in-memory find"
        );
        Ok(documents)
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Value],
    ) -> Result<Vec<Document>, StoreError> {
        let documents = self.snapshot(collection)?;
        let out = run_pipeline(documents, pipeline)?;
        tracing::trace!(
            collection = %collection,
            stages = pipeline.len(),
            rows = out.len(),
            "in-memory aggregate"
        );
        Ok(out)
    }
}
