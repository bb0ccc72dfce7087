//! Fakes shared by unit tests

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::store::{DocumentStore, Query, StoreError};
use crate::types::{canonical_id, values_at_path, Condition, Document, Filter, Operand};

pub(crate) fn docs(value: Value) -> Vec<Document> {
    value
        .as_array()
        .expect("array of documents")
        .iter()
        .filter_map(|d| d.as_object().cloned())
        .collect()
}

/// Canned collections plus a log of every call.
#[derive(Default)]
pub(crate) struct RecordingStore {
    collections: HashMap<String, Vec<Document>>,
    failing: HashSet<String>,
    delay: Option<Duration>,
    pub queries: Mutex<Vec<Query>>,
    pub pipelines: Mutex<Vec<(String, Vec<Value>)>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, name: &str, documents: Value) -> Self {
        self.collections.insert(name.to_string(), docs(documents));
        self
    }

    pub fn failing(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn queries(&self) -> Vec<Query> {
        self.queries.lock().expect("lock").clone()
    }

    pub fn queries_for(&self, collection: &str) -> Vec<Query> {
        self.queries()
            .into_iter()
            .filter(|q| q.collection == collection)
            .collect()
    }
}

/// Top-level equality and membership only; other conditions match everything.
fn matches(document: &Document, filter: &Filter) -> bool {
    match filter {
        Filter::And(children) => children.iter().all(|c| matches(document, c)),
        Filter::Or(children) => children.iter().any(|c| matches(document, c)),
        Filter::Field { path, condition } => {
            let values: Vec<String> = values_at_path(document, path)
                .into_iter()
                .filter_map(canonical_id)
                .collect();
            let literal = |o: &Operand| o.as_literal().and_then(canonical_id);
            match condition {
                Condition::Eq(o) => literal(o).is_some_and(|v| values.contains(&v)),
                Condition::In(items) => items
                    .iter()
                    .filter_map(literal)
                    .any(|v| values.contains(&v)),
                _ => true,
            }
        }
    }
}

#[async_trait]
impl DocumentStore for RecordingStore {
    async fn find(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        self.queries.lock().expect("lock").push(query.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(&query.collection) {
            return Err(StoreError::Connection(format!(
                "{} unavailable",
                query.collection
            )));
        }
        let mut out: Vec<Document> = self
            .collections
            .get(&query.collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| matches(d, &query.filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Value],
    ) -> Result<Vec<Document>, StoreError> {
        self.pipelines
            .lock()
            .expect("lock")
            .push((collection.to_string(), pipeline.to_vec()));
        if self.failing.contains(collection) {
            return Err(StoreError::Connection(format!("{} unavailable", collection)));
        }
        Ok(self.collections.get(collection).cloned().unwrap_or_default())
    }
}
