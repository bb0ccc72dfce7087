//! DocumentStore - query executor trait for the business dataset

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StoreError;
use crate::types::{Document, Filter, SortSpec};

/// A resolved read against one collection.
///
/// The filter never carries step references once it reaches a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    #[serde(default)]
    pub filter: Filter,
    #[serde(default)]
    pub sort: Option<SortSpec>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(collection: impl Into<String>, filter: Filter) -> Self {
        Self {
            collection: collection.into(),
            filter,
            sort: None,
            limit: None,
        }
    }

    pub fn with_sort(mut self, sort: Option<SortSpec>) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }
}

/// Document store interface
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Matching documents in sort order, truncated to the limit
    async fn find(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Run an aggregation pipeline over a collection
    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Value],
    ) -> Result<Vec<Document>, StoreError>;
}
