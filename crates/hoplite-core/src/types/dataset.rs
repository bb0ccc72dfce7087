//! RetrievedDataSet - accumulated, deduplicated results for one collection

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use super::step::SortSpec;

/// A single record as returned by the document store.
pub type Document = Map<String, Value>;

/// Canonical string form of an identifier value.
///
/// Strings and numbers compare by their text; `{"$oid": ...}` wrappers are
/// unwrapped. Anything else is not an identifier.
pub fn canonical_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get("$oid").and_then(canonical_id),
        _ => None,
    }
}

/// Values found at a dot-notation `path`, descending through arrays.
pub fn values_at_path<'a>(document: &'a Document, path: &str) -> Vec<&'a Value> {
    let mut current: Vec<&Value> = Vec::new();
    let mut segments = path.split('.');
    let Some(first) = segments.next() else {
        return current;
    };
    if let Some(value) = document.get(first) {
        current.push(value);
    }
    for segment in segments {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => {
                    if let Some(inner) = map.get(segment) {
                        next.push(inner);
                    }
                }
                Value::Array(items) => {
                    if let Ok(index) = segment.parse::<usize>() {
                        if let Some(inner) = items.get(index) {
                            next.push(inner);
                        }
                        continue;
                    }
                    for item in items {
                        if let Value::Object(map) = item {
                            if let Some(inner) = map.get(segment) {
                                next.push(inner);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        current = next;
    }
    current
}

/// Canonical identifiers found at `field` across `documents`, deduplicated in order.
pub fn collect_ids<'a, I>(documents: I, field: &str) -> Vec<String>
where
    I: IntoIterator<Item = &'a Document>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for document in documents {
        for value in values_at_path(document, field) {
            let candidates: Vec<&Value> = match value {
                Value::Array(items) => items.iter().collect(),
                single => vec![single],
            };
            for candidate in candidates {
                if let Some(id) = canonical_id(candidate) {
                    if seen.insert(id.clone()) {
                        out.push(id);
                    }
                }
            }
        }
    }
    out
}

/// Key a document is deduplicated by: its canonical id, or its full content.
fn dedup_key(document: &Document, id_field: &str) -> String {
    document
        .get(id_field)
        .and_then(canonical_id)
        .map(|id| format!("id:{}", id))
        .unwrap_or_else(|| format!("doc:{}", Value::Object(document.clone())))
}

/// How a data set was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMethod {
    Fetch,
    Hop,
    Aggregate,
    /// Reused from a previous turn of the session
    Prior,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSetMetadata {
    pub count: usize,
    pub method: RetrievalMethod,
    pub confidence: f64,
}

/// Retrieved documents for one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDataSet {
    pub collection: String,
    pub documents: Vec<Document>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub sort: Option<SortSpec>,
    pub metadata: DataSetMetadata,
}

impl RetrievedDataSet {
    pub fn new(collection: impl Into<String>, method: RetrievalMethod, confidence: f64) -> Self {
        Self {
            collection: collection.into(),
            documents: Vec::new(),
            limit: None,
            sort: None,
            metadata: DataSetMetadata {
                count: 0,
                method,
                confidence,
            },
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_sort(mut self, sort: Option<SortSpec>) -> Self {
        self.sort = sort;
        self
    }

    /// Append documents not already present. Existing documents keep their
    /// position. Returns how many were added.
    pub fn merge_documents<I>(&mut self, documents: I, id_field: &str) -> usize
    where
        I: IntoIterator<Item = Document>,
    {
        let mut seen: HashSet<String> = self
            .documents
            .iter()
            .map(|d| dedup_key(d, id_field))
            .collect();
        let mut added = 0;
        for document in documents {
            if seen.insert(dedup_key(&document, id_field)) {
                self.documents.push(document);
                added += 1;
            }
        }
        self.metadata.count = self.documents.len();
        added
    }

    pub fn ids(&self, field: &str) -> Vec<String> {
        collect_ids(&self.documents, field)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// All data sets of a run, at most one per collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct RetrievedData {
    sets: Vec<RetrievedDataSet>,
}

impl RetrievedData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, collection: &str) -> Option<&RetrievedDataSet> {
        self.sets.iter().find(|s| s.collection == collection)
    }

    pub fn get_mut(&mut self, collection: &str) -> Option<&mut RetrievedDataSet> {
        self.sets.iter_mut().find(|s| s.collection == collection)
    }

    pub fn contains(&self, collection: &str) -> bool {
        self.get(collection).is_some()
    }

    /// Has at least one document in `collection`.
    pub fn has_documents(&self, collection: &str) -> bool {
        self.get(collection).is_some_and(|s| !s.is_empty())
    }

    /// Merge `incoming` into the set for its collection, creating it when absent.
    /// Returns how many documents were new.
    pub fn merge(&mut self, incoming: RetrievedDataSet, id_field: &str) -> usize {
        match self.get_mut(&incoming.collection) {
            Some(existing) => existing.merge_documents(incoming.documents, id_field),
            None => {
                let RetrievedDataSet {
                    collection,
                    documents,
                    limit,
                    sort,
                    metadata,
                } = incoming;
                let mut fresh = RetrievedDataSet {
                    collection,
                    documents: Vec::new(),
                    limit,
                    sort,
                    metadata,
                };
                let added = fresh.merge_documents(documents, id_field);
                self.sets.push(fresh);
                added
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RetrievedDataSet> {
        self.sets.iter()
    }

    pub fn collections(&self) -> Vec<&str> {
        self.sets.iter().map(|s| s.collection.as_str()).collect()
    }

    /// Every document across collections, in set order.
    pub fn flatten(&self) -> Vec<Document> {
        self.sets
            .iter()
            .flat_map(|s| s.documents.iter().cloned())
            .collect()
    }

    pub fn total_documents(&self) -> usize {
        self.sets.iter().map(RetrievedDataSet::len).sum()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("object expected"),
        }
    }

    #[test]
    fn test_canonical_id_normalises_shapes() {
        assert_eq!(canonical_id(&json!("abc")), Some("abc".to_string()));
        assert_eq!(canonical_id(&json!(42)), Some("42".to_string()));
        assert_eq!(canonical_id(&json!({"$oid": "65f0"})), Some("65f0".to_string()));
        assert_eq!(canonical_id(&json!("  ")), None);
        assert_eq!(canonical_id(&json!(null)), None);
        assert_eq!(canonical_id(&json!(true)), None);
    }

    #[test]
    fn test_merge_deduplicates_across_id_types() {
        let mut data = RetrievedData::new();
        let mut first = RetrievedDataSet::new("organizations", RetrievalMethod::Fetch, 1.0);
        first.documents = vec![doc(json!({"_id": 1, "name": "Acme"}))];
        assert_eq!(data.merge(first, "_id"), 1);

        let mut second = RetrievedDataSet::new("organizations", RetrievalMethod::Hop, 0.9);
        second.documents = vec![
            doc(json!({"_id": "1", "name": "Acme"})),
            doc(json!({"_id": "2", "name": "Globex"})),
        ];
        assert_eq!(data.merge(second, "_id"), 1);

        let set = data.get("organizations").expect("set");
        assert_eq!(set.metadata.count, 2);
        assert_eq!(set.metadata.method, RetrievalMethod::Fetch);
        assert_eq!(set.documents[0].get("name"), Some(&json!("Acme")));
        assert_eq!(data.len(), 1);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut data = RetrievedData::new();
        let mut set = RetrievedDataSet::new("people", RetrievalMethod::Hop, 0.9);
        set.documents = vec![doc(json!({"_id": "p1"})), doc(json!({"_id": "p2"}))];
        data.merge(set.clone(), "_id");
        assert_eq!(data.merge(set, "_id"), 0);
        assert_eq!(data.total_documents(), 2);
    }

    #[test]
    fn test_collect_ids_reads_nested_and_array_values() {
        let docs = vec![
            doc(json!({"org": {"id": "A"}, "tags": ["x", "y"]})),
            doc(json!({"org": {"id": "B"}, "tags": ["y"]})),
            doc(json!({"org": {"id": null}})),
        ];
        assert_eq!(collect_ids(&docs, "org.id"), vec!["A", "B"]);
        assert_eq!(collect_ids(&docs, "tags"), vec!["x", "y"]);
    }
}
