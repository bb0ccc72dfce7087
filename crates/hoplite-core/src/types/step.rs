//! Step type definitions
//!
//! A Step is one data-fetch, relational join ("hop") or aggregation in a Plan.
//! Steps are produced by the planner and never change shape afterwards; the
//! retrieval engine only derives resolved filters from them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::filter::Filter;

/// Strongly-typed Step ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for StepId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<StepId> for String {
    fn from(value: StepId) -> Self {
        value.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for StepId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<&str> for StepId {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// How two collections relate through a join field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cardinality {
    OneToMany,
    ManyToOne,
    OneToOne,
}

/// Join description between two collections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopPath {
    pub from: String,
    pub to: String,
    /// Foreign-key-like field connecting the two collections
    pub via: String,
    pub cardinality: Cardinality,
}

impl HopPath {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        via: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            via: via.into(),
            cardinality,
        }
    }

    /// Field read from source documents and field matched on the target collection.
    ///
    /// Many-to-one joins carry the key on the source side (`person.organizationId ->
    /// organization._id`); the other cardinalities carry it on the target side.
    pub fn join_fields<'a>(&'a self, id_field: &'a str) -> (&'a str, &'a str) {
        match self.cardinality {
            Cardinality::ManyToOne => (self.via.as_str(), id_field),
            Cardinality::OneToMany | Cardinality::OneToOne => (id_field, self.via.as_str()),
        }
    }
}

/// Sort direction for a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Ordered sort keys, written Mongo-style as `{"field": 1 | -1}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "Value", into = "Value")]
pub struct SortSpec(pub Vec<(String, SortOrder)>);

impl TryFrom<Value> for SortSpec {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(map) = value else {
            return Err("sort must be an object".to_string());
        };
        let mut keys = Vec::with_capacity(map.len());
        for (field, direction) in map {
            let order = match &direction {
                Value::Number(n) if n.as_i64() == Some(1) => SortOrder::Ascending,
                Value::Number(n) if n.as_i64() == Some(-1) => SortOrder::Descending,
                Value::String(s) if s.eq_ignore_ascii_case("asc") => SortOrder::Ascending,
                Value::String(s) if s.eq_ignore_ascii_case("desc") => SortOrder::Descending,
                other => return Err(format!("invalid sort direction for '{}': {}", field, other)),
            };
            keys.push((field, order));
        }
        Ok(Self(keys))
    }
}

impl From<SortSpec> for Value {
    fn from(spec: SortSpec) -> Self {
        Value::Object(
            spec.0
                .into_iter()
                .map(|(field, order)| {
                    let direction = match order {
                        SortOrder::Ascending => 1,
                        SortOrder::Descending => -1,
                    };
                    (field, Value::from(direction))
                })
                .collect(),
        )
    }
}

impl SortSpec {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self(vec![(field.into(), SortOrder::Ascending)])
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self(vec![(field.into(), SortOrder::Descending)])
    }

    pub fn then(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.0.push((field.into(), order));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Step action - the tagged part of a Step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepKind {
    /// Plain filtered read of one collection
    Fetch,
    /// Relational join into `collection`
    Hop {
        #[serde(default)]
        hop_path: Option<HopPath>,
    },
    /// Aggregation pipeline over `collection`
    Aggregate {
        #[serde(default)]
        pipeline: Option<Vec<Value>>,
    },
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Hop { .. } => "hop",
            Self::Aggregate { .. } => "aggregate",
        }
    }
}

/// A single step in the retrieval plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique identifier for this step
    pub id: StepId,
    /// Target collection
    pub collection: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub filter: Filter,
    #[serde(default)]
    pub sort: Option<SortSpec>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// IDs of steps this step depends on
    #[serde(default)]
    pub depends_on: Vec<StepId>,
}

impl Step {
    fn with_kind(id: impl Into<StepId>, collection: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            kind,
            filter: Filter::default(),
            sort: None,
            limit: None,
            depends_on: Vec::new(),
        }
    }

    /// Create a fetch step
    pub fn fetch(id: impl Into<StepId>, collection: impl Into<String>) -> Self {
        Self::with_kind(id, collection, StepKind::Fetch)
    }

    /// Create a hop step whose path must be inferred
    pub fn hop(id: impl Into<StepId>, collection: impl Into<String>) -> Self {
        Self::with_kind(id, collection, StepKind::Hop { hop_path: None })
    }

    /// Create an aggregate step
    pub fn aggregate(
        id: impl Into<StepId>,
        collection: impl Into<String>,
        pipeline: Option<Vec<Value>>,
    ) -> Self {
        Self::with_kind(id, collection, StepKind::Aggregate { pipeline })
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<StepId>) -> Self {
        self.depends_on = deps;
        self
    }

    /// Attach an explicit hop path. No effect on non-hop steps.
    pub fn with_hop_path(mut self, path: HopPath) -> Self {
        if let StepKind::Hop { hop_path } = &mut self.kind {
            *hop_path = Some(path);
        }
        self
    }

    pub fn is_fetch(&self) -> bool {
        matches!(self.kind, StepKind::Fetch)
    }

    pub fn is_hop(&self) -> bool {
        matches!(self.kind, StepKind::Hop { .. })
    }

    pub fn hop_path(&self) -> Option<&HopPath> {
        match &self.kind {
            StepKind::Hop { hop_path } => hop_path.as_ref(),
            _ => None,
        }
    }

    /// Pipeline of an aggregate step, if one was provided.
    pub fn pipeline(&self) -> Option<&[Value]> {
        match &self.kind {
            StepKind::Aggregate {
                pipeline: Some(pipeline),
            } => Some(pipeline.as_slice()),
            _ => None,
        }
    }

    /// Aggregate step without a usable pipeline.
    pub fn is_malformed_aggregate(&self) -> bool {
        match &self.kind {
            StepKind::Aggregate { pipeline } => {
                pipeline.as_ref().map(|p| p.is_empty()).unwrap_or(true)
            }
            _ => false,
        }
    }

    /// A fetch with no declared dependencies and no step references in its filter.
    pub fn is_independent(&self) -> bool {
        self.depends_on.is_empty() && !self.filter.has_refs()
    }
}
