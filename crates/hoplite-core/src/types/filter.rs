//! Filter predicate tree
//!
//! Filters arrive from the planner as Mongo-style JSON and are decoded into a
//! typed tree. Cross-step data dependencies are decoded once, at this point,
//! into [`StepOutputRef`] operands; nothing downstream matches on strings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

use super::step::StepId;

const REF_TOKEN_PREFIX: &str = "FROM_STEP_";
const REF_TOKEN_MANY_SUFFIX: &str = "_IDS";
const REF_TOKEN_ONE_SUFFIX: &str = "_ID";

/// Filter decoding errors
#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("operator '{op}' on '{path}' expects {expected}")]
    InvalidOperand {
        op: String,
        path: String,
        expected: &'static str,
    },

    #[error("filter must be an object, got: {0}")]
    NotAnObject(String),
}

/// Entity kind a step reference extracts identifiers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Organization,
    Person,
    Model,
    /// Identifiers of whatever the referenced step returned
    Record,
}

impl EntityKind {
    fn from_token(token: &str) -> Self {
        match token {
            "ORGANIZATION" | "ORGANIZATIONS" | "ORG" | "ORGS" | "COMPANY" | "COMPANIES" => {
                Self::Organization
            }
            "PERSON" | "PEOPLE" | "CONTACT" | "CONTACTS" => Self::Person,
            "MODEL" | "PROFILE_MODEL" | "MODELS" => Self::Model,
            _ => Self::Record,
        }
    }

    fn token(&self) -> &'static str {
        match self {
            Self::Organization => "ORGANIZATION",
            Self::Person => "PERSON",
            Self::Model => "MODEL",
            Self::Record => "RECORD",
        }
    }
}

/// Whether a reference stands for a list of identifiers or a single one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefArity {
    Many,
    One,
}

/// Typed reference to identifiers produced by an earlier step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepOutputRef {
    pub step_id: StepId,
    pub entity: EntityKind,
    pub arity: RefArity,
}

impl StepOutputRef {
    pub fn many(step_id: impl Into<StepId>, entity: EntityKind) -> Self {
        Self {
            step_id: step_id.into(),
            entity,
            arity: RefArity::Many,
        }
    }

    pub fn one(step_id: impl Into<StepId>, entity: EntityKind) -> Self {
        Self {
            step_id: step_id.into(),
            entity,
            arity: RefArity::One,
        }
    }

    /// Parse a planner token such as `FROM_STEP_0_ORGANIZATION_IDS`.
    pub fn parse_token(token: &str) -> Option<Self> {
        let body = token.strip_prefix(REF_TOKEN_PREFIX)?;
        let (body, arity) = if let Some(rest) = body.strip_suffix(REF_TOKEN_MANY_SUFFIX) {
            (rest, RefArity::Many)
        } else if let Some(rest) = body.strip_suffix(REF_TOKEN_ONE_SUFFIX) {
            (rest, RefArity::One)
        } else {
            return None;
        };
        let (step, entity) = body.rsplit_once('_')?;
        if step.is_empty() || entity.is_empty() {
            return None;
        }
        // "0_PROFILE_MODEL" splits as ("0_PROFILE", "MODEL")
        let step = step.strip_suffix("_PROFILE").unwrap_or(step);
        Some(Self {
            step_id: StepId::from(step),
            entity: EntityKind::from_token(&entity.to_ascii_uppercase()),
            arity,
        })
    }

    /// Planner token form of this reference.
    pub fn token(&self) -> String {
        let suffix = match self.arity {
            RefArity::Many => REF_TOKEN_MANY_SUFFIX,
            RefArity::One => REF_TOKEN_ONE_SUFFIX,
        };
        format!(
            "{}{}_{}{}",
            REF_TOKEN_PREFIX,
            self.step_id,
            self.entity.token(),
            suffix
        )
    }
}

impl fmt::Display for StepOutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

/// Leaf value of a condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Ref(StepOutputRef),
}

impl Operand {
    fn decode(value: &Value) -> Self {
        match value {
            Value::String(s) => match StepOutputRef::parse_token(s) {
                Some(reference) => Self::Ref(reference),
                None => Self::Literal(value.clone()),
            },
            _ => Self::Literal(value.clone()),
        }
    }

    fn encode(&self) -> Value {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Ref(reference) => Value::String(reference.token()),
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Self::Literal(value) => Some(value),
            Self::Ref(_) => None,
        }
    }
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

impl From<StepOutputRef> for Operand {
    fn from(reference: StepOutputRef) -> Self {
        Self::Ref(reference)
    }
}

/// Constraint on a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Operand),
    Ne(Operand),
    In(Vec<Operand>),
    Nin(Vec<Operand>),
    Gt(Operand),
    Gte(Operand),
    Lt(Operand),
    Lte(Operand),
    Regex {
        pattern: String,
        options: Option<String>,
    },
    /// Array field contains every listed value
    All(Vec<Operand>),
    Exists(bool),
}

impl Condition {
    fn operands(&self) -> Vec<&Operand> {
        match self {
            Self::Eq(o) | Self::Ne(o) | Self::Gt(o) | Self::Gte(o) | Self::Lt(o) | Self::Lte(o) => {
                vec![o]
            }
            Self::In(list) | Self::Nin(list) | Self::All(list) => list.iter().collect(),
            Self::Regex { .. } | Self::Exists(_) => Vec::new(),
        }
    }

    fn has_refs(&self) -> bool {
        self.operands()
            .into_iter()
            .any(|o| matches!(o, Operand::Ref(_)))
    }

    fn encode(&self) -> Value {
        let list = |items: &[Operand]| Value::Array(items.iter().map(Operand::encode).collect());
        let op = |name: &str, value: Value| {
            let mut map = Map::new();
            map.insert(name.to_string(), value);
            Value::Object(map)
        };
        match self {
            Self::Eq(o) => match o {
                // Object literals would read back as operator maps.
                Operand::Literal(Value::Object(_)) => op("$eq", o.encode()),
                _ => o.encode(),
            },
            Self::Ne(o) => op("$ne", o.encode()),
            Self::In(items) => op("$in", list(items)),
            Self::Nin(items) => op("$nin", list(items)),
            Self::Gt(o) => op("$gt", o.encode()),
            Self::Gte(o) => op("$gte", o.encode()),
            Self::Lt(o) => op("$lt", o.encode()),
            Self::Lte(o) => op("$lte", o.encode()),
            Self::Regex { pattern, options } => {
                let mut map = Map::new();
                map.insert("$regex".to_string(), Value::String(pattern.clone()));
                if let Some(options) = options {
                    map.insert("$options".to_string(), Value::String(options.clone()));
                }
                Value::Object(map)
            }
            Self::All(items) => op("$all", list(items)),
            Self::Exists(flag) => op("$exists", Value::Bool(*flag)),
        }
    }
}

/// Filter predicate tree.
///
/// The empty conjunction matches every document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Field { path: String, condition: Condition },
}

impl Default for Filter {
    fn default() -> Self {
        Self::And(Vec::new())
    }
}

impl Filter {
    pub fn field(path: impl Into<String>, condition: Condition) -> Self {
        Self::Field {
            path: path.into(),
            condition,
        }
    }

    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Condition::Eq(Operand::Literal(value.into())))
    }

    pub fn is_in<I, V>(path: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::field(
            path,
            Condition::In(
                values
                    .into_iter()
                    .map(|v| Operand::Literal(v.into()))
                    .collect(),
            ),
        )
    }

    pub fn all(filters: Vec<Filter>) -> Self {
        Self::And(filters)
    }

    pub fn any(filters: Vec<Filter>) -> Self {
        Self::Or(filters)
    }

    /// True when the filter places no constraint at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::And(children) => children.iter().all(Filter::is_empty),
            Self::Or(children) => children.is_empty(),
            Self::Field { .. } => false,
        }
    }

    /// Conjunction of `self` and `other`, flattening nested conjunctions.
    pub fn and(self, other: Filter) -> Filter {
        let mut clauses = Vec::new();
        for part in [self, other] {
            match part {
                Self::And(children) => clauses.extend(children.into_iter().filter(|c| !c.is_empty())),
                other if other.is_empty() => {}
                other => clauses.push(other),
            }
        }
        if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            Self::And(clauses)
        }
    }

    pub fn has_refs(&self) -> bool {
        !self.refs().is_empty()
    }

    /// Every step reference in the tree, in document order.
    pub fn refs(&self) -> Vec<&StepOutputRef> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a StepOutputRef>) {
        match self {
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_refs(out);
                }
            }
            Self::Field { condition, .. } => {
                for operand in condition.operands() {
                    if let Operand::Ref(reference) = operand {
                        out.push(reference);
                    }
                }
            }
        }
    }

    /// True if any field clause satisfies `predicate` on its path.
    pub fn references_field(&self, predicate: &dyn Fn(&str) -> bool) -> bool {
        match self {
            Self::And(children) | Self::Or(children) => {
                children.iter().any(|c| c.references_field(predicate))
            }
            Self::Field { path, .. } => predicate(path),
        }
    }

    /// Step references held by clauses on `field`.
    pub fn refs_on(&self, field: &str) -> Vec<&StepOutputRef> {
        self.refs_where(&|path| path == field)
    }

    /// Copy of the filter without the reference-bearing clauses on `field`.
    /// Literal constraints on `field` are kept.
    pub fn without_refs_on(&self, field: &str) -> Filter {
        self.prune(&|path, condition| path != field || !condition.has_refs())
    }

    fn refs_where(&self, predicate: &dyn Fn(&str) -> bool) -> Vec<&StepOutputRef> {
        match self {
            Self::And(children) | Self::Or(children) => children
                .iter()
                .flat_map(|c| c.refs_where(predicate))
                .collect(),
            Self::Field { path, condition } if predicate(path) => condition
                .operands()
                .into_iter()
                .filter_map(|operand| match operand {
                    Operand::Ref(reference) => Some(reference),
                    Operand::Literal(_) => None,
                })
                .collect(),
            Self::Field { .. } => Vec::new(),
        }
    }

    /// Rewrite step references through `lookup`.
    ///
    /// `lookup` returns the identifiers a reference stands for, or `None` when
    /// nothing is available. Clauses whose references cannot be resolved are
    /// dropped and reported; the returned filter never contains references.
    pub fn resolve_refs<F>(&self, lookup: &mut F) -> (Filter, Vec<StepOutputRef>)
    where
        F: FnMut(&StepOutputRef) -> Option<Vec<Value>>,
    {
        let mut unresolved = Vec::new();
        let resolved = self
            .rewrite(lookup, &mut unresolved)
            .unwrap_or_default();
        (resolved, unresolved)
    }

    fn rewrite<F>(&self, lookup: &mut F, unresolved: &mut Vec<StepOutputRef>) -> Option<Filter>
    where
        F: FnMut(&StepOutputRef) -> Option<Vec<Value>>,
    {
        match self {
            Self::And(children) => {
                let kept: Vec<_> = children
                    .iter()
                    .filter_map(|c| c.rewrite(lookup, unresolved))
                    .collect();
                Some(Self::And(kept))
            }
            Self::Or(children) => {
                let kept: Vec<_> = children
                    .iter()
                    .filter_map(|c| c.rewrite(lookup, unresolved))
                    .collect();
                if kept.is_empty() {
                    None
                } else {
                    Some(Self::Or(kept))
                }
            }
            Self::Field { path, condition } => {
                let condition = rewrite_condition(condition, lookup, unresolved)?;
                Some(Self::Field {
                    path: path.clone(),
                    condition,
                })
            }
        }
    }

    fn prune(&self, keep: &dyn Fn(&str, &Condition) -> bool) -> Filter {
        match self {
            Self::And(children) => Self::And(
                children
                    .iter()
                    .map(|c| c.prune(keep))
                    .filter(|c| !matches!(c, Self::And(inner) if inner.is_empty()))
                    .collect(),
            ),
            Self::Or(children) => {
                let kept: Vec<_> = children
                    .iter()
                    .map(|c| c.prune(keep))
                    .filter(|c| !matches!(c, Self::And(inner) if inner.is_empty()))
                    .collect();
                if kept.is_empty() {
                    Self::default()
                } else {
                    Self::Or(kept)
                }
            }
            Self::Field { path, condition } => {
                if keep(path, condition) {
                    self.clone()
                } else {
                    Self::default()
                }
            }
        }
    }

    /// Mongo-style JSON form of the filter.
    pub fn to_json(&self) -> Value {
        Value::from(self.clone())
    }
}

fn rewrite_condition<F>(
    condition: &Condition,
    lookup: &mut F,
    unresolved: &mut Vec<StepOutputRef>,
) -> Option<Condition>
where
    F: FnMut(&StepOutputRef) -> Option<Vec<Value>>,
{
    let mut resolve = |reference: &StepOutputRef| -> Option<Vec<Value>> {
        match lookup(reference) {
            Some(ids) if !ids.is_empty() => Some(ids),
            _ => {
                unresolved.push(reference.clone());
                None
            }
        }
    };

    let expand = |items: &[Operand],
                  resolve: &mut dyn FnMut(&StepOutputRef) -> Option<Vec<Value>>|
     -> Option<Vec<Operand>> {
        let mut out: Vec<Operand> = Vec::with_capacity(items.len());
        let mut seen = HashSet::new();
        for item in items {
            let values = match item {
                Operand::Literal(value) => vec![value.clone()],
                Operand::Ref(reference) => resolve(reference)?,
            };
            for value in values {
                if seen.insert(value.to_string()) {
                    out.push(Operand::Literal(value));
                }
            }
        }
        Some(out)
    };

    let single = |operand: &Operand,
                  resolve: &mut dyn FnMut(&StepOutputRef) -> Option<Vec<Value>>|
     -> Option<Operand> {
        match operand {
            Operand::Literal(_) => Some(operand.clone()),
            Operand::Ref(reference) => {
                let ids = resolve(reference)?;
                ids.into_iter().next().map(Operand::Literal)
            }
        }
    };

    match condition {
        Condition::Eq(Operand::Ref(reference)) if reference.arity == RefArity::Many => {
            let ids = resolve(reference)?;
            Some(Condition::In(ids.into_iter().map(Operand::Literal).collect()))
        }
        Condition::Ne(Operand::Ref(reference)) if reference.arity == RefArity::Many => {
            let ids = resolve(reference)?;
            Some(Condition::Nin(ids.into_iter().map(Operand::Literal).collect()))
        }
        Condition::Eq(o) => single(o, &mut resolve).map(Condition::Eq),
        Condition::Ne(o) => single(o, &mut resolve).map(Condition::Ne),
        Condition::Gt(o) => single(o, &mut resolve).map(Condition::Gt),
        Condition::Gte(o) => single(o, &mut resolve).map(Condition::Gte),
        Condition::Lt(o) => single(o, &mut resolve).map(Condition::Lt),
        Condition::Lte(o) => single(o, &mut resolve).map(Condition::Lte),
        Condition::In(items) => expand(items, &mut resolve).map(Condition::In),
        Condition::Nin(items) => expand(items, &mut resolve).map(Condition::Nin),
        Condition::All(items) => expand(items, &mut resolve).map(Condition::All),
        Condition::Regex { .. } | Condition::Exists(_) => Some(condition.clone()),
    }
}

impl TryFrom<Value> for Filter {
    type Error = FilterError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        decode_filter(&value)
    }
}

impl From<Filter> for Value {
    fn from(filter: Filter) -> Self {
        encode_filter(&filter)
    }
}

fn decode_filter(value: &Value) -> Result<Filter, FilterError> {
    let map = match value {
        Value::Null => return Ok(Filter::default()),
        Value::Object(map) => map,
        other => return Err(FilterError::NotAnObject(other.to_string())),
    };

    let mut clauses = Vec::new();
    for (key, inner) in map {
        match key.as_str() {
            "$and" | "$or" => {
                let Value::Array(items) = inner else {
                    return Err(FilterError::InvalidOperand {
                        op: key.clone(),
                        path: String::new(),
                        expected: "an array of filters",
                    });
                };
                let children = items
                    .iter()
                    .map(decode_filter)
                    .collect::<Result<Vec<_>, _>>()?;
                clauses.push(if key == "$and" {
                    Filter::And(children)
                } else {
                    Filter::Or(children)
                });
            }
            op if op.starts_with('$') => {
                return Err(FilterError::UnsupportedOperator(op.to_string()));
            }
            path => clauses.extend(decode_field(path, inner)?),
        }
    }

    Ok(if clauses.len() == 1 {
        clauses.remove(0)
    } else {
        Filter::And(clauses)
    })
}

fn is_operator_map(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn decode_field(path: &str, value: &Value) -> Result<Vec<Filter>, FilterError> {
    if !is_operator_map(value) {
        return Ok(vec![Filter::field(path, Condition::Eq(Operand::decode(value)))]);
    }

    let Value::Object(ops) = value else {
        return Ok(Vec::new());
    };
    let list = |v: &Value| -> Vec<Operand> {
        match v {
            Value::Array(items) => items.iter().map(Operand::decode).collect(),
            single => vec![Operand::decode(single)],
        }
    };

    let mut out = Vec::with_capacity(ops.len());
    for (op, operand) in ops {
        let condition = match op.as_str() {
            "$eq" => Condition::Eq(Operand::decode(operand)),
            "$ne" => Condition::Ne(Operand::decode(operand)),
            "$in" => Condition::In(list(operand)),
            "$nin" => Condition::Nin(list(operand)),
            "$all" => Condition::All(list(operand)),
            "$gt" => Condition::Gt(Operand::decode(operand)),
            "$gte" => Condition::Gte(Operand::decode(operand)),
            "$lt" => Condition::Lt(Operand::decode(operand)),
            "$lte" => Condition::Lte(Operand::decode(operand)),
            "$exists" => Condition::Exists(match operand {
                Value::Bool(flag) => *flag,
                Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
                _ => {
                    return Err(FilterError::InvalidOperand {
                        op: op.clone(),
                        path: path.to_string(),
                        expected: "a boolean",
                    })
                }
            }),
            "$regex" => {
                let Value::String(pattern) = operand else {
                    return Err(FilterError::InvalidOperand {
                        op: op.clone(),
                        path: path.to_string(),
                        expected: "a string pattern",
                    });
                };
                Condition::Regex {
                    pattern: pattern.clone(),
                    options: ops
                        .get("$options")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                }
            }
            "$options" => continue,
            other => return Err(FilterError::UnsupportedOperator(other.to_string())),
        };
        out.push(Filter::field(path, condition));
    }
    Ok(out)
}

fn encode_filter(filter: &Filter) -> Value {
    match filter {
        Filter::Field { path, condition } => {
            let mut map = Map::new();
            map.insert(path.clone(), condition.encode());
            Value::Object(map)
        }
        Filter::Or(children) => {
            let mut map = Map::new();
            map.insert(
                "$or".to_string(),
                Value::Array(children.iter().map(encode_filter).collect()),
            );
            Value::Object(map)
        }
        Filter::And(children) => {
            let encoded: Vec<Value> = children
                .iter()
                .filter(|c| !c.is_empty())
                .map(encode_filter)
                .collect();
            let mut merged = Map::new();
            let mut disjoint = true;
            for value in &encoded {
                if let Value::Object(map) = value {
                    for (key, inner) in map {
                        if merged.contains_key(key) {
                            disjoint = false;
                        }
                        merged.insert(key.clone(), inner.clone());
                    }
                }
            }
            if disjoint {
                Value::Object(merged)
            } else {
                let mut map = Map::new();
                map.insert("$and".to_string(), Value::Array(encoded));
                Value::Object(map)
            }
        }
    }
}
