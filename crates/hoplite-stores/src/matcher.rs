//! Filter evaluation over in-memory documents.

use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::cmp::Ordering;

use hoplite_core::store::StoreError;
use hoplite_core::types::{
    canonical_id, values_at_path, Condition, Document, Filter, Operand, SortOrder, SortSpec,
};

/// A filter with literals extracted and patterns compiled.
#[derive(Debug)]
pub(crate) enum Matcher {
    All(Vec<Matcher>),
    Any(Vec<Matcher>),
    Field { path: String, test: Test },
}

#[derive(Debug)]
pub(crate) enum Test {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Cmp(Ordering, bool, Value),
    Regex(Regex),
    All(Vec<Value>),
    Exists(bool),
}

fn literal(operand: &Operand) -> Result<Value, StoreError> {
    operand.as_literal().cloned().ok_or_else(|| {
        StoreError::InvalidQuery("filter still carries a step reference".to_string())
    })
}

fn literals(operands: &[Operand]) -> Result<Vec<Value>, StoreError> {
    operands.iter().map(literal).collect()
}

impl Matcher {
    pub fn compile(filter: &Filter) -> Result<Self, StoreError> {
        Ok(match filter {
            Filter::And(children) => Self::All(
                children
                    .iter()
                    .map(Self::compile)
                    .collect::<Result<_, _>>()?,
            ),
            Filter::Or(children) => Self::Any(
                children
                    .iter()
                    .map(Self::compile)
                    .collect::<Result<_, _>>()?,
            ),
            Filter::Field { path, condition } => Self::Field {
                path: path.clone(),
                test: compile_condition(condition)?,
            },
        })
    }

    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Self::All(children) => children.iter().all(|c| c.matches(document)),
            Self::Any(children) => children.iter().any(|c| c.matches(document)),
            Self::Field { path, test } => test.matches(&candidates(document, path)),
        }
    }
}

fn compile_condition(condition: &Condition) -> Result<Test, StoreError> {
    Ok(match condition {
        Condition::Eq(o) => Test::Eq(literal(o)?),
        Condition::Ne(o) => Test::Ne(literal(o)?),
        Condition::In(items) => Test::In(literals(items)?),
        Condition::Nin(items) => Test::Nin(literals(items)?),
        Condition::Gt(o) => Test::Cmp(Ordering::Greater, false, literal(o)?),
        Condition::Gte(o) => Test::Cmp(Ordering::Greater, true, literal(o)?),
        Condition::Lt(o) => Test::Cmp(Ordering::Less, false, literal(o)?),
        Condition::Lte(o) => Test::Cmp(Ordering::Less, true, literal(o)?),
        Condition::Regex { pattern, options } => {
            let options = options.as_deref().unwrap_or("");
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(options.contains('i'))
                .multi_line(options.contains('m'))
                .dot_matches_new_line(options.contains('s'))
                .ignore_whitespace(options.contains('x'))
                .build()
                .map_err(|e| StoreError::InvalidQuery(format!("bad pattern '{}': {}", pattern, e)))?;
            Test::Regex(regex)
        }
        Condition::All(items) => Test::All(literals(items)?),
        Condition::Exists(flag) => Test::Exists(*flag),
    })
}

/// Values a condition is tested against: each value at the path, plus the
/// elements of array values.
fn candidates<'a>(document: &'a Document, path: &str) -> Vec<&'a Value> {
    let mut out = Vec::new();
    for value in values_at_path(document, path) {
        if let Value::Array(items) = value {
            out.extend(items.iter());
        }
        out.push(value);
    }
    out
}

/// Equality with identifiers compared in canonical string form.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Null, Value::Null) => true,
        (Value::Array(_), _) | (_, Value::Array(_)) => a == b,
        _ => match (canonical_id(a), canonical_id(b)) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
    }
}

impl Test {
    fn matches(&self, values: &[&Value]) -> bool {
        let any_eq = |target: &Value| {
            if target.is_null() && values.is_empty() {
                return true;
            }
            values.iter().any(|v| values_equal(v, target))
        };
        match self {
            Self::Eq(target) => any_eq(target),
            Self::Ne(target) => !any_eq(target),
            Self::In(targets) => targets.iter().any(any_eq),
            Self::Nin(targets) => !targets.iter().any(any_eq),
            Self::Cmp(direction, inclusive, target) => values.iter().any(|v| {
                match compare_scalars(v, target) {
                    Some(Ordering::Equal) => *inclusive,
                    Some(ordering) => ordering == *direction,
                    None => false,
                }
            }),
            Self::Regex(regex) => values
                .iter()
                .any(|v| v.as_str().is_some_and(|s| regex.is_match(s))),
            Self::All(targets) => targets.iter().all(any_eq),
            Self::Exists(flag) => values.is_empty() != *flag,
        }
    }
}

/// Order of two scalars of the same kind; `None` across kinds.
fn compare_scalars(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

/// Total order used for sorting: missing < numbers < strings < objects < arrays < booleans.
pub(crate) fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Some(x), Some(y)) => compare_scalars(x, y).unwrap_or_else(|| x.to_string().cmp(&y.to_string())),
        _ => Ordering::Equal,
    }
}

pub(crate) fn sort_documents(documents: &mut [Document], sort: &SortSpec) {
    documents.sort_by(|a, b| {
        for (field, order) in &sort.0 {
            let left = values_at_path(a, field).into_iter().next();
            let right = values_at_path(b, field).into_iter().next();
            let ordering = compare_values(left, right);
            let ordering = match order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}
