//! Aggregation pipeline subset evaluated in memory.
//!
//! Supported stages: `$match`, `$sort`, `$limit`, `$skip`, `$project`,
//! `$group`, `$count`, `$unwind`.

use serde_json::{Map, Number, Value};

use hoplite_core::store::StoreError;
use hoplite_core::types::{values_at_path, Document, Filter, SortSpec};

use crate::matcher::{compare_values, sort_documents, values_equal, Matcher};

fn invalid(message: impl Into<String>) -> StoreError {
    StoreError::InvalidQuery(message.into())
}

/// Run `pipeline` over `documents`.
pub(crate) fn run_pipeline(
    mut documents: Vec<Document>,
    pipeline: &[Value],
) -> Result<Vec<Document>, StoreError> {
    for stage in pipeline {
        let Some((name, spec)) = stage.as_object().and_then(single_entry) else {
            return Err(invalid(format!("pipeline stage must have one operator: {}", stage)));
        };
        documents = match name.as_str() {
            "$match" => {
                let filter = Filter::try_from(spec.clone()).map_err(|e| invalid(e.to_string()))?;
                let matcher = Matcher::compile(&filter)?;
                documents.into_iter().filter(|d| matcher.matches(d)).collect()
            }
            "$sort" => {
                let sort = SortSpec::try_from(spec.clone()).map_err(StoreError::InvalidQuery)?;
                sort_documents(&mut documents, &sort);
                documents
            }
            "$limit" => {
                let n = as_count(spec, "$limit")?;
                documents.truncate(n);
                documents
            }
            "$skip" => {
                let n = as_count(spec, "$skip")?;
                documents.into_iter().skip(n).collect()
            }
            "$project" => project(documents, spec)?,
            "$group" => group(documents, spec)?,
            "$count" => {
                let Some(field) = spec.as_str().filter(|s| !s.is_empty()) else {
                    return Err(invalid("$count expects a field name"));
                };
                let mut out = Map::new();
                out.insert(field.to_string(), Value::from(documents.len()));
                vec![out]
            }
            "$unwind" => unwind(documents, spec)?,
            other => return Err(invalid(format!("unsupported pipeline stage: {}", other))),
        };
    }
    Ok(documents)
}

fn single_entry(map: &Map<String, Value>) -> Option<(&String, &Value)> {
    if map.len() == 1 {
        map.iter().next()
    } else {
        None
    }
}

fn as_count(value: &Value, stage: &str) -> Result<usize, StoreError> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| invalid(format!("{} expects a non-negative integer", stage)))
}

/// `"$path"` reads a field; anything else is a literal.
fn eval(document: &Document, expression: &Value) -> Value {
    match expression {
        Value::String(s) if s.starts_with('$') => values_at_path(document, &s[1..])
            .into_iter()
            .next()
            .cloned()
            .unwrap_or(Value::Null),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), eval(document, v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn truthy(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(n) => Some(n.as_f64().is_some_and(|f| f != 0.0)),
        _ => None,
    }
}

fn project(documents: Vec<Document>, spec: &Value) -> Result<Vec<Document>, StoreError> {
    let Some(fields) = spec.as_object() else {
        return Err(invalid("$project expects an object"));
    };
    let drop_id = fields.get("_id").and_then(truthy) == Some(false);
    let exclusion = fields
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .all(|(_, v)| truthy(v) == Some(false))
        && !fields.is_empty();

    Ok(documents
        .into_iter()
        .map(|document| {
            if exclusion {
                let mut out = document;
                for (key, _) in fields.iter().filter(|(_, v)| truthy(v) == Some(false)) {
                    out.remove(key);
                }
                return out;
            }
            let mut out = Map::new();
            if !drop_id {
                if let Some(id) = document.get("_id") {
                    out.insert("_id".to_string(), id.clone());
                }
            }
            for (key, rule) in fields {
                if key == "_id" && truthy(rule).is_some() {
                    continue;
                }
                match truthy(rule) {
                    Some(true) => {
                        if let Some(value) = values_at_path(&document, key).into_iter().next() {
                            out.insert(key.clone(), value.clone());
                        }
                    }
                    Some(false) => {}
                    None => {
                        out.insert(key.clone(), eval(&document, rule));
                    }
                }
            }
            out
        })
        .collect())
}

#[derive(Debug)]
enum Accumulator {
    Sum(f64, bool),
    Avg(f64, usize),
    Min(Option<Value>),
    Max(Option<Value>),
    Push(Vec<Value>),
    AddToSet(Vec<Value>),
    First(Option<Value>),
}

impl Accumulator {
    fn new(op: &str) -> Result<Self, StoreError> {
        Ok(match op {
            "$sum" => Self::Sum(0.0, true),
            "$avg" => Self::Avg(0.0, 0),
            "$min" => Self::Min(None),
            "$max" => Self::Max(None),
            "$push" => Self::Push(Vec::new()),
            "$addToSet" => Self::AddToSet(Vec::new()),
            "$first" => Self::First(None),
            other => return Err(invalid(format!("unsupported accumulator: {}", other))),
        })
    }

    fn add(&mut self, value: Value) {
        match self {
            Self::Sum(total, integral) => {
                if let Some(n) = value.as_f64() {
                    *total += n;
                    *integral &= value.is_i64() || value.is_u64();
                }
            }
            Self::Avg(total, count) => {
                if let Some(n) = value.as_f64() {
                    *total += n;
                    *count += 1;
                }
            }
            Self::Min(current) => {
                if !value.is_null()
                    && current
                        .as_ref()
                        .map_or(true, |c| compare_values(Some(&value), Some(c)).is_lt())
                {
                    *current = Some(value);
                }
            }
            Self::Max(current) => {
                if !value.is_null()
                    && current
                        .as_ref()
                        .map_or(true, |c| compare_values(Some(&value), Some(c)).is_gt())
                {
                    *current = Some(value);
                }
            }
            Self::Push(items) => items.push(value),
            Self::AddToSet(items) => {
                if !items.iter().any(|v| values_equal(v, &value)) {
                    items.push(value);
                }
            }
            Self::First(first) => {
                if first.is_none() {
                    *first = Some(value);
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            Self::Sum(total, true) if total.fract() == 0.0 && total.abs() < i64::MAX as f64 => {
                Value::from(total as i64)
            }
            Self::Sum(total, _) => float(total),
            Self::Avg(_, 0) => Value::Null,
            Self::Avg(total, count) => float(total / count as f64),
            Self::Min(v) | Self::Max(v) | Self::First(v) => v.unwrap_or(Value::Null),
            Self::Push(items) | Self::AddToSet(items) => Value::Array(items),
        }
    }
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

struct GroupField {
    name: String,
    op: String,
    expression: Value,
}

fn group(documents: Vec<Document>, spec: &Value) -> Result<Vec<Document>, StoreError> {
    let Some(spec) = spec.as_object() else {
        return Err(invalid("$group expects an object"));
    };
    let Some(key_expression) = spec.get("_id") else {
        return Err(invalid("$group requires an _id"));
    };

    let mut fields = Vec::new();
    for (name, body) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
        let Some((op, expression)) = body.as_object().and_then(single_entry) else {
            return Err(invalid(format!("accumulator for '{}' must have one operator", name)));
        };
        Accumulator::new(op)?;
        fields.push(GroupField {
            name: name.clone(),
            op: op.clone(),
            expression: expression.clone(),
        });
    }

    let mut groups: Vec<(Value, Vec<Accumulator>)> = Vec::new();
    for document in &documents {
        let key = eval(document, key_expression);
        let index = match groups.iter().position(|(k, _)| k == &key) {
            Some(index) => index,
            None => {
                let accumulators = fields
                    .iter()
                    .map(|f| Accumulator::new(&f.op))
                    .collect::<Result<Vec<_>, _>>()?;
                groups.push((key, accumulators));
                groups.len() - 1
            }
        };
        for (field, accumulator) in fields.iter().zip(groups[index].1.iter_mut()) {
            accumulator.add(eval(document, &field.expression));
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, accumulators)| {
            let mut out = Map::new();
            out.insert("_id".to_string(), key);
            for (field, accumulator) in fields.iter().zip(accumulators) {
                out.insert(field.name.clone(), accumulator.finish());
            }
            out
        })
        .collect())
}

fn unwind(documents: Vec<Document>, spec: &Value) -> Result<Vec<Document>, StoreError> {
    let path = match spec {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map.get("path").and_then(Value::as_str).unwrap_or(""),
        _ => "",
    };
    let Some(field) = path.strip_prefix('$').filter(|f| !f.is_empty()) else {
        return Err(invalid("$unwind expects a \"$field\" path"));
    };
    if field.contains('.') {
        return Err(invalid("$unwind supports top-level fields only"));
    }

    let mut out = Vec::new();
    for document in documents {
        match document.get(field) {
            Some(Value::Array(items)) => {
                for item in items {
                    let mut copy = document.clone();
                    copy.insert(field.to_string(), item.clone());
                    out.push(copy);
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => out.push(document),
        }
    }
    Ok(out)
}
