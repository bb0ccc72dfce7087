//! Placeholder resolver
//!
//! Replaces [`StepOutputRef`] operands in a step's filter with identifiers
//! taken from data sets retrieved earlier in the run.
//!
//! Source data set for a reference, first match wins:
//! 1. the collection of the referenced step
//! 2. the collections of the step's declared dependencies
//! 3. the home collection of the referenced entity kind
//!
//! A clause whose reference finds no identifiers is removed from the filter
//! and reported; a literal token never reaches the data store.

use serde_json::Value;

use crate::error::PipelineError;
use crate::types::{
    EntitySchema, Filter, Plan, RefArity, RetrievedData, Step, StepId, StepOutputRef,
};

/// Resolved filter of one step.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub filter: Filter,
    /// References that found no identifiers; their clauses were dropped
    pub unresolved: Vec<StepOutputRef>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }

    pub fn errors(&self, step_id: &StepId) -> Vec<PipelineError> {
        self.unresolved
            .iter()
            .map(|reference| PipelineError::UnresolvedPlaceholder {
                step_id: step_id.clone(),
                reference: reference.token(),
            })
            .collect()
    }
}

pub struct PlaceholderResolver<'a> {
    schema: &'a EntitySchema,
}

impl<'a> PlaceholderResolver<'a> {
    pub fn new(schema: &'a EntitySchema) -> Self {
        Self { schema }
    }

    /// Resolve every reference in `step`'s filter against `data`.
    pub fn resolve(&self, step: &Step, plan: &Plan, data: &RetrievedData) -> Resolution {
        self.resolve_filter(&step.filter, &step.id, &step.depends_on, plan, data)
    }

    pub fn resolve_filter(
        &self,
        filter: &Filter,
        step_id: &StepId,
        depends_on: &[StepId],
        plan: &Plan,
        data: &RetrievedData,
    ) -> Resolution {
        if !filter.has_refs() {
            return Resolution {
                filter: filter.clone(),
                unresolved: Vec::new(),
            };
        }

        let mut lookup = |reference: &StepOutputRef| -> Option<Vec<Value>> {
            let ids = self.identifiers_for(reference, depends_on, plan, data)?;
            if reference.arity == RefArity::One && ids.len() > 1 {
                tracing::debug!(
                    step_id = %step_id,
                    reference = %reference,
                    available = ids.len(),
                    "single-value reference takes first identifier"
                );
            }
            Some(ids.into_iter().map(Value::String).collect())
        };
        let (resolved, unresolved) = filter.resolve_refs(&mut lookup);

        for reference in &unresolved {
            tracing::warn!(
                step_id = %step_id,
                reference = %reference,
                "no source data for reference, clause removed"
            );
        }
        Resolution {
            filter: resolved,
            unresolved,
        }
    }

    /// Identifiers `reference` stands for, from the first candidate data set
    /// that yields any.
    pub fn identifiers_for(
        &self,
        reference: &StepOutputRef,
        depends_on: &[StepId],
        plan: &Plan,
        data: &RetrievedData,
    ) -> Option<Vec<String>> {
        for collection in self.candidate_collections(reference, depends_on, plan) {
            let Some(set) = data.get(&collection) else {
                continue;
            };
            let field = self.schema.identifier_field(reference.entity, &collection);
            let ids = set.ids(field);
            if !ids.is_empty() {
                tracing::debug!(
                    reference = %reference,
                    collection = %collection,
                    field = %field,
                    count = ids.len(),
                    "reference resolved"
                );
                return Some(ids);
            }
        }
        None
    }

    fn candidate_collections(
        &self,
        reference: &StepOutputRef,
        depends_on: &[StepId],
        plan: &Plan,
    ) -> Vec<String> {
        let mut candidates: Vec<String> = Vec::new();
        let mut push = |collection: &str| {
            if !candidates.iter().any(|c| c == collection) {
                candidates.push(collection.to_string());
            }
        };
        if let Some(step) = plan.get_step(&reference.step_id) {
            push(&step.collection);
        }
        for dependency in depends_on {
            if let Some(step) = plan.get_step(dependency) {
                push(&step.collection);
            }
        }
        if let Some(home) = self.schema.home_collection(reference.entity) {
            push(home);
        }
        candidates
    }
}
