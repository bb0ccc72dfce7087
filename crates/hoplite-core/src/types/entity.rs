//! EntityIdentifierCache - cross-turn memory of entities the user has seen

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::dataset::RetrievedData;
use super::schema::EntitySchema;

/// Append-only, insertion-ordered set of identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct IdList {
    ids: Vec<String>,
    index: HashSet<String>,
}

impl From<Vec<String>> for IdList {
    fn from(values: Vec<String>) -> Self {
        let mut list = Self::default();
        list.extend(values);
        list
    }
}

impl From<IdList> for Vec<String> {
    fn from(list: IdList) -> Self {
        list.ids
    }
}

impl IdList {
    /// Insert `id`, returning false when it was already present.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.index.contains(&id) {
            return false;
        }
        self.index.insert(id.clone());
        self.ids.push(id);
        true
    }

    pub fn extend<I, S>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added = 0;
        for id in ids {
            if self.insert(id) {
                added += 1;
            }
        }
        added
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Organizations, people and profile models seen during a session.
///
/// Grows monotonically within a run; persisted by the session store between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EntityIdentifierCache {
    #[serde(default)]
    pub organizations: IdList,
    #[serde(default)]
    pub people: IdList,
    #[serde(default)]
    pub models: IdList,
}

impl EntityIdentifierCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan every data set for identifiers and cross-references.
    /// Returns the number of newly seen identifiers.
    pub fn refresh_from(&mut self, data: &RetrievedData, schema: &EntitySchema) -> usize {
        let mut added = 0;
        if let Some(organizations) = data.get(&schema.organizations) {
            added += self.organizations.extend(organizations.ids(&schema.id_field));
            added += self.models.extend(organizations.ids(&schema.model_ref_field));
        }
        if let Some(people) = data.get(&schema.people) {
            added += self.people.extend(people.ids(&schema.id_field));
        }
        added
    }

    /// Union with another cache, keeping this cache's order first.
    pub fn absorb(&mut self, other: &EntityIdentifierCache) {
        self.organizations
            .extend(other.organizations.as_slice().iter().cloned());
        self.people.extend(other.people.as_slice().iter().cloned());
        self.models.extend(other.models.as_slice().iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.organizations.is_empty() && self.people.is_empty() && self.models.is_empty()
    }
}
