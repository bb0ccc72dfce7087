//! Collection and field names of the business dataset

use serde::{Deserialize, Serialize};

use super::filter::EntityKind;

/// Names the retrieval core needs to know about the dataset layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub organizations: String,
    pub people: String,
    /// Persona-intelligence collection keyed by person
    pub persona: String,
    pub id_field: String,
    /// Field on non-organization records pointing at an organization
    pub organization_ref_field: String,
    /// Field on non-person records pointing at a person
    pub person_ref_field: String,
    /// Secondary model identifier embedded in organization records
    pub model_ref_field: String,
}

impl Default for EntitySchema {
    fn default() -> Self {
        Self {
            organizations: "organizations".to_string(),
            people: "people".to_string(),
            persona: "persona_intelligence".to_string(),
            id_field: "_id".to_string(),
            organization_ref_field: "organizationId".to_string(),
            person_ref_field: "personId".to_string(),
            model_ref_field: "profileModelId".to_string(),
        }
    }
}

impl EntitySchema {
    /// Field holding identifiers of `entity` in documents of `collection`.
    pub fn identifier_field(&self, entity: EntityKind, collection: &str) -> &str {
        match entity {
            EntityKind::Record => &self.id_field,
            EntityKind::Organization if collection == self.organizations => &self.id_field,
            EntityKind::Organization => &self.organization_ref_field,
            EntityKind::Person if collection == self.people => &self.id_field,
            EntityKind::Person => &self.person_ref_field,
            EntityKind::Model => &self.model_ref_field,
        }
    }

    /// Collection whose own identifiers are entities of `entity`.
    pub fn home_collection(&self, entity: EntityKind) -> Option<&str> {
        match entity {
            EntityKind::Organization | EntityKind::Model => Some(&self.organizations),
            EntityKind::Person => Some(&self.people),
            EntityKind::Record => None,
        }
    }

    /// Fields scoped to an organization: the reference field itself or any
    /// nested path under `organization.`.
    pub fn is_organization_scoped(&self, path: &str) -> bool {
        path == self.organization_ref_field
            || path.starts_with("organization.")
            || path.starts_with(&format!("{}.", self.organization_ref_field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_field_depends_on_collection() {
        let schema = EntitySchema::default();
        assert_eq!(
            schema.identifier_field(EntityKind::Organization, "organizations"),
            "_id"
        );
        assert_eq!(
            schema.identifier_field(EntityKind::Organization, "people"),
            "organizationId"
        );
        assert_eq!(schema.identifier_field(EntityKind::Person, "people"), "_id");
        assert_eq!(
            schema.identifier_field(EntityKind::Model, "organizations"),
            "profileModelId"
        );
    }
}
