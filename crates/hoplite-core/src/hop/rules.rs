//! Hop path inference rules
//!
//! Ordered table of `(predicate on available state) -> HopPath` rules. The
//! first rule whose predicate holds supplies the path.

use crate::types::{Cardinality, EntitySchema, Filter, HopPath, RetrievedData};

/// What a rule may look at.
pub struct HopContext<'a> {
    /// Collection the hop step targets
    pub target: &'a str,
    pub filter: &'a Filter,
    pub data: &'a RetrievedData,
    pub schema: &'a EntitySchema,
}

/// One inference rule.
#[derive(Clone, Copy)]
pub struct HopRule {
    pub name: &'static str,
    pub when: fn(&HopContext<'_>) -> bool,
    pub path: fn(&HopContext<'_>) -> HopPath,
}

impl std::fmt::Debug for HopRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HopRule").field("name", &self.name).finish()
    }
}

/// First matching rule and the path it produces.
pub fn infer_path(rules: &[HopRule], ctx: &HopContext<'_>) -> Option<(&'static str, HopPath)> {
    rules
        .iter()
        .find(|rule| (rule.when)(ctx))
        .map(|rule| (rule.name, (rule.path)(ctx)))
}

fn organization_to_target(ctx: &HopContext<'_>) -> HopPath {
    HopPath::new(
        &ctx.schema.organizations,
        ctx.target,
        &ctx.schema.organization_ref_field,
        Cardinality::OneToMany,
    )
}

pub fn default_rules() -> Vec<HopRule> {
    vec![
        HopRule {
            name: "organization_scoped_filter",
            when: |ctx| {
                ctx.target != ctx.schema.organizations
                    && ctx
                        .filter
                        .references_field(&|path| ctx.schema.is_organization_scoped(path))
            },
            path: organization_to_target,
        },
        HopRule {
            name: "people_from_organizations",
            when: |ctx| ctx.target == ctx.schema.people,
            path: organization_to_target,
        },
        HopRule {
            name: "organizations_from_people",
            when: |ctx| {
                ctx.target == ctx.schema.organizations && ctx.data.has_documents(&ctx.schema.people)
            },
            path: |ctx| {
                HopPath::new(
                    &ctx.schema.people,
                    &ctx.schema.organizations,
                    &ctx.schema.organization_ref_field,
                    Cardinality::ManyToOne,
                )
            },
        },
        HopRule {
            name: "persona_from_people",
            when: |ctx| {
                ctx.target == ctx.schema.persona && ctx.data.has_documents(&ctx.schema.people)
            },
            path: |ctx| {
                HopPath::new(
                    &ctx.schema.people,
                    &ctx.schema.persona,
                    &ctx.schema.person_ref_field,
                    Cardinality::OneToMany,
                )
            },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RetrievalMethod, RetrievedDataSet};
    use serde_json::{json, Value};

    fn with_people() -> RetrievedData {
        let mut data = RetrievedData::new();
        let mut set = RetrievedDataSet::new("people", RetrievalMethod::Fetch, 1.0);
        set.merge_documents(crate::test_support::docs(json!([{"_id": "p1"}])), "_id");
        data.merge(set, "_id");
        data
    }

    fn infer(target: &str, filter: Value, data: &RetrievedData) -> Option<(&'static str, HopPath)> {
        let filter = Filter::try_from(filter).expect("filter");
        let schema = EntitySchema::default();
        let ctx = HopContext {
            target,
            filter: &filter,
            data,
            schema: &schema,
        };
        infer_path(&default_rules(), &ctx)
    }

    #[test]
    fn test_organization_scoped_filter_wins_first() {
        let (rule, path) = infer(
            "deals",
            json!({"organization.country": "US"}),
            &RetrievedData::new(),
        )
        .expect("path");
        assert_eq!(rule, "organization_scoped_filter");
        assert_eq!(path.from, "organizations");
        assert_eq!(path.to, "deals");
        assert_eq!(path.via, "organizationId");
        assert_eq!(path.cardinality, Cardinality::OneToMany);
    }

    #[test]
    fn test_people_default_to_organization_join() {
        let (rule, path) = infer("people", json!({}), &RetrievedData::new()).expect("path");
        assert_eq!(rule, "people_from_organizations");
        assert_eq!(path.from, "organizations");
    }

    #[test]
    fn test_reverse_join_needs_people_data() {
        assert!(infer("organizations", json!({}), &RetrievedData::new()).is_none());
        let (_, path) = infer("organizations", json!({}), &with_people()).expect("path");
        assert_eq!(path.from, "people");
        assert_eq!(path.cardinality, Cardinality::ManyToOne);
    }

    #[test]
    fn test_persona_join_via_person_id() {
        let (rule, path) = infer("persona_intelligence", json!({}), &with_people()).expect("path");
        assert_eq!(rule, "persona_from_people");
        assert_eq!(path.via, "personId");
    }

    #[test]
    fn test_unknown_target_has_no_path() {
        assert!(infer("invoices", json!({"amount": {"$gt": 5}}), &with_people()).is_none());
    }
}
