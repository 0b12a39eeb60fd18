use crate::query::QueryPlan;

/// Sets limit and offset on the root query. A limit or offset of zero or less
/// counts as absent. `max_limit` caps the limit, including when none was
/// requested.
pub(crate) fn apply(
    mut plan: QueryPlan,
    limit: Option<i64>,
    offset: Option<i64>,
    max_limit: Option<i64>,
) -> QueryPlan {
    let positive = |value: Option<i64>| value.filter(|v| *v > 0);
    let limit = match (positive(limit), positive(max_limit)) {
        (Some(limit), Some(max)) => Some(limit.min(max)),
        (limit, max) => limit.or(max),
    };
    plan.set_limit(limit);
    plan.set_offset(positive(offset));
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EntitySchema;
    use std::sync::Arc;

    fn plan() -> QueryPlan {
        QueryPlan::new(Arc::new(EntitySchema::new("Person", "persons")))
    }

    #[test]
    fn non_positive_values_are_absent() {
        let paged = apply(plan(), Some(-3), Some(-1), None);
        assert_eq!(paged.limit(), None);
        assert_eq!(paged.offset(), None);

        let paged = apply(plan(), Some(0), Some(0), None);
        assert_eq!(paged.limit(), None);
        assert_eq!(paged.offset(), None);
        assert_eq!(
            paged.root_query().sql(),
            r#"select to_jsonb("persons") as doc from "persons""#
        );

        assert_eq!(apply(plan(), Some(0), None, Some(100)).limit(), Some(100));
    }

    #[test]
    fn max_limit_caps() {
        assert_eq!(apply(plan(), Some(500), None, Some(100)).limit(), Some(100));
        assert_eq!(apply(plan(), None, None, Some(100)).limit(), Some(100));
        assert_eq!(apply(plan(), Some(5), None, Some(100)).limit(), Some(5));
        assert_eq!(apply(plan(), None, None, None).limit(), None);
    }

    #[test]
    fn count_ignores_paging() {
        let plan = apply(plan(), Some(5), Some(2), None);
        assert_eq!(
            plan.count_query().sql(),
            r#"select count(*) as count from "persons""#
        );
        assert!(plan.root_query().sql().ends_with(" limit $1 offset $2"));
    }
}
