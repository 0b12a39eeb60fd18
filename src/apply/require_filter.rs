use crate::apply::BuildContext;
use crate::filter::FilterExpression;
use crate::query::QueryPlan;
use crate::Result;

/// Applies `require` with joined-scope semantics: the whole filter must hold
/// within one joined row of the root and its related rows. Only the root rows
/// are narrowed; eager relations still load in full.
pub(crate) fn apply(
    ctx: &BuildContext<'_>,
    mut plan: QueryPlan,
    filter: &FilterExpression,
) -> Result<QueryPlan> {
    let root = plan.root().clone();
    if let Some(joined) = ctx.joined_filter(&root, filter, &[])? {
        plan.scope_mut().joined.push(joined);
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::test_support::schema;
    use crate::eager::EagerTree;
    use crate::filter::{OperatorRegistry, PredicateCompiler};
    use serde_json::{Value, json};

    fn run(plan: Option<QueryPlan>, filter: Value) -> Result<QueryPlan> {
        let schema = schema();
        let operators = OperatorRegistry::new();
        let eager = EagerTree::default();
        let ctx = BuildContext {
            schema: &schema,
            compiler: PredicateCompiler::new(&operators),
            eager: &eager,
            allowed: None,
        };
        let plan = match plan {
            Some(plan) => plan,
            None => QueryPlan::new(schema.entity("Person")?),
        };
        apply(&ctx, plan, &FilterExpression::parse(&filter)?)
    }

    #[test]
    fn empty_filter_is_a_no_op() {
        let plan = run(None, json!({})).unwrap();
        assert!(plan.scope().is_empty());
        assert_eq!(
            plan.count_query().sql(),
            r#"select count(*) as count from "persons""#
        );
    }

    #[test]
    fn relations_join_once_inside_the_side_query() {
        let plan = run(
            None,
            json!({"movies.name": "M99", "pets.name": "P00", "movies.category.name": "C00"}),
        )
        .unwrap();
        assert_eq!(
            plan.count_query().sql(),
            concat!(
                r#"select count(*) as count from "persons""#,
                r#" inner join (select distinct "persons"."id" from "persons""#,
                r#" left join "person_movie" as "movies_through" on "movies_through"."personId" = "persons"."id""#,
                r#" left join "movies" as "movies" on "movies"."id" = "movies_through"."movieId""#,
                r#" left join "categories" as "movies:category" on "movies:category"."id" = "movies"."categoryId""#,
                r#" left join "pets" as "pets" on "pets"."ownerId" = "persons"."id""#,
                r#" where (("movies"."name" = $1) and ("pets"."name" = $2) and ("movies:category"."name" = $3)))"#,
                r#" as "filter_query" on "persons"."id" = "filter_query"."id""#,
            )
        );
    }

    #[test]
    fn root_properties_stay_on_the_root_table() {
        let plan = run(None, json!({"$or": [{"firstName": "F00"}, {"parent.firstName": "F00"}]}))
            .unwrap();
        let joined = &plan.scope().joined[0];
        assert_eq!(joined.joins.len(), 1);
        assert_eq!(joined.joins[0].alias, "parent");
        assert_eq!(joined.joins[0].column, "id");
        assert_eq!(joined.joins[0].parent_column, "pid");
    }

    #[test]
    fn second_require_gets_its_own_alias() {
        let plan = run(None, json!({"pets.name": "P00"})).unwrap();
        let plan = run(Some(plan), json!({"pets.name": "P01"})).unwrap();
        let sql = plan.count_query().sql().to_string();
        assert!(sql.contains(r#"as "filter_query" on"#));
        assert!(sql.contains(r#"as "filter_query_2" on"#));
    }
}
