use crate::apply::BuildContext;
use crate::query::QueryPlan;
use crate::{PropertyPath, Result};

/// Restricts the columns returned per scope. `["firstName", "movies.name"]`
/// selects `firstName` on the root rows and `name` on loaded movies.
pub(crate) fn apply(
    ctx: &BuildContext<'_>,
    mut plan: QueryPlan,
    fields: &[String],
) -> Result<QueryPlan> {
    let root = plan.root().clone();
    for field in fields {
        let path = PropertyPath::from(field.as_str());
        let column = ctx.scope_column(&root, &path)?;
        let scope = if path.is_root() {
            plan.scope_mut()
        } else {
            plan.modifier_mut(&path.relation_path())
        };
        if !scope.select.contains(&column.column) {
            scope.select.push(column.column);
        }
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::apply::test_support::schema;
    use crate::eager::EagerTree;
    use crate::filter::{OperatorRegistry, PredicateCompiler};

    fn run(fields: &[&str]) -> Result<QueryPlan> {
        let schema = schema();
        let operators = OperatorRegistry::new();
        let eager = EagerTree::default();
        let ctx = BuildContext {
            schema: &schema,
            compiler: PredicateCompiler::new(&operators),
            eager: &eager,
            allowed: None,
        };
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        apply(&ctx, QueryPlan::new(schema.entity("Person")?), &fields)
    }

    #[test]
    fn groups_by_scope() {
        let plan = run(&["firstName", "movies.name", "lastName", "firstName"]).unwrap();
        assert_eq!(plan.scope().select, ["firstName", "lastName"]);
        assert_eq!(plan.modifier("movies").unwrap().select, ["name"]);
        assert_eq!(
            plan.root_query().sql(),
            r#"select jsonb_build_object($1, "persons"."firstName", $2, "persons"."lastName") as doc from "persons""#
        );
    }

    #[test]
    fn empty_list_keeps_whole_rows() {
        let plan = run(&[]).unwrap();
        assert!(plan.scope().select.is_empty());
        assert_eq!(
            plan.root_query().sql(),
            r#"select to_jsonb("persons") as doc from "persons""#
        );
    }

    #[test]
    fn rejects_unknown_columns() {
        let err = run(&["pets.species"]).unwrap_err();
        assert!(matches!(err, Error::InvalidPropertyPath { .. }));
        let err = run(&["movies."]).unwrap_err();
        assert!(matches!(err, Error::InvalidPropertyPath { .. }));
    }
}
