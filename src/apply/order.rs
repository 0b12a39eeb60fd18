use crate::apply::BuildContext;
use crate::query::{OrderTerm, QueryPlan, SortDirection};
use crate::{Error, PropertyPath, Result};

/// Parses `"lastName desc, movies.name"` into `(property, direction)` pairs.
pub fn parse(order: &str) -> Result<Vec<(PropertyPath, SortDirection)>> {
    let mut terms = Vec::new();
    for item in order.split(',') {
        let mut tokens = item.split_whitespace();
        let Some(property) = tokens.next() else {
            continue;
        };
        let direction = match tokens.next() {
            None => SortDirection::Asc,
            Some(dir) if dir.eq_ignore_ascii_case("asc") => SortDirection::Asc,
            Some(dir) if dir.eq_ignore_ascii_case("desc") => SortDirection::Desc,
            Some(dir) => {
                return Err(Error::shape(format!(
                    "unknown sort direction `{dir}` for `{property}`"
                )));
            }
        };
        if let Some(extra) = tokens.next() {
            return Err(Error::shape(format!(
                "unexpected `{extra}` in order term `{}`",
                item.trim()
            )));
        }
        terms.push((PropertyPath::from(property), direction));
    }
    Ok(terms)
}

/// Root terms order the root query; relation terms order only the loaded
/// rows of that relation.
pub(crate) fn apply(ctx: &BuildContext<'_>, mut plan: QueryPlan, order: &str) -> Result<QueryPlan> {
    let root = plan.root().clone();
    for (path, direction) in parse(order)? {
        let column = ctx.scope_column(&root, &path)?;
        let term = OrderTerm { column, direction };
        if path.is_root() {
            plan.scope_mut().order.push(term);
        } else {
            plan.modifier_mut(&path.relation_path()).order.push(term);
        }
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::test_support::schema;
    use crate::eager::EagerTree;
    use crate::filter::{OperatorRegistry, PredicateCompiler};
    use crate::query::ColumnRef;

    #[test]
    fn parses_terms() {
        let terms = parse(" lastName DESC, , movies.name asc,age").unwrap();
        let rendered: Vec<(String, SortDirection)> =
            terms.into_iter().map(|(p, d)| (p.to_string(), d)).collect();
        assert_eq!(
            rendered,
            [
                ("lastName".to_string(), SortDirection::Desc),
                ("movies.name".to_string(), SortDirection::Asc),
                ("age".to_string(), SortDirection::Asc),
            ]
        );
    }

    #[test]
    fn rejects_bad_terms() {
        for input in ["name sideways", "name asc extra"] {
            let err = parse(input).unwrap_err();
            assert!(matches!(err, Error::InvalidExpressionShape(_)), "{input}");
        }
    }

    #[test]
    fn routes_terms_to_scopes() {
        let schema = schema();
        let operators = OperatorRegistry::new();
        let eager = EagerTree::default();
        let ctx = BuildContext {
            schema: &schema,
            compiler: PredicateCompiler::new(&operators),
            eager: &eager,
            allowed: None,
        };
        let plan = QueryPlan::new(schema.entity("Person").unwrap());
        let plan = apply(&ctx, plan, "lastName desc, movies.name").unwrap();
        assert_eq!(
            plan.scope().order,
            [OrderTerm {
                column: ColumnRef::new("persons", "lastName"),
                direction: SortDirection::Desc,
            }]
        );
        assert_eq!(
            plan.modifier("movies").unwrap().order,
            [OrderTerm {
                column: ColumnRef::new("movies", "name"),
                direction: SortDirection::Asc,
            }]
        );
        assert_eq!(
            plan.root_query().sql(),
            r#"select to_jsonb("persons") as doc from "persons" order by "persons"."lastName" desc"#
        );
    }
}
