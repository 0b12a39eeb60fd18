use tracing::debug;

use crate::apply::BuildContext;
use crate::filter::{FilterExpression, FilterNode};
use crate::query::QueryPlan;
use crate::{Error, Result};

/// Applies `where` with per-scope semantics. Every top-level entry narrows
/// only the scope its property belongs to: root properties filter root rows,
/// relation properties filter the rows loaded for that relation.
pub(crate) fn apply(
    ctx: &BuildContext<'_>,
    mut plan: QueryPlan,
    filter: &FilterExpression,
) -> Result<QueryPlan> {
    let root = plan.root().clone();
    for node in filter.nodes() {
        let scope = node_scope(node)?;
        let single = FilterExpression::new(vec![node.clone()]);
        let compiled = ctx
            .compiler
            .compile(&single, |path| ctx.scope_column(&root, path))?;
        if scope.is_empty() {
            plan.scope_mut().predicates.push(compiled.predicate);
        } else {
            let key = scope.join(".");
            debug!(scope = %key, "where entry routed to relation scope");
            plan.modifier_mut(&key).predicates.push(compiled.predicate);
        }
    }
    Ok(plan)
}

/// Relation path shared by every property under `node`.
fn node_scope(node: &FilterNode) -> Result<Vec<String>> {
    match node {
        FilterNode::Property { path, .. } => Ok(path.relation().to_vec()),
        FilterNode::And(items) | FilterNode::Or(items) => {
            let mut scopes = items
                .iter()
                .flat_map(|item| item.property_paths())
                .map(|path| path.relation());
            let Some(first) = scopes.next() else {
                return Ok(Vec::new());
            };
            if scopes.all(|scope| scope == first) {
                Ok(first.to_vec())
            } else {
                Err(Error::shape(
                    "a `$and`/`$or` group in `where` mixes relations; use `require` to filter across relations",
                ))
            }
        }
    }
}
