//! Build pipeline stages. Each stage takes the [`QueryPlan`] by value and
//! returns it updated, so a failing stage leaves nothing half-applied.
//!
//! [`QueryPlan`]: crate::query::QueryPlan

pub(crate) mod fields;
pub(crate) mod order;
pub(crate) mod paging;
pub(crate) mod require_filter;
pub(crate) mod where_filter;

use std::sync::Arc;

use crate::eager::EagerTree;
use crate::filter::{FilterExpression, PredicateCompiler};
use crate::query::{ColumnRef, JoinStep, JoinedFilter};
use crate::relation::RelationExpression;
use crate::schema::{EntitySchema, SchemaRegistry};
use crate::{Error, PropertyPath, Result};

/// Everything a stage needs besides the plan itself.
pub(crate) struct BuildContext<'a> {
    pub(crate) schema: &'a SchemaRegistry,
    pub(crate) compiler: PredicateCompiler<'a>,
    pub(crate) eager: &'a EagerTree,
    pub(crate) allowed: Option<&'a RelationExpression>,
}

impl BuildContext<'_> {
    /// Qualifies `path` against the table of the scope it addresses. Relation
    /// segments go through eager aliases first, then schema relation names.
    pub(crate) fn scope_column(
        &self,
        root: &Arc<EntitySchema>,
        path: &PropertyPath,
    ) -> Result<ColumnRef> {
        let display = path.to_string();
        let entity = self
            .eager
            .scope_entity(self.schema, root, path.relation(), &display)?;
        entity.check_column(path.property(), &display)?;
        Ok(ColumnRef::new(entity.table.clone(), path.property())
            .typed(entity.type_of(path.property())))
    }

    pub(crate) fn check_allowed(&self, segments: &[String]) -> Result<()> {
        match self.allowed {
            Some(allowed) if !allowed.contains_path(segments) => {
                Err(Error::DisallowedEagerPath(segments.join(".")))
            }
            _ => Ok(()),
        }
    }

    /// Compiles `filter` into one joined scope rooted at `entity`. Every
    /// referenced relation is collected in the same walk and becomes a left
    /// join inside the distinct-key side query. `prefix` is the relation path
    /// from the query root to `entity`, used for the allow-list check.
    pub(crate) fn joined_filter(
        &self,
        entity: &Arc<EntitySchema>,
        filter: &FilterExpression,
        prefix: &[String],
    ) -> Result<Option<JoinedFilter>> {
        if filter.is_empty() {
            return Ok(None);
        }

        let compiled = self.compiler.compile(filter, |path| {
            let display = path.to_string();
            let target = self.schema.walk(entity, path.relation(), &display)?;
            target.check_column(path.property(), &display)?;
            let alias = if path.is_root() {
                entity.table.clone()
            } else {
                path.relation().join(":")
            };
            Ok(ColumnRef::new(alias, path.property()).typed(target.type_of(path.property())))
        })?;

        let relations = RelationExpression::from_paths(&compiled.relations);
        for path in relations.paths() {
            let mut segments = prefix.to_vec();
            segments.extend(path.split('.').map(str::to_string));
            self.check_allowed(&segments)?;
        }

        let mut joins = Vec::new();
        self.join_steps(entity, &entity.table, "", &relations, &mut joins)?;
        Ok(Some(JoinedFilter {
            table: entity.table.clone(),
            id_column: entity.id_column.clone(),
            joins,
            predicate: compiled.predicate,
        }))
    }

    fn join_steps(
        &self,
        owner: &EntitySchema,
        owner_alias: &str,
        prefix: &str,
        relations: &RelationExpression,
        out: &mut Vec<JoinStep>,
    ) -> Result<()> {
        for (name, child) in relations.children() {
            let alias = if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}:{name}")
            };
            let (relation, target) = self
                .schema
                .relation(owner, name, &alias.replace(':', "."))?;
            match &relation.through {
                Some(through) => {
                    let through_alias = format!("{alias}_through");
                    out.push(JoinStep {
                        table: through.table.clone(),
                        alias: through_alias.clone(),
                        column: through.from.clone(),
                        parent_alias: owner_alias.to_string(),
                        parent_column: relation.from.clone(),
                    });
                    out.push(JoinStep {
                        table: target.table.clone(),
                        alias: alias.clone(),
                        column: relation.to.clone(),
                        parent_alias: through_alias,
                        parent_column: through.to.clone(),
                    });
                }
                None => out.push(JoinStep {
                    table: target.table.clone(),
                    alias: alias.clone(),
                    column: relation.to.clone(),
                    parent_alias: owner_alias.to_string(),
                    parent_column: relation.from.clone(),
                }),
            }
            self.join_steps(&target, &alias, &alias, child, out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::schema::{EntitySchema, Relation, SchemaRegistry, Through};

    /// Persons with movies (through person_movie), pets and a parent; movies
    /// with a category.
    pub(crate) fn schema() -> SchemaRegistry {
        SchemaRegistry::new()
            .with(
                EntitySchema::new("Person", "persons")
                    .relation(
                        "movies",
                        Relation::many_to_many(
                            "Movie",
                            "id",
                            Through::new("person_movie", "personId", "movieId"),
                            "id",
                        ),
                    )
                    .relation("pets", Relation::has_many("Animal", "id", "ownerId"))
                    .relation("parent", Relation::belongs_to_one("Person", "pid", "id")),
            )
            .with(
                EntitySchema::new("Movie", "movies")
                    .relation("category", Relation::belongs_to_one("Category", "categoryId", "id")),
            )
            .with(EntitySchema::new("Animal", "pets").columns(["id", "name", "ownerId"]))
            .with(EntitySchema::new("Category", "categories"))
    }
}
