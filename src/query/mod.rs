mod predicate;

use std::collections::BTreeMap;
use std::sync::Arc;

use sqlx::{Postgres, QueryBuilder};

use crate::eager::EagerNode;
use crate::schema::{EntitySchema, qualified_name, quote_ident};

pub use predicate::{ColumnRef, Operator, Predicate};

const FILTER_QUERY_ALIAS: &str = "filter_query";

/// Direction for sorting results.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    fn as_str(self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderTerm {
    pub column: ColumnRef,
    pub direction: SortDirection,
}

/// One `left join <table> as <alias> on <alias>.<column> = <parent_alias>.<parent_column>`.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinStep {
    pub table: String,
    pub alias: String,
    pub column: String,
    pub parent_alias: String,
    pub parent_column: String,
}

/// A filter evaluated in a single joined scope. Rendered as a distinct-key
/// side query inner-joined back onto its scope on the primary key.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinedFilter {
    pub table: String,
    pub id_column: String,
    pub joins: Vec<JoinStep>,
    pub predicate: Predicate,
}

/// Per-scope query state. The root query has one, and every eager relation
/// may have one keyed by its alias path.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scope {
    pub select: Vec<String>,
    pub predicates: Vec<Predicate>,
    pub order: Vec<OrderTerm>,
    pub joined: Vec<JoinedFilter>,
}

impl Scope {
    pub fn is_empty(&self) -> bool {
        self.select.is_empty()
            && self.predicates.is_empty()
            && self.order.is_empty()
            && self.joined.is_empty()
    }
}

/// Query plan threaded through the build pipeline. Each stage takes it by
/// value and hands back the updated plan.
#[derive(Clone, Debug)]
pub struct QueryPlan {
    root: Arc<EntitySchema>,
    scope: Scope,
    modifiers: BTreeMap<String, Scope>,
    eager: Vec<EagerNode>,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl QueryPlan {
    pub fn new(root: Arc<EntitySchema>) -> Self {
        Self {
            root,
            scope: Scope::default(),
            modifiers: BTreeMap::new(),
            eager: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn root(&self) -> &Arc<EntitySchema> {
        &self.root
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub(crate) fn scope_mut(&mut self) -> &mut Scope {
        &mut self.scope
    }

    pub fn modifier(&self, path: &str) -> Option<&Scope> {
        self.modifiers.get(path)
    }

    pub fn modifiers(&self) -> impl Iterator<Item = (&str, &Scope)> {
        self.modifiers.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Locates or creates the scope of the eager relation at `path`.
    pub(crate) fn modifier_mut(&mut self, path: &str) -> &mut Scope {
        self.modifiers.entry(path.to_string()).or_default()
    }

    pub fn eager(&self) -> &[EagerNode] {
        &self.eager
    }

    pub(crate) fn set_eager(&mut self, eager: Vec<EagerNode>) {
        self.eager = eager;
    }

    pub fn limit(&self) -> Option<i64> {
        self.limit
    }

    pub(crate) fn set_limit(&mut self, limit: Option<i64>) {
        self.limit = limit;
    }

    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    pub(crate) fn set_offset(&mut self, offset: Option<i64>) {
        self.offset = offset;
    }

    /// Renders the root query. Each row is a single `doc` jsonb column.
    pub fn root_query(&self) -> QueryBuilder<'static, Postgres> {
        let table = self.root.table.as_str();
        let mut builder = QueryBuilder::new("select ");
        let helpers = helper_columns(&self.scope.select, &self.eager);
        push_document(&mut builder, table, &self.scope.select, &helpers);
        builder.push(" as doc from ");
        builder.push(quote_ident(table));
        push_joined_filters(&mut builder, table, &self.root.id_column, &self.scope.joined);
        push_where(&mut builder, &self.scope.predicates, false);
        push_order(&mut builder, &self.scope.order);

        if let Some(limit) = self.limit {
            builder.push(" limit ");
            builder.push_bind(limit);
        }

        if let Some(offset) = self.offset {
            builder.push(" offset ");
            builder.push_bind(offset);
        }

        builder
    }

    /// Renders a row count over the same filtering as [`Self::root_query`],
    /// without selection, ordering or pagination.
    pub fn count_query(&self) -> QueryBuilder<'static, Postgres> {
        let table = self.root.table.as_str();
        let mut builder = QueryBuilder::new("select count(*) as count from ");
        builder.push(quote_ident(table));
        push_joined_filters(&mut builder, table, &self.root.id_column, &self.scope.joined);
        push_where(&mut builder, &self.scope.predicates, false);
        builder
    }

    /// Renders the batched load of `node` for the given owner keys. Each row
    /// is `(owner_key, doc)`.
    pub(crate) fn eager_query(
        &self,
        node: &EagerNode,
        keys: Vec<String>,
    ) -> QueryBuilder<'static, Postgres> {
        let target = node.target();
        let table = target.table.as_str();
        let relation = node.relation();
        let empty = Scope::default();
        let scope = self.modifiers.get(node.path()).unwrap_or(&empty);

        let owner_key = match &relation.through {
            Some(through) => qualified_name(&through.table, &through.from),
            None => qualified_name(table, &relation.to),
        };

        let mut builder = QueryBuilder::new("select (");
        builder.push(&owner_key);
        builder.push(")::text as owner_key, ");
        let helpers = helper_columns(&scope.select, node.children());
        push_document(&mut builder, table, &scope.select, &helpers);
        builder.push(" as doc from ");
        builder.push(quote_ident(table));
        if let Some(through) = &relation.through {
            builder.push(" inner join ");
            builder.push(quote_ident(&through.table));
            builder.push(" on ");
            builder.push(qualified_name(&through.table, &through.to));
            builder.push(" = ");
            builder.push(qualified_name(table, &relation.to));
        }
        push_joined_filters(&mut builder, table, &target.id_column, &scope.joined);

        // Keys travel as text. A typed key column is compared directly so its
        // index stays usable.
        match node.owner_key_type() {
            Some(sql_type) => {
                builder.push(" where ");
                builder.push(&owner_key);
                builder.push(" = any(cast(");
                builder.push_bind(keys);
                builder.push(" as ");
                builder.push(sql_type);
                builder.push("[]))");
            }
            None => {
                builder.push(" where (");
                builder.push(&owner_key);
                builder.push(")::text = any(");
                builder.push_bind(keys);
                builder.push(")");
            }
        }
        push_where(&mut builder, &scope.predicates, true);
        push_order(&mut builder, &scope.order);

        builder
    }
}

/// Join columns the children of a scope need but the scope's field list
/// leaves out. They are fetched and stripped after loading.
pub(crate) fn helper_columns(select: &[String], children: &[EagerNode]) -> Vec<String> {
    let mut helpers: Vec<String> = Vec::new();
    if select.is_empty() {
        return helpers;
    }
    for child in children {
        let column = &child.relation().from;
        if !select.contains(column) && !helpers.contains(column) {
            helpers.push(column.clone());
        }
    }
    helpers
}

fn push_document(
    builder: &mut QueryBuilder<'static, Postgres>,
    table: &str,
    select: &[String],
    helpers: &[String],
) {
    if select.is_empty() {
        builder.push("to_jsonb(");
        builder.push(quote_ident(table));
        builder.push(")");
        return;
    }

    builder.push("jsonb_build_object(");
    let mut first = true;
    for column in select.iter().chain(helpers) {
        if !first {
            builder.push(", ");
        }
        first = false;
        builder.push_bind(column.clone());
        builder.push(", ");
        builder.push(qualified_name(table, column));
    }
    builder.push(")");
}

fn push_joined_filters(
    builder: &mut QueryBuilder<'static, Postgres>,
    table: &str,
    id_column: &str,
    joined: &[JoinedFilter],
) {
    for (i, filter) in joined.iter().enumerate() {
        let alias = if i == 0 {
            FILTER_QUERY_ALIAS.to_string()
        } else {
            format!("{FILTER_QUERY_ALIAS}_{}", i + 1)
        };
        builder.push(" inner join (select distinct ");
        builder.push(qualified_name(&filter.table, &filter.id_column));
        builder.push(" from ");
        builder.push(quote_ident(&filter.table));
        for join in &filter.joins {
            builder.push(" left join ");
            builder.push(quote_ident(&join.table));
            builder.push(" as ");
            builder.push(quote_ident(&join.alias));
            builder.push(" on ");
            builder.push(qualified_name(&join.alias, &join.column));
            builder.push(" = ");
            builder.push(qualified_name(&join.parent_alias, &join.parent_column));
        }
        builder.push(" where ");
        filter.predicate.push_sql(builder);
        builder.push(") as ");
        builder.push(quote_ident(&alias));
        builder.push(" on ");
        builder.push(qualified_name(table, id_column));
        builder.push(" = ");
        builder.push(qualified_name(&alias, &filter.id_column));
    }
}

fn push_where(
    builder: &mut QueryBuilder<'static, Postgres>,
    predicates: &[Predicate],
    has_where: bool,
) {
    let mut iter = predicates.iter();
    if !has_where {
        match iter.next() {
            Some(first) => {
                builder.push(" where ");
                first.push_sql(builder);
            }
            None => return,
        }
    }
    for predicate in iter {
        builder.push(" and ");
        predicate.push_sql(builder);
    }
}

fn push_order(builder: &mut QueryBuilder<'static, Postgres>, order: &[OrderTerm]) {
    if order.is_empty() {
        return;
    }
    builder.push(" order by ");
    let mut first = true;
    for term in order {
        if !first {
            builder.push(", ");
        }
        first = false;
        term.column.push_sql(builder);
        builder.push(" ");
        builder.push(term.direction.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persons() -> Arc<EntitySchema> {
        Arc::new(EntitySchema::new("Person", "persons"))
    }

    fn last_name() -> ColumnRef {
        ColumnRef::new("persons", "lastName")
    }

    #[test]
    fn bare_root_query() {
        let plan = QueryPlan::new(persons());
        assert_eq!(
            plan.root_query().sql(),
            r#"select to_jsonb("persons") as doc from "persons""#
        );
        assert_eq!(
            plan.count_query().sql(),
            r#"select count(*) as count from "persons""#
        );
    }

    #[test]
    fn root_query_with_everything() {
        let mut plan = QueryPlan::new(persons());
        plan.scope_mut().select = vec!["firstName".into()];
        plan.scope_mut()
            .predicates
            .push(Predicate::eq(last_name(), "L01"));
        plan.scope_mut().order.push(OrderTerm {
            column: last_name(),
            direction: SortDirection::Desc,
        });
        plan.set_limit(Some(5));
        plan.set_offset(Some(2));
        assert_eq!(
            plan.root_query().sql(),
            concat!(
                r#"select jsonb_build_object($1, "persons"."firstName") as doc from "persons""#,
                r#" where ("persons"."lastName" = $2) order by "persons"."lastName" desc"#,
                " limit $3 offset $4"
            )
        );
        assert_eq!(
            plan.count_query().sql(),
            r#"select count(*) as count from "persons" where ("persons"."lastName" = $1)"#
        );
    }

    #[test]
    fn joined_filters_get_distinct_aliases() {
        let filter = JoinedFilter {
            table: "persons".into(),
            id_column: "id".into(),
            joins: vec![JoinStep {
                table: "pets".into(),
                alias: "pets".into(),
                column: "ownerId".into(),
                parent_alias: "persons".into(),
                parent_column: "id".into(),
            }],
            predicate: Predicate::eq(ColumnRef::new("pets", "name"), "P90"),
        };
        let mut plan = QueryPlan::new(persons());
        plan.scope_mut().joined.push(filter.clone());
        plan.scope_mut().joined.push(filter);
        assert_eq!(
            plan.count_query().sql(),
            concat!(
                r#"select count(*) as count from "persons""#,
                r#" inner join (select distinct "persons"."id" from "persons""#,
                r#" left join "pets" as "pets" on "pets"."ownerId" = "persons"."id""#,
                r#" where ("pets"."name" = $1)) as "filter_query""#,
                r#" on "persons"."id" = "filter_query"."id""#,
                r#" inner join (select distinct "persons"."id" from "persons""#,
                r#" left join "pets" as "pets" on "pets"."ownerId" = "persons"."id""#,
                r#" where ("pets"."name" = $2)) as "filter_query_2""#,
                r#" on "persons"."id" = "filter_query_2"."id""#,
            )
        );
    }
}
