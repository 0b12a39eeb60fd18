//! Eager loading of related rows into nested documents.
//!
//! An eager spec is either an expression string (`"[movies.category, pets]"`)
//! or an object:
//!
//! ```json
//! {
//!   "$where": { "movies.name": "M00" },
//!   "favorites": { "$relation": "movies", "$where": { "category.name": "C00" } },
//!   "pets": true
//! }
//! ```
//!
//! `$where` filters with joined-scope semantics at its own level. At the root
//! it narrows the root rows. Under a relation it narrows that relation's rows.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::debug;

use crate::apply::BuildContext;
use crate::filter::FilterExpression;
use crate::metrics::{self, QueryKind};
use crate::query::{QueryPlan, helper_columns};
use crate::relation::RelationExpression;
use crate::schema::{Cardinality, EntitySchema, Relation, SchemaRegistry};
use crate::{Error, Result};

const WHERE: &str = "$where";
const RELATION: &str = "$relation";

/// Raw `eager` parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EagerSpec {
    Expression(String),
    Object(Map<String, Value>),
}

impl From<&str> for EagerSpec {
    fn from(value: &str) -> Self {
        EagerSpec::Expression(value.to_string())
    }
}

/// Parsed eager spec, not yet resolved against a schema.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EagerTree {
    filter: Option<FilterExpression>,
    nodes: Vec<EagerSpecNode>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EagerSpecNode {
    key: String,
    relation: String,
    filter: Option<FilterExpression>,
    children: Vec<EagerSpecNode>,
}

impl EagerSpecNode {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn relation(&self) -> &str {
        &self.relation
    }

    pub fn filter(&self) -> Option<&FilterExpression> {
        self.filter.as_ref()
    }

    pub fn children(&self) -> &[EagerSpecNode] {
        &self.children
    }
}

impl EagerTree {
    pub fn parse(spec: &EagerSpec) -> Result<Self> {
        match spec {
            EagerSpec::Expression(expr) => Ok(Self {
                filter: None,
                nodes: Self::from_expression(&RelationExpression::parse(expr)?),
            }),
            EagerSpec::Object(map) => {
                let (filter, relation, nodes) = Self::parse_object(map, true)?;
                debug_assert!(relation.is_none());
                Ok(Self { filter, nodes })
            }
        }
    }

    /// Root-level `$where`.
    pub fn filter(&self) -> Option<&FilterExpression> {
        self.filter.as_ref()
    }

    pub fn nodes(&self) -> &[EagerSpecNode] {
        &self.nodes
    }

    fn from_expression(expr: &RelationExpression) -> Vec<EagerSpecNode> {
        expr.children()
            .map(|(name, child)| EagerSpecNode {
                key: name.to_string(),
                relation: name.to_string(),
                filter: None,
                children: Self::from_expression(child),
            })
            .collect()
    }

    #[allow(clippy::type_complexity)]
    fn parse_object(
        map: &Map<String, Value>,
        root: bool,
    ) -> Result<(Option<FilterExpression>, Option<String>, Vec<EagerSpecNode>)> {
        let mut filter = None;
        let mut relation = None;
        let mut nodes = Vec::new();
        for (key, value) in map {
            match key.as_str() {
                WHERE => filter = Some(FilterExpression::parse(value)?),
                RELATION if !root => {
                    let name = value.as_str().ok_or_else(|| {
                        Error::shape(format!("`{RELATION}` expects a relation name"))
                    })?;
                    relation = Some(name.to_string());
                }
                other if other.starts_with('$') => {
                    return Err(Error::shape(format!(
                        "`{other}` is not allowed in an eager object"
                    )));
                }
                _ => match value {
                    Value::Bool(true) => nodes.push(EagerSpecNode {
                        key: key.clone(),
                        relation: key.clone(),
                        filter: None,
                        children: Vec::new(),
                    }),
                    Value::Bool(false) => {}
                    Value::Object(inner) => {
                        let (filter, relation, children) = Self::parse_object(inner, false)?;
                        nodes.push(EagerSpecNode {
                            key: key.clone(),
                            relation: relation.unwrap_or_else(|| key.clone()),
                            filter,
                            children,
                        });
                    }
                    other => {
                        return Err(Error::shape(format!(
                            "eager relation `{key}` expects true, false or an object, got `{other}`"
                        )));
                    }
                },
            }
        }
        Ok((filter, relation, nodes))
    }

    /// Resolves a relation path from `root` as it will be loaded, honouring
    /// aliases from this tree before falling back to schema relation names.
    pub(crate) fn scope_entity<S: AsRef<str>>(
        &self,
        schema: &SchemaRegistry,
        root: &Arc<EntitySchema>,
        segments: &[S],
        path: &str,
    ) -> Result<Arc<EntitySchema>> {
        let mut entity = root.clone();
        let mut nodes: &[EagerSpecNode] = &self.nodes;
        for segment in segments {
            let segment = segment.as_ref();
            let (relation, children) = match nodes.iter().find(|n| n.key == segment) {
                Some(node) => (node.relation.as_str(), node.children.as_slice()),
                None => (segment, &[][..]),
            };
            let (_, target) = schema.relation(&entity, relation, path)?;
            entity = target;
            nodes = children;
        }
        Ok(entity)
    }

    /// Resolves every node against the schema.
    pub(crate) fn resolve(
        &self,
        schema: &SchemaRegistry,
        root: &Arc<EntitySchema>,
    ) -> Result<Vec<EagerNode>> {
        resolve_nodes(schema, root, &self.nodes, "", &[])
    }
}

fn resolve_nodes(
    schema: &SchemaRegistry,
    owner: &Arc<EntitySchema>,
    nodes: &[EagerSpecNode],
    prefix: &str,
    relation_prefix: &[String],
) -> Result<Vec<EagerNode>> {
    nodes
        .iter()
        .map(|spec| {
            let path = if prefix.is_empty() {
                spec.key.clone()
            } else {
                format!("{prefix}.{}", spec.key)
            };
            let (relation, target) = schema.relation(owner, &spec.relation, &path)?;
            let mut relation_path = relation_prefix.to_vec();
            relation_path.push(spec.relation.clone());
            let children = resolve_nodes(schema, &target, &spec.children, &path, &relation_path)?;
            let owner_key_type = match &relation.through {
                Some(_) => owner.type_of(&relation.from),
                None => owner
                    .type_of(&relation.from)
                    .or_else(|| target.type_of(&relation.to)),
            }
            .map(str::to_string);
            Ok(EagerNode {
                key: spec.key.clone(),
                path,
                relation_path,
                relation,
                owner_key_type,
                target,
                filter: spec.filter.clone(),
                children,
            })
        })
        .collect()
}

/// An eager relation resolved against the schema.
#[derive(Clone, Debug)]
pub struct EagerNode {
    key: String,
    path: String,
    relation_path: Vec<String>,
    relation: Relation,
    owner_key_type: Option<String>,
    target: Arc<EntitySchema>,
    filter: Option<FilterExpression>,
    children: Vec<EagerNode>,
}

impl EagerNode {
    /// Property the loaded rows are attached under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Dotted path of keys (aliases) from the root.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Dotted path of schema relation names from the root.
    pub fn relation_path(&self) -> &[String] {
        &self.relation_path
    }

    pub fn relation(&self) -> &Relation {
        &self.relation
    }

    /// Postgres type of the column the owner keys are matched on, when known.
    pub fn owner_key_type(&self) -> Option<&str> {
        self.owner_key_type.as_deref()
    }

    pub fn target(&self) -> &Arc<EntitySchema> {
        &self.target
    }

    pub fn filter(&self) -> Option<&FilterExpression> {
        self.filter.as_ref()
    }

    pub fn children(&self) -> &[EagerNode] {
        &self.children
    }

    /// Preorder walk over this node and its descendants.
    pub fn walk<'a>(&'a self, out: &mut Vec<&'a EagerNode>) {
        out.push(self);
        for child in &self.children {
            child.walk(out);
        }
    }
}

/// Resolves the eager tree onto the plan. Checks every loaded relation path
/// against the allow-list and turns each relation-level `$where` into a
/// joined filter on that relation's scope.
pub(crate) fn apply(ctx: &BuildContext<'_>, mut plan: QueryPlan, tree: &EagerTree) -> Result<QueryPlan> {
    let nodes = tree.resolve(ctx.schema, plan.root())?;
    let mut all = Vec::new();
    for node in &nodes {
        node.walk(&mut all);
    }

    for node in &all {
        ctx.check_allowed(node.relation_path())?;
        if let Some(filter) = node.filter() {
            if let Some(joined) = ctx.joined_filter(node.target(), filter, node.relation_path())? {
                plan.modifier_mut(node.path()).joined.push(joined);
            }
        }
    }

    for (path, _) in plan.modifiers() {
        if !all.iter().any(|node| node.path() == path) {
            debug!(relation = path, "modifier on a relation that is not eager loaded; ignored");
        }
    }

    plan.set_eager(nodes);
    Ok(plan)
}

/// Loads every eager relation of `plan` into `docs`, which are the root rows.
pub(crate) async fn materialize(
    pool: &PgPool,
    plan: &QueryPlan,
    docs: &mut [Value],
    slow_query_threshold: Duration,
) -> Result<()> {
    load_level(pool, plan, plan.eager(), docs, slow_query_threshold).await?;
    strip(docs, &helper_columns(&plan.scope().select, plan.eager()));
    Ok(())
}

type LoadFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

fn load_level<'a>(
    pool: &'a PgPool,
    plan: &'a QueryPlan,
    nodes: &'a [EagerNode],
    parents: &'a mut [Value],
    slow_query_threshold: Duration,
) -> LoadFuture<'a> {
    Box::pin(async move {
        for node in nodes {
            let from = node.relation().from.as_str();
            let keys: BTreeSet<String> = parents
                .iter()
                .filter_map(|parent| parent.get(from).and_then(key_text))
                .collect();

            let rows: Vec<(String, Value)> = if keys.is_empty() {
                Vec::new()
            } else {
                let key_count = keys.len();
                let mut builder = plan.eager_query(node, keys.into_iter().collect());
                let sql = builder.sql().to_string();
                let start = Instant::now();
                let rows = builder
                    .build_query_as::<(String, Value)>()
                    .fetch_all(pool)
                    .await?;
                metrics::observe_query(
                    QueryKind::Eager,
                    &sql,
                    start.elapsed(),
                    slow_query_threshold,
                );
                debug!(
                    relation = node.path(),
                    keys = key_count,
                    rows = rows.len(),
                    "loaded eager relation"
                );
                rows
            };

            let (owners, mut children): (Vec<String>, Vec<Value>) = rows.into_iter().unzip();
            load_level(pool, plan, node.children(), &mut children, slow_query_threshold).await?;
            if let Some(scope) = plan.modifier(node.path()) {
                strip(&mut children, &helper_columns(&scope.select, node.children()));
            }

            let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();
            for (owner, child) in owners.into_iter().zip(children) {
                grouped.entry(owner).or_default().push(child);
            }

            for parent in parents.iter_mut() {
                let related = parent
                    .get(from)
                    .and_then(key_text)
                    .and_then(|key| grouped.get(&key));
                let attached = match node.relation().cardinality() {
                    Cardinality::Many => Value::Array(related.cloned().unwrap_or_default()),
                    Cardinality::One => related
                        .and_then(|rows| rows.first().cloned())
                        .unwrap_or(Value::Null),
                };
                if let Value::Object(map) = parent {
                    map.insert(node.key().to_string(), attached);
                }
            }
        }
        Ok(())
    })
}

/// Textual form of a key column, matching Postgres' `::text` cast for the
/// integer, text and uuid keys used in joins.
fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn strip(docs: &mut [Value], helpers: &[String]) {
    if helpers.is_empty() {
        return;
    }
    for doc in docs {
        if let Value::Object(map) = doc {
            for helper in helpers {
                map.remove(helper);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Through;
    use serde_json::json;

    fn schema() -> SchemaRegistry {
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
                    .relation("parent", Relation::belongs_to_one("Person", "pid", "id")),
            )
            .with(
                EntitySchema::new("Movie", "movies")
                    .relation("category", Relation::belongs_to_one("Category", "categoryId", "id")),
            )
            .with(EntitySchema::new("Category", "categories"))
    }

    fn object(value: Value) -> EagerSpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn expression_strings_become_nodes() {
        let tree = EagerTree::parse(&EagerSpec::from("[movies.category, parent]")).unwrap();
        let keys: Vec<&str> = tree.nodes().iter().map(EagerSpecNode::key).collect();
        assert_eq!(keys, ["movies", "parent"]);
        assert_eq!(tree.nodes()[0].children()[0].key(), "category");
        assert!(tree.filter().is_none());
    }

    #[test]
    fn object_notation_with_aliases() {
        let tree = EagerTree::parse(&object(json!({
            "$where": {"firstName": "F01"},
            "upper": {
                "$relation": "parent",
                "$where": {"firstName": "F05"},
                "favorites": {"$relation": "movies", "$where": {"name": "M49"}}
            },
            "movies": true,
            "skipped": false
        })))
        .unwrap();
        assert!(tree.filter().is_some());
        let keys: Vec<&str> = tree.nodes().iter().map(EagerSpecNode::key).collect();
        assert_eq!(keys, ["upper", "movies"]);
        let upper = &tree.nodes()[0];
        assert_eq!(upper.relation(), "parent");
        assert_eq!(upper.children()[0].relation(), "movies");
        assert!(upper.children()[0].filter().is_some());

        let schema = schema();
        let person = schema.entity("Person").unwrap();
        let resolved = tree.resolve(&schema, &person).unwrap();
        assert_eq!(resolved[0].children()[0].path(), "upper.favorites");
        assert_eq!(resolved[0].children()[0].relation_path(), ["parent", "movies"]);
        assert_eq!(resolved[0].children()[0].target().table, "movies");
    }

    #[test]
    fn scope_entity_follows_aliases() {
        let tree = EagerTree::parse(&object(json!({"favorites": {"$relation": "movies"}}))).unwrap();
        let schema = schema();
        let person = schema.entity("Person").unwrap();
        let entity = tree
            .scope_entity(&schema, &person, &["favorites", "category"], "favorites.category.name")
            .unwrap();
        assert_eq!(entity.table, "categories");
        let entity = tree
            .scope_entity(&schema, &person, &["parent", "movies"], "parent.movies.name")
            .unwrap();
        assert_eq!(entity.table, "movies");
    }

    #[test]
    fn unknown_relations_fail_resolution() {
        let tree = EagerTree::parse(&EagerSpec::from("friends")).unwrap();
        let schema = schema();
        let person = schema.entity("Person").unwrap();
        let err = tree.resolve(&schema, &person).unwrap_err();
        assert!(matches!(err, Error::InvalidPropertyPath { .. }));
    }

    #[test]
    fn rejects_bad_objects() {
        for value in [
            json!({"movies": 1}),
            json!({"$relation": "movies"}),
            json!({"movies": {"$modify": "x"}}),
            json!({"movies": {"$relation": 3}}),
            json!({"$where": []}),
        ] {
            let err = EagerTree::parse(&object(value.clone())).unwrap_err();
            assert!(matches!(err, Error::InvalidExpressionShape(_)), "{value}");
        }
    }

    #[test]
    fn helper_columns_are_stripped() {
        let mut docs = vec![json!({"name": "M1", "categoryId": 3})];
        strip(&mut docs, &["categoryId".to_string()]);
        assert_eq!(docs[0], json!({"name": "M1"}));
    }

    #[test]
    fn key_text_matches_postgres_casts() {
        assert_eq!(key_text(&json!(12)), Some("12".to_string()));
        assert_eq!(key_text(&json!("abc")), Some("abc".to_string()));
        assert_eq!(key_text(&Value::Null), None);
    }

    #[test]
    fn typed_owner_keys_compare_without_casting_the_column() {
        let schema = SchemaRegistry::new()
            .with(
                EntitySchema::new("Person", "persons")
                    .column_type("id", "bigint")
                    .relation(
                        "movies",
                        Relation::many_to_many(
                            "Movie",
                            "id",
                            Through::new("person_movie", "personId", "movieId"),
                            "id",
                        ),
                    )
                    .relation("parent", Relation::belongs_to_one("Person", "pid", "id")),
            )
            .with(EntitySchema::new("Movie", "movies"));
        let person = schema.entity("Person").unwrap();
        let tree = EagerTree::parse(&EagerSpec::from("[movies, parent]")).unwrap();
        let nodes = tree.resolve(&schema, &person).unwrap();
        let plan = QueryPlan::new(person);

        assert_eq!(nodes[0].owner_key_type(), Some("bigint"));
        let sql = plan.eager_query(&nodes[0], vec!["1".into()]).sql().to_string();
        assert!(
            sql.ends_with(r#" where "person_movie"."personId" = any(cast($1 as bigint[]))"#),
            "{sql}"
        );

        // `pid` has no declared type, but the target key `id` does
        assert_eq!(nodes[1].owner_key_type(), Some("bigint"));

        let schema = self::schema();
        let person = schema.entity("Person").unwrap();
        let nodes = EagerTree::parse(&EagerSpec::from("movies"))
            .unwrap()
            .resolve(&schema, &person)
            .unwrap();
        assert_eq!(nodes[0].owner_key_type(), None);
        let sql = QueryPlan::new(person)
            .eager_query(&nodes[0], vec!["1".into()])
            .sql()
            .to_string();
        assert!(
            sql.ends_with(r#" where ("person_movie"."personId")::text = any($1)"#),
            "{sql}"
        );
    }
}
