use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, instrument};

use crate::apply::{self, BuildContext};
use crate::eager::{self, EagerSpec, EagerTree};
use crate::filter::{FilterExpression, OperatorRegistry, PredicateCompiler};
use crate::metrics::{self, QueryKind};
use crate::query::{ColumnRef, Predicate, QueryPlan};
use crate::relation::RelationExpression;
use crate::schema::{EntitySchema, SchemaRegistry};
use crate::{Error, Result};

#[derive(Clone, Debug)]
pub struct FilterConfig {
    /// Queries at or above this duration are logged on `rillfilter::slow_query`.
    pub slow_query_threshold: Duration,
    /// Upper bound for `limit`. Also applied when no limit is requested.
    pub max_limit: Option<i64>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold: Duration::from_millis(500),
            max_limit: None,
        }
    }
}

/// Caller-supplied filter parameters. Every field is optional.
///
/// ```json
/// {
///   "fields": ["firstName", "movies.name"],
///   "where": { "movies.name": "M00" },
///   "require": { "pets.name": "P90" },
///   "order": "lastName desc",
///   "eager": "[movies, pets]",
///   "limit": 5,
///   "offset": 2
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterParams {
    pub fields: Vec<String>,
    pub r#where: Option<Value>,
    pub require: Option<Value>,
    pub order: Option<String>,
    pub eager: Option<EagerSpec>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Builds filtered queries for one root entity.
///
/// ```no_run
/// # async fn run(pool: sqlx::PgPool, schema: std::sync::Arc<rillfilter::SchemaRegistry>) -> rillfilter::Result<()> {
/// use rillfilter::{FilterParams, FilterQueryBuilder};
///
/// let mut builder = FilterQueryBuilder::new(schema, "Person")?.allow_eager("[movies, pets]")?;
/// let params: FilterParams = serde_json::from_str(r#"{"require": {"pets.name": "P90"}, "eager": "pets"}"#)?;
/// let query = builder.build(&params)?;
/// let (rows, total) = tokio::try_join!(query.fetch_all(&pool), builder.count(&pool))?;
/// # let _ = (rows, total);
/// # Ok(())
/// # }
/// ```
pub struct FilterQueryBuilder {
    schema: Arc<SchemaRegistry>,
    root: Arc<EntitySchema>,
    operators: OperatorRegistry,
    config: FilterConfig,
    allowed: Option<RelationExpression>,
    count_plan: Option<QueryPlan>,
}

impl FilterQueryBuilder {
    pub fn new(schema: Arc<SchemaRegistry>, entity: &str) -> Result<Self> {
        let root = schema.entity(entity)?;
        Ok(Self {
            schema,
            root,
            operators: OperatorRegistry::new(),
            config: FilterConfig::default(),
            allowed: None,
            count_plan: None,
        })
    }

    /// Registers a custom operator. It overrides a built-in of the same name.
    pub fn operator<F>(mut self, name: impl Into<String>, handler: F) -> Result<Self>
    where
        F: Fn(&ColumnRef, &Value) -> Result<Predicate> + Send + Sync + 'static,
    {
        self.operators.register(name, handler)?;
        Ok(self)
    }

    pub fn with_operators(mut self, operators: OperatorRegistry) -> Self {
        self.operators = operators;
        self
    }

    pub fn with_config(mut self, config: FilterConfig) -> Self {
        self.config = config;
        self
    }

    /// Restricts eager loading, and the relations `require` may join, to the
    /// paths in `expression`.
    pub fn allow_eager(mut self, expression: &str) -> Result<Self> {
        self.allowed = Some(RelationExpression::parse(expression)?);
        Ok(self)
    }

    pub fn entity(&self) -> &Arc<EntitySchema> {
        &self.root
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Validates and compiles `params`. No SQL runs here. On success the
    /// plan used by [`Self::count`] is replaced.
    #[instrument(skip_all, fields(entity = %self.root.name))]
    pub fn build(&mut self, params: &FilterParams) -> Result<BuiltQuery> {
        let m = metrics::metrics();
        m.builds_total.fetch_add(1, Ordering::Relaxed);
        match self.build_plans(params) {
            Ok((plan, count_plan)) => {
                debug!(
                    eager = plan.eager().len(),
                    joined = plan.scope().joined.len(),
                    "filter built"
                );
                self.count_plan = Some(count_plan);
                Ok(BuiltQuery {
                    plan,
                    config: self.config.clone(),
                })
            }
            Err(err) => {
                if err.is_validation() {
                    m.validation_failures_total.fetch_add(1, Ordering::Relaxed);
                }
                debug!(error = %err, "filter rejected");
                Err(err)
            }
        }
    }

    fn build_plans(&self, params: &FilterParams) -> Result<(QueryPlan, QueryPlan)> {
        let filter = params
            .r#where
            .as_ref()
            .map(FilterExpression::parse)
            .transpose()?;
        let require = params
            .require
            .as_ref()
            .map(FilterExpression::parse)
            .transpose()?;
        let tree = params
            .eager
            .as_ref()
            .map(EagerTree::parse)
            .transpose()?
            .unwrap_or_default();

        let ctx = BuildContext {
            schema: &self.schema,
            compiler: PredicateCompiler::new(&self.operators),
            eager: &tree,
            allowed: self.allowed.as_ref(),
        };

        let mut plan = QueryPlan::new(self.root.clone());
        plan = apply::fields::apply(&ctx, plan, &params.fields)?;
        if let Some(filter) = &filter {
            plan = apply::where_filter::apply(&ctx, plan, filter)?;
        }
        if let Some(require) = &require {
            plan = apply::require_filter::apply(&ctx, plan, require)?;
        }
        if let Some(root_filter) = tree.filter() {
            plan = apply::require_filter::apply(&ctx, plan, root_filter)?;
        }
        if let Some(order) = &params.order {
            plan = apply::order::apply(&ctx, plan, order)?;
        }

        let count_plan = plan.clone();
        plan = eager::apply(&ctx, plan, &tree)?;
        plan = apply::paging::apply(plan, params.limit, params.offset, self.config.max_limit);
        Ok((plan, count_plan))
    }

    /// Counts rows matching the last built filter, ignoring pagination.
    #[instrument(skip_all, fields(entity = %self.root.name))]
    pub async fn count(&self, pool: &PgPool) -> Result<i64> {
        let plan = self.count_plan.as_ref().ok_or(Error::CountBeforeBuild)?;
        let mut builder = plan.count_query();
        let sql = builder.sql().to_string();
        let start = Instant::now();
        let count = builder
            .build_query_scalar::<i64>()
            .fetch_one(pool)
            .await?;
        metrics::observe_query(
            QueryKind::Count,
            &sql,
            start.elapsed(),
            self.config.slow_query_threshold,
        );
        Ok(count)
    }

    pub fn count_sql(&self) -> Result<String> {
        let plan = self.count_plan.as_ref().ok_or(Error::CountBeforeBuild)?;
        Ok(plan.count_query().sql().to_string())
    }
}

/// One-shot build without custom operators or an eager allow-list.
pub fn build_filter(
    schema: Arc<SchemaRegistry>,
    entity: &str,
    params: &FilterParams,
) -> Result<BuiltQuery> {
    FilterQueryBuilder::new(schema, entity)?.build(params)
}

/// A compiled filter ready to run.
#[derive(Clone, Debug)]
pub struct BuiltQuery {
    plan: QueryPlan,
    config: FilterConfig,
}

impl BuiltQuery {
    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    /// SQL of the root query. Eager relations run as separate batched queries.
    pub fn sql(&self) -> String {
        self.plan.root_query().sql().to_string()
    }

    /// Runs the root query, then loads every eager relation into the
    /// returned documents.
    pub async fn fetch_all(&self, pool: &PgPool) -> Result<Vec<Value>> {
        let mut builder = self.plan.root_query();
        let sql = builder.sql().to_string();
        let start = Instant::now();
        let rows: Vec<(Value,)> = builder.build_query_as().fetch_all(pool).await?;
        metrics::observe_query(
            QueryKind::Root,
            &sql,
            start.elapsed(),
            self.config.slow_query_threshold,
        );

        let mut docs: Vec<Value> = rows.into_iter().map(|(doc,)| doc).collect();
        eager::materialize(pool, &self.plan, &mut docs, self.config.slow_query_threshold).await?;
        debug!(rows = docs.len(), "filter query fetched");
        Ok(docs)
    }

    pub async fn fetch_as<T: DeserializeOwned>(&self, pool: &PgPool) -> Result<Vec<T>> {
        self.fetch_all(pool)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(Error::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::test_support::schema;
    use crate::query::Operator;
    use serde_json::json;

    fn builder() -> FilterQueryBuilder {
        FilterQueryBuilder::new(Arc::new(schema()), "Person").unwrap()
    }

    fn params(value: Value) -> FilterParams {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn params_deserialize() {
        let p = params(json!({
            "fields": ["firstName"],
            "where": {"firstName": "F01"},
            "eager": {"movies": true},
            "limit": 5
        }));
        assert_eq!(p.fields, ["firstName"]);
        assert_eq!(p.r#where, Some(json!({"firstName": "F01"})));
        assert!(matches!(p.eager, Some(EagerSpec::Object(_))));
        assert_eq!(p.limit, Some(5));
        assert!(serde_json::from_value::<FilterParams>(json!({"filter": {}})).is_err());
    }

    #[test]
    fn count_requires_a_build() {
        let err = builder().count_sql().unwrap_err();
        assert!(matches!(err, Error::CountBeforeBuild));
    }

    #[test]
    fn count_snapshot_skips_order_and_paging() {
        let mut builder = builder();
        let query = builder
            .build(&params(json!({
                "where": {"lastName": {"$like": "L%"}},
                "order": "lastName desc",
                "limit": 5,
                "offset": 2
            })))
            .unwrap();
        assert_eq!(
            builder.count_sql().unwrap(),
            r#"select count(*) as count from "persons" where ("persons"."lastName" like $1)"#
        );
        assert_eq!(
            query.sql(),
            concat!(
                r#"select to_jsonb("persons") as doc from "persons""#,
                r#" where ("persons"."lastName" like $1) order by "persons"."lastName" desc"#,
                " limit $2 offset $3"
            )
        );
    }

    #[test]
    fn root_eager_where_narrows_the_count() {
        let mut builder = builder();
        builder
            .build(&params(json!({
                "eager": {"$where": {"pets.name": "P00"}, "pets": true}
            })))
            .unwrap();
        assert!(builder.count_sql().unwrap().contains(r#"as "filter_query""#));
    }

    #[test]
    fn failed_build_keeps_previous_snapshot() {
        let mut builder = builder();
        builder.build(&params(json!({"where": {"age": 3}}))).unwrap();
        let before = builder.count_sql().unwrap();
        let err = builder
            .build(&params(json!({"where": {"age": {"$between": [1, 2]}}})))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownOperator { .. }));
        assert_eq!(builder.count_sql().unwrap(), before);
    }

    #[test]
    fn custom_operators_reach_the_compiler() {
        let mut builder = builder()
            .operator("$between", |column, value| {
                let bounds = value
                    .as_array()
                    .filter(|b| b.len() == 2)
                    .ok_or_else(|| Error::InvalidExpressionShape("$between".into()))?;
                Ok(Predicate::and(vec![
                    Predicate::compare(column.clone(), Operator::Gte, bounds[0].clone()),
                    Predicate::compare(column.clone(), Operator::Lte, bounds[1].clone()),
                ]))
            })
            .unwrap();
        let query = builder
            .build(&params(json!({"where": {"age": {"$between": [10, 20]}}})))
            .unwrap();
        assert!(query.sql().ends_with(r#"where (("persons"."age" >= $1) and ("persons"."age" <= $2))"#));
    }

    #[test]
    fn allow_eager_rejects_other_relations() {
        let mut builder = builder().allow_eager("[movies.category, pets]").unwrap();
        builder
            .build(&params(json!({"eager": "movies.category"})))
            .unwrap();
        let err = builder
            .build(&params(json!({"eager": "[pets, parent]"})))
            .unwrap_err();
        assert!(matches!(err, Error::DisallowedEagerPath(ref path) if path == "parent"));
        let err = builder
            .build(&params(json!({"require": {"parent.firstName": "F00"}})))
            .unwrap_err();
        assert!(matches!(err, Error::DisallowedEagerPath(_)));
    }

    #[test]
    fn allow_eager_checks_relation_names_behind_aliases() {
        let mut builder = builder().allow_eager("movies").unwrap();
        builder
            .build(&params(json!({"eager": {"favorites": {"$relation": "movies"}}})))
            .unwrap();
        let err = builder
            .build(&params(json!({"eager": {"favorites": {"$relation": "pets"}}})))
            .unwrap_err();
        assert!(matches!(err, Error::DisallowedEagerPath(ref path) if path == "pets"));
    }

    #[test]
    fn max_limit_applies() {
        let mut builder = builder().with_config(FilterConfig {
            max_limit: Some(10),
            ..FilterConfig::default()
        });
        let query = builder.build(&params(json!({"limit": 50}))).unwrap();
        assert_eq!(query.plan().limit(), Some(10));
    }
}
