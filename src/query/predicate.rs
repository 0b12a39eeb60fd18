use std::fmt;

use serde_json::Value;
use sqlx::{Postgres, QueryBuilder, types::Json};

use crate::schema::quote_ident;

/// A column qualified by the table or join alias it is read from. When the
/// column's Postgres type is known, string operands are cast to it.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
    pub sql_type: Option<String>,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            sql_type: None,
        }
    }

    pub fn typed(mut self, sql_type: Option<&str>) -> Self {
        self.sql_type = sql_type.map(str::to_string);
        self
    }

    pub(crate) fn push_sql(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        builder.push(quote_ident(&self.table));
        builder.push(".");
        builder.push(quote_ident(&self.column));
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Like,
    ILike,
    IsNull,
    IsNotNull,
}

impl Operator {
    fn as_sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::In => "in",
            Operator::NotIn => "not in",
            Operator::Like => "like",
            Operator::ILike => "ilike",
            Operator::IsNull => "is null",
            Operator::IsNotNull => "is not null",
        }
    }
}

/// Compiled boolean tree. Built fresh for every compile and consumed by the
/// plan renderer.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Comparison {
        column: ColumnRef,
        operator: Operator,
        value: Value,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(column: ColumnRef, operator: Operator, value: impl Into<Value>) -> Self {
        Self::Comparison {
            column,
            operator,
            value: value.into(),
        }
    }

    pub fn eq(column: ColumnRef, value: impl Into<Value>) -> Self {
        Self::compare(column, Operator::Eq, value)
    }

    pub fn is_null(column: ColumnRef) -> Self {
        Self::compare(column, Operator::IsNull, Value::Null)
    }

    pub fn is_not_null(column: ColumnRef) -> Self {
        Self::compare(column, Operator::IsNotNull, Value::Null)
    }

    pub fn negate(predicate: Predicate) -> Self {
        Self::Not(Box::new(predicate))
    }

    pub fn and(predicates: Vec<Predicate>) -> Self {
        Self::And(predicates)
    }

    pub fn or(predicates: Vec<Predicate>) -> Self {
        Self::Or(predicates)
    }

    pub(crate) fn push_sql(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Predicate::Comparison {
                column,
                operator,
                value,
            } => push_comparison(builder, column, *operator, value),
            Predicate::Not(inner) => {
                builder.push("not (");
                inner.push_sql(builder);
                builder.push(")");
            }
            Predicate::And(predicates) => push_group(builder, predicates, " and ", "true"),
            Predicate::Or(predicates) => push_group(builder, predicates, " or ", "false"),
        }
    }
}

fn push_group(
    builder: &mut QueryBuilder<'_, Postgres>,
    predicates: &[Predicate],
    separator: &str,
    identity: &str,
) {
    if predicates.is_empty() {
        builder.push(identity);
        return;
    }
    builder.push("(");
    let mut iter = predicates.iter();
    if let Some(first) = iter.next() {
        first.push_sql(builder);
    }
    for predicate in iter {
        builder.push(separator);
        predicate.push_sql(builder);
    }
    builder.push(")");
}

fn push_comparison(
    builder: &mut QueryBuilder<'_, Postgres>,
    column: &ColumnRef,
    operator: Operator,
    value: &Value,
) {
    match operator {
        Operator::IsNull | Operator::IsNotNull => {
            builder.push("(");
            column.push_sql(builder);
            builder.push(" ");
            builder.push(operator.as_sql());
            builder.push(")");
        }
        Operator::In | Operator::NotIn => {
            let values = value.as_array().map(Vec::as_slice).unwrap_or_default();
            if values.is_empty() {
                builder.push(if operator == Operator::In { "false" } else { "true" });
                return;
            }
            builder.push("(");
            column.push_sql(builder);
            builder.push(" ");
            builder.push(operator.as_sql());
            builder.push(" (");
            let mut first = true;
            for value in values {
                if !first {
                    builder.push(", ");
                }
                first = false;
                push_operand(builder, value, column.sql_type.as_deref());
            }
            builder.push("))");
        }
        Operator::Like | Operator::ILike => {
            builder.push("(");
            column.push_sql(builder);
            builder.push(" ");
            builder.push(operator.as_sql());
            builder.push(" ");
            push_bind_value(builder, value);
            builder.push(")");
        }
        _ => {
            builder.push("(");
            column.push_sql(builder);
            builder.push(" ");
            builder.push(operator.as_sql());
            builder.push(" ");
            push_operand(builder, value, column.sql_type.as_deref());
            builder.push(")");
        }
    }
}

/// Strings are bound as `text`, which Postgres will not compare against
/// `bigint`, `uuid` or `date` columns. With a known column type they go
/// through `cast($n as <type>)` instead.
fn push_operand(builder: &mut QueryBuilder<'_, Postgres>, value: &Value, sql_type: Option<&str>) {
    match (value, sql_type) {
        (Value::String(_), Some(sql_type)) => {
            builder.push("cast(");
            push_bind_value(builder, value);
            builder.push(" as ");
            builder.push(sql_type);
            builder.push(")");
        }
        _ => push_bind_value(builder, value),
    }
}

/// Binds a JSON scalar with its natural Postgres type so it compares against
/// ordinary columns. Arrays and objects are bound as `jsonb`.
pub(crate) fn push_bind_value(builder: &mut QueryBuilder<'_, Postgres>, value: &Value) {
    match value {
        Value::String(s) => {
            builder.push_bind(s.clone());
        }
        Value::Bool(b) => {
            builder.push_bind(*b);
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                builder.push_bind(i);
            } else {
                builder.push_bind(n.as_f64().unwrap_or_default());
            }
        }
        Value::Null => {
            builder.push_bind(Option::<String>::None);
        }
        other => {
            builder.push_bind(Json(other.clone()));
        }
    }
}
