use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::query::{ColumnRef, Operator, Predicate};
use crate::{Error, Result};

/// A caller-supplied operator: turns a qualified column and the raw operand
/// into a predicate.
pub type CustomOperator = Arc<dyn Fn(&ColumnRef, &Value) -> Result<Predicate> + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuiltinOperator {
    Equals,
    NotEquals,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Like,
    ILike,
    Exists,
    Null,
}

impl BuiltinOperator {
    pub const ALL: [(&'static str, BuiltinOperator); 13] = [
        ("$equals", BuiltinOperator::Equals),
        ("$eq", BuiltinOperator::Equals),
        ("$ne", BuiltinOperator::NotEquals),
        ("$gt", BuiltinOperator::Gt),
        ("$gte", BuiltinOperator::Gte),
        ("$lt", BuiltinOperator::Lt),
        ("$lte", BuiltinOperator::Lte),
        ("$in", BuiltinOperator::In),
        ("$nin", BuiltinOperator::NotIn),
        ("$like", BuiltinOperator::Like),
        ("$ilike", BuiltinOperator::ILike),
        ("$exists", BuiltinOperator::Exists),
        ("$null", BuiltinOperator::Null),
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, op)| *op)
    }

    pub fn build(self, column: &ColumnRef, operand: &Value, name: &str) -> Result<Predicate> {
        let column = column.clone();
        match self {
            BuiltinOperator::Equals => Ok(match operand {
                Value::Null => Predicate::is_null(column),
                value => Predicate::compare(column, Operator::Eq, scalar(name, value)?),
            }),
            BuiltinOperator::NotEquals => Ok(match operand {
                Value::Null => Predicate::is_not_null(column),
                value => Predicate::compare(column, Operator::Ne, scalar(name, value)?),
            }),
            BuiltinOperator::Gt => ordered(column, Operator::Gt, operand, name),
            BuiltinOperator::Gte => ordered(column, Operator::Gte, operand, name),
            BuiltinOperator::Lt => ordered(column, Operator::Lt, operand, name),
            BuiltinOperator::Lte => ordered(column, Operator::Lte, operand, name),
            BuiltinOperator::In => list(column, Operator::In, operand, name),
            BuiltinOperator::NotIn => list(column, Operator::NotIn, operand, name),
            BuiltinOperator::Like => pattern(column, Operator::Like, operand, name),
            BuiltinOperator::ILike => pattern(column, Operator::ILike, operand, name),
            BuiltinOperator::Exists => Ok(if flag(name, operand)? {
                Predicate::is_not_null(column)
            } else {
                Predicate::is_null(column)
            }),
            BuiltinOperator::Null => Ok(if flag(name, operand)? {
                Predicate::is_null(column)
            } else {
                Predicate::is_not_null(column)
            }),
        }
    }
}

fn scalar(name: &str, value: &Value) -> Result<Value> {
    match value {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => Ok(value.clone()),
        other => Err(Error::shape(format!(
            "`{name}` expects a scalar, got `{other}`"
        ))),
    }
}

fn ordered(column: ColumnRef, operator: Operator, operand: &Value, name: &str) -> Result<Predicate> {
    match operand {
        Value::String(_) | Value::Number(_) => {
            Ok(Predicate::compare(column, operator, operand.clone()))
        }
        other => Err(Error::shape(format!(
            "`{name}` expects a number or string, got `{other}`"
        ))),
    }
}

fn list(column: ColumnRef, operator: Operator, operand: &Value, name: &str) -> Result<Predicate> {
    let items = operand
        .as_array()
        .ok_or_else(|| Error::shape(format!("`{name}` expects an array")))?;
    let items = items
        .iter()
        .map(|item| scalar(name, item))
        .collect::<Result<Vec<_>>>()?;
    Ok(Predicate::compare(column, operator, Value::Array(items)))
}

fn pattern(column: ColumnRef, operator: Operator, operand: &Value, name: &str) -> Result<Predicate> {
    match operand {
        Value::String(_) => Ok(Predicate::compare(column, operator, operand.clone())),
        other => Err(Error::shape(format!(
            "`{name}` expects a string pattern, got `{other}`"
        ))),
    }
}

fn flag(name: &str, operand: &Value) -> Result<bool> {
    operand
        .as_bool()
        .ok_or_else(|| Error::shape(format!("`{name}` expects true or false")))
}

#[derive(Clone)]
pub enum OperatorHandler {
    Builtin(BuiltinOperator),
    Custom(CustomOperator),
}

impl fmt::Debug for OperatorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorHandler::Builtin(op) => f.debug_tuple("Builtin").field(op).finish(),
            OperatorHandler::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Maps operator names to predicate constructors. Custom operators shadow
/// built-ins with the same name.
#[derive(Clone, Default)]
pub struct OperatorRegistry {
    custom: HashMap<String, CustomOperator>,
}

impl fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.custom.keys().collect();
        names.sort();
        f.debug_struct("OperatorRegistry")
            .field("custom", &names)
            .finish()
    }
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> Result<&mut Self>
    where
        F: Fn(&ColumnRef, &Value) -> Result<Predicate> + Send + Sync + 'static,
    {
        let name = name.into();
        validate_name(&name)?;
        self.custom.insert(name, Arc::new(handler));
        Ok(self)
    }

    pub fn resolve(&self, name: &str) -> Option<OperatorHandler> {
        if let Some(custom) = self.custom.get(name) {
            return Some(OperatorHandler::Custom(custom.clone()));
        }
        BuiltinOperator::from_name(name).map(OperatorHandler::Builtin)
    }

    /// Builds the predicate for `name` applied to `column`. `property` is the
    /// user-facing path reported on failure.
    pub fn apply(
        &self,
        name: &str,
        column: &ColumnRef,
        operand: &Value,
        property: &str,
    ) -> Result<Predicate> {
        match self.resolve(name) {
            Some(OperatorHandler::Builtin(op)) => op.build(column, operand, name),
            Some(OperatorHandler::Custom(handler)) => handler(column, operand),
            None => Err(Error::UnknownOperator {
                operator: name.to_string(),
                property: property.to_string(),
            }),
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = name
        .strip_prefix('$')
        .is_some_and(|rest| {
            !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
        && name != "$and"
        && name != "$or";
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidOperatorName(name.to_string()))
    }
}
