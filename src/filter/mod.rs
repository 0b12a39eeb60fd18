//! Filter expression grammar.
//!
//! Raw JSON is parsed into [`FilterExpression`] first, which rejects malformed
//! shapes, and only then compiled against a schema by [`PredicateCompiler`].
//!
//! ```text
//! expression := { entry, ... }                 entries are ANDed
//! entry      := "$and": [expression, ...]
//!             | "$or":  [expression, ...]
//!             | "<dotted.property>": condition
//! condition  := literal                        equality
//!             | { "$op": operand, ... }        operators are ANDed
//!             | { "$and" | "$or": [condition, ...] }
//! ```

pub mod compile;
pub mod operators;

use serde_json::{Map, Value};

use crate::{Error, PropertyPath, Result};

pub use compile::{CompiledFilter, PredicateCompiler};
pub use operators::{BuiltinOperator, CustomOperator, OperatorRegistry};

const AND: &str = "$and";
const OR: &str = "$or";

/// One filter object: its nodes are implicitly ANDed in input order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterExpression(Vec<FilterNode>);

#[derive(Clone, Debug, PartialEq)]
pub enum FilterNode {
    Property {
        path: PropertyPath,
        condition: Condition,
    },
    And(Vec<FilterExpression>),
    Or(Vec<FilterExpression>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    /// Literal equality. `null` means "is null".
    Value(Value),
    Operator { name: String, operand: Value },
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl FilterExpression {
    pub fn new(nodes: Vec<FilterNode>) -> Self {
        Self(nodes)
    }

    pub fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::Object(map) => Self::parse_map(map),
            other => Err(Error::shape(format!(
                "a filter must be an object, got `{other}`"
            ))),
        }
    }

    pub fn parse_map(map: &Map<String, Value>) -> Result<Self> {
        map.iter()
            .map(|(key, value)| FilterNode::parse(key, value))
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    pub fn nodes(&self) -> &[FilterNode] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every property referenced anywhere in the expression, in input order.
    pub fn property_paths(&self) -> Vec<&PropertyPath> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a PropertyPath>) {
        for node in &self.0 {
            match node {
                FilterNode::Property { path, .. } => out.push(path),
                FilterNode::And(items) | FilterNode::Or(items) => {
                    for item in items {
                        item.collect_paths(out);
                    }
                }
            }
        }
    }
}

impl FilterNode {
    fn parse(key: &str, value: &Value) -> Result<Self> {
        match key {
            AND | OR => {
                let items = value.as_array().ok_or_else(|| {
                    Error::shape(format!("`{key}` expects an array of filter objects"))
                })?;
                let items = items
                    .iter()
                    .map(FilterExpression::parse)
                    .collect::<Result<Vec<_>>>()?;
                Ok(if key == AND {
                    FilterNode::And(items)
                } else {
                    FilterNode::Or(items)
                })
            }
            _ if key.starts_with('$') => Err(Error::shape(format!(
                "`{key}` is not allowed at filter level; operators belong under a property"
            ))),
            _ => Ok(FilterNode::Property {
                path: PropertyPath::from(key),
                condition: Condition::parse(key, value)?,
            }),
        }
    }
}

impl Condition {
    fn parse(property: &str, value: &Value) -> Result<Self> {
        match value {
            Value::Object(map) => {
                if map.is_empty() {
                    return Err(Error::shape(format!(
                        "empty operator object on `{property}`"
                    )));
                }
                let mut conditions = map
                    .iter()
                    .map(|(name, operand)| Self::parse_entry(property, name, operand))
                    .collect::<Result<Vec<_>>>()?;
                Ok(if conditions.len() == 1 {
                    conditions.remove(0)
                } else {
                    Condition::And(conditions)
                })
            }
            Value::Array(_) => Err(Error::shape(format!(
                "`{property}` cannot be compared to an array; use `$in`"
            ))),
            literal => Ok(Condition::Value(literal.clone())),
        }
    }

    fn parse_entry(property: &str, name: &str, operand: &Value) -> Result<Self> {
        match name {
            AND | OR => {
                let items = operand.as_array().ok_or_else(|| {
                    Error::shape(format!("`{name}` on `{property}` expects an array"))
                })?;
                let items = items
                    .iter()
                    .map(|item| Self::parse(property, item))
                    .collect::<Result<Vec<_>>>()?;
                Ok(if name == AND {
                    Condition::And(items)
                } else {
                    Condition::Or(items)
                })
            }
            _ if name.starts_with('$') => Ok(Condition::Operator {
                name: name.to_string(),
                operand: operand.clone(),
            }),
            _ => Err(Error::shape(format!(
                "`{property}` has a nested key `{name}`; use a dotted path instead"
            ))),
        }
    }
}
