use std::collections::BTreeSet;

use crate::filter::{Condition, FilterExpression, FilterNode, OperatorRegistry};
use crate::query::{ColumnRef, Predicate};
use crate::{PropertyPath, Result};

/// Output of a compile: the predicate tree plus every relation path the
/// expression actually referenced.
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledFilter {
    pub predicate: Predicate,
    pub relations: BTreeSet<String>,
}

/// Walks a [`FilterExpression`] and emits a [`Predicate`]. Column
/// qualification is delegated to a rewriter so the same walk serves both
/// per-scope and joined-scope filtering.
#[derive(Clone, Copy, Debug)]
pub struct PredicateCompiler<'a> {
    operators: &'a OperatorRegistry,
}

impl<'a> PredicateCompiler<'a> {
    pub fn new(operators: &'a OperatorRegistry) -> Self {
        Self { operators }
    }

    pub fn compile<R>(&self, expr: &FilterExpression, rewriter: R) -> Result<CompiledFilter>
    where
        R: Fn(&PropertyPath) -> Result<ColumnRef>,
    {
        let mut relations = BTreeSet::new();
        let predicate = self.expression(expr, &rewriter, &mut relations)?;
        Ok(CompiledFilter {
            predicate,
            relations,
        })
    }

    fn expression<R>(
        &self,
        expr: &FilterExpression,
        rewriter: &R,
        relations: &mut BTreeSet<String>,
    ) -> Result<Predicate>
    where
        R: Fn(&PropertyPath) -> Result<ColumnRef>,
    {
        let mut predicates = expr
            .nodes()
            .iter()
            .map(|node| self.node(node, rewriter, relations))
            .collect::<Result<Vec<_>>>()?;
        Ok(if predicates.len() == 1 {
            predicates.remove(0)
        } else {
            Predicate::And(predicates)
        })
    }

    fn node<R>(
        &self,
        node: &FilterNode,
        rewriter: &R,
        relations: &mut BTreeSet<String>,
    ) -> Result<Predicate>
    where
        R: Fn(&PropertyPath) -> Result<ColumnRef>,
    {
        match node {
            FilterNode::Property { path, condition } => {
                let column = rewriter(path)?;
                if !path.is_root() {
                    relations.insert(path.relation_path());
                }
                self.condition(&column, &path.to_string(), condition)
            }
            FilterNode::And(items) => Ok(Predicate::And(
                items
                    .iter()
                    .map(|item| self.expression(item, rewriter, relations))
                    .collect::<Result<Vec<_>>>()?,
            )),
            FilterNode::Or(items) => Ok(Predicate::Or(
                items
                    .iter()
                    .map(|item| self.expression(item, rewriter, relations))
                    .collect::<Result<Vec<_>>>()?,
            )),
        }
    }

    fn condition(
        &self,
        column: &ColumnRef,
        property: &str,
        condition: &Condition,
    ) -> Result<Predicate> {
        match condition {
            Condition::Value(value) => self.operators.apply("$equals", column, value, property),
            Condition::Operator { name, operand } => {
                self.operators.apply(name, column, operand, property)
            }
            Condition::And(items) => Ok(Predicate::And(
                items
                    .iter()
                    .map(|item| self.condition(column, property, item))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Condition::Or(items) => Ok(Predicate::Or(
                items
                    .iter()
                    .map(|item| self.condition(column, property, item))
                    .collect::<Result<Vec<_>>>()?,
            )),
        }
    }
}
