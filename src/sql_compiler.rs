//! Renders a [`QueryTree`] as a PostgreSQL SELECT using sea-query.
//!
//! Used for diagnostics: the REPL's `:sql` command and debug logging of
//! paged fetches. Joins become `JOIN ... ON parent.from = alias.to`, with the
//! join's own criteria added to the ON clause. Conditions carrying an
//! `entity_name` qualifier are resolved against that alias.

use crate::ast::{Condition, ConditionOperator, FilterNode, JoinSpec, JoinType as AstJoinType, LogicalOperator, QueryTree};
use crate::config::EngineSettings;
use crate::record::Value;
use sea_query::{
    Asterisk, Cond, Expr, Iden, JoinType, Order, PostgresQueryBuilder, SelectStatement, SimpleExpr,
    Value as SqlValue,
};
use std::collections::HashMap;
use thiserror::Error;

/// Configuration for SQL optimization
#[derive(Debug, Clone)]
pub struct OptimizationConfig {
    /// Minimum number of OR'ed equalities on one attribute before converting to IN
    pub max_or_conditions_for_in: usize,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            max_or_conditions_for_in: 3,
        }
    }
}

/// Table identifier
#[derive(Debug, Clone)]
pub struct TableName(pub String);

impl Iden for TableName {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        let _ = write!(s, "{}", self.0);
    }
}

/// Column identifier
#[derive(Debug, Clone)]
pub struct ColumnName(pub String);

impl Iden for ColumnName {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        let _ = write!(s, "{}", self.0);
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
}

impl CompileError {
    fn new(message: String) -> Self {
        Self { message }
    }
}

/// Represents an optimization applied during compilation
#[derive(Debug, Clone, PartialEq)]
pub enum Optimization {
    OrToIn { field: String, value_count: usize },
}

/// Result of SQL compilation with optimization information
#[derive(Debug)]
pub struct CompileResult {
    pub sql: String,
    pub optimizations: Vec<Optimization>,
}

#[derive(Debug, Clone, Default)]
pub struct SqlCompiler {
    config: OptimizationConfig,
    /// Maps entity names to table names
    table_mapping: HashMap<String, String>,
}

impl SqlCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: OptimizationConfig) -> Self {
        Self {
            config,
            table_mapping: HashMap::new(),
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        let mut compiler = Self::new();
        compiler.set_table_mapping(settings.table_mappings.clone());
        compiler
    }

    pub fn set_table_mapping(&mut self, mapping: HashMap<String, String>) {
        self.table_mapping = mapping;
    }

    fn table_name(&self, entity: &str) -> String {
        self.table_mapping
            .get(entity)
            .cloned()
            .unwrap_or_else(|| entity.to_string())
    }

    pub fn compile(&self, query: &QueryTree) -> Result<CompileResult, CompileError> {
        if query.entity_name.trim().is_empty() {
            return Err(CompileError::new("query has no entity name".to_string()));
        }
        let mut optimizations = Vec::new();
        let root = query.entity_name.as_str();

        let mut select = SelectStatement::new();
        select.from_as(TableName(self.table_name(root)), TableName(root.to_string()));
        if query.all_columns || query.columns.is_empty() {
            select.column(Asterisk);
        }
        for column in &query.columns {
            select.column((TableName(root.to_string()), ColumnName(column.clone())));
        }
        if query.distinct {
            select.distinct();
        }

        let mut join_count = 0;
        for join in &query.joins {
            self.compile_join(&mut select, join, root, &mut join_count, &mut optimizations)?;
        }

        if let Some(cond) = self.compile_filter(&query.criteria, root, &mut optimizations)? {
            select.cond_where(cond);
        }
        for order in &query.orders {
            let direction = if order.descending { Order::Desc } else { Order::Asc };
            select.order_by((TableName(root.to_string()), ColumnName(order.attribute.clone())), direction);
        }
        if let Some(top) = query.top {
            select.limit(u64::from(top));
        }

        Ok(CompileResult {
            sql: select.to_string(PostgresQueryBuilder),
            optimizations,
        })
    }

    fn compile_join(
        &self,
        select: &mut SelectStatement,
        join: &JoinSpec,
        parent: &str,
        join_count: &mut usize,
        optimizations: &mut Vec<Optimization>,
    ) -> Result<(), CompileError> {
        *join_count += 1;
        let alias = if join.alias.is_empty() {
            format!("{}_{}", join.to_entity, join_count)
        } else {
            join.alias.clone()
        };

        let mut on = Cond::all().add(
            Expr::col((TableName(parent.to_string()), ColumnName(join.from_attribute.clone())))
                .equals((TableName(alias.clone()), ColumnName(join.to_attribute.clone()))),
        );
        if let Some(criteria) = self.compile_filter(&join.criteria, &alias, optimizations)? {
            on = on.add(criteria);
        }
        let join_type = match join.join_type {
            AstJoinType::Inner => JoinType::InnerJoin,
            AstJoinType::LeftOuter => JoinType::LeftJoin,
        };
        select.join_as(
            join_type,
            TableName(self.table_name(&join.to_entity)),
            TableName(alias.clone()),
            on,
        );
        for column in &join.columns {
            select.column((TableName(alias.clone()), ColumnName(column.clone())));
        }

        for nested in &join.joins {
            self.compile_join(select, nested, &alias, join_count, optimizations)?;
        }
        Ok(())
    }

    /// `None` for a filter with nothing in it.
    fn compile_filter(
        &self,
        filter: &FilterNode,
        table: &str,
        optimizations: &mut Vec<Optimization>,
    ) -> Result<Option<Cond>, CompileError> {
        if filter.is_empty() {
            return Ok(None);
        }
        if let Some(expr) = self.try_optimize_or_to_in(filter, table, optimizations)? {
            return Ok(Some(Cond::all().add(expr)));
        }

        let mut cond = match filter.logic {
            LogicalOperator::And => Cond::all(),
            LogicalOperator::Or => Cond::any(),
        };
        for condition in &filter.conditions {
            cond = cond.add(self.compile_condition(condition, table)?);
        }
        for nested in &filter.filters {
            if let Some(nested) = self.compile_filter(nested, table, optimizations)? {
                cond = cond.add(nested);
            }
        }
        Ok(Some(cond))
    }

    /// An OR group made only of equalities on one attribute becomes `IN (...)`.
    fn try_optimize_or_to_in(
        &self,
        filter: &FilterNode,
        table: &str,
        optimizations: &mut Vec<Optimization>,
    ) -> Result<Option<SimpleExpr>, CompileError> {
        if filter.logic != LogicalOperator::Or
            || !filter.filters.is_empty()
            || filter.conditions.len() < self.config.max_or_conditions_for_in
        {
            return Ok(None);
        }
        let first = &filter.conditions[0];
        let same_equality = filter.conditions.iter().all(|c| {
            c.operator == ConditionOperator::Equal
                && c.attribute == first.attribute
                && c.entity_name == first.entity_name
                && c.values.len() == 1
        });
        if !same_equality {
            return Ok(None);
        }

        let values: Vec<SqlValue> = filter.conditions.iter().map(|c| to_sql_value(&c.values[0])).collect();
        optimizations.push(Optimization::OrToIn {
            field: first.attribute.clone(),
            value_count: values.len(),
        });
        let table = first.entity_name.as_deref().unwrap_or(table);
        Ok(Some(
            Expr::col((TableName(table.to_string()), ColumnName(first.attribute.clone()))).is_in(values),
        ))
    }

    fn compile_condition(&self, condition: &Condition, table: &str) -> Result<SimpleExpr, CompileError> {
        condition.validate().map_err(CompileError::new)?;
        let table = condition.entity_name.as_deref().unwrap_or(table);
        let col = Expr::col((TableName(table.to_string()), ColumnName(condition.attribute.clone())));
        let mut values = condition.values.iter().map(to_sql_value);
        let mut single = || {
            values
                .next()
                .ok_or_else(|| CompileError::new(format!("condition on '{}' has no value", condition.attribute)))
        };

        let expr = match condition.operator {
            ConditionOperator::Equal => col.eq(single()?),
            ConditionOperator::NotEqual => col.ne(single()?),
            ConditionOperator::GreaterThan => col.gt(single()?),
            ConditionOperator::GreaterEqual => col.gte(single()?),
            ConditionOperator::LessThan => col.lt(single()?),
            ConditionOperator::LessEqual => col.lte(single()?),
            ConditionOperator::Like => col.like(like_pattern(condition)),
            ConditionOperator::NotLike => col.not_like(like_pattern(condition)),
            ConditionOperator::In => col.is_in(condition.values.iter().map(to_sql_value)),
            ConditionOperator::NotIn => col.is_not_in(condition.values.iter().map(to_sql_value)),
            ConditionOperator::Null => col.is_null(),
            ConditionOperator::NotNull => col.is_not_null(),
        };
        Ok(expr)
    }
}

fn like_pattern(condition: &Condition) -> String {
    condition.values.first().map(Value::to_string).unwrap_or_default()
}

/// Ids and references are compared as their text form.
fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::String(None),
        Value::Bool(b) => SqlValue::Bool(Some(*b)),
        Value::Int(n) => SqlValue::BigInt(Some(*n)),
        Value::Float(x) => SqlValue::Double(Some(*x)),
        Value::String(s) => SqlValue::String(Some(Box::new(s.clone()))),
        Value::Guid(id) => SqlValue::String(Some(Box::new(id.to_string()))),
        Value::OptionSet(n) => SqlValue::Int(Some(*n)),
        Value::Reference(r) => SqlValue::String(Some(Box::new(r.id.to_string()))),
        Value::Aliased(a) => to_sql_value(&a.value),
    }
}
