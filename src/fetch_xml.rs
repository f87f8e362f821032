//! FetchXml ⇄ QueryTree conversion.
//!
//! Link-entity naming follows FetchXml: `name` is the joined entity, `from` is
//! the attribute on the joined entity and `to` is the attribute on the parent.
//! In a [`JoinSpec`] those become `to_entity`, `to_attribute` and
//! `from_attribute` respectively.

use crate::ast::{
    Condition, ConditionOperator, FilterNode, JoinSpec, JoinType, LogicalOperator, OrderBy, QueryTree,
};
use crate::parser::{escape, parse_markup, Element, ParseError};
use crate::record::Value;
use std::fmt::Write;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchXmlError {
    #[error("markup error: {0}")]
    Markup(#[from] ParseError),
    #[error("expected <{expected}>, found <{found}>")]
    UnexpectedElement { expected: String, found: String },
    #[error("<{element}> is missing attribute '{attribute}'")]
    MissingAttribute { element: String, attribute: String },
    #[error("invalid value '{value}' for '{attribute}'")]
    InvalidValue { attribute: String, value: String },
    #[error("unknown condition operator '{0}'")]
    UnknownOperator(String),
    #[error("{0}")]
    Arity(String),
}

/// Converts between a [`QueryTree`] and its markup form. Stands in for the
/// remote query service's conversion messages.
pub trait QueryConverter {
    fn to_query(&self, markup: &str) -> Result<QueryTree, FetchXmlError>;
    fn to_markup(&self, query: &QueryTree) -> String;
}

/// The built-in FetchXml codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchXml;

impl QueryConverter for FetchXml {
    fn to_query(&self, markup: &str) -> Result<QueryTree, FetchXmlError> {
        parse_fetch_xml(markup)
    }

    fn to_markup(&self, query: &QueryTree) -> String {
        to_fetch_xml(query)
    }
}

pub fn parse_fetch_xml(markup: &str) -> Result<QueryTree, FetchXmlError> {
    let root = parse_markup(markup)?;
    expect_element(&root, "fetch")?;

    let entity = root.child("entity").ok_or_else(|| FetchXmlError::UnexpectedElement {
        expected: "entity".to_string(),
        found: root.elements().next().map(|e| e.name.clone()).unwrap_or_default(),
    })?;
    let entity_name = required(entity, "name")?;
    if entity_name.trim().is_empty() {
        return Err(FetchXmlError::InvalidValue {
            attribute: "name".to_string(),
            value: entity_name.to_string(),
        });
    }

    let mut query = QueryTree::new(entity_name);
    query.distinct = flag(&root, "distinct")?;
    if let Some(top) = root.attribute("top") {
        query.top = Some(top.parse().map_err(|_| FetchXmlError::InvalidValue {
            attribute: "top".to_string(),
            value: top.to_string(),
        })?);
    }

    let mut filters = Vec::new();
    for child in entity.elements() {
        match child.name.as_str() {
            "attribute" => query.add_column(required(child, "name")?),
            "all-attributes" => query.all_columns = true,
            "order" => query.orders.push(OrderBy {
                attribute: required(child, "attribute")?.to_string(),
                descending: flag(child, "descending")?,
            }),
            "filter" => filters.push(parse_filter(child)?),
            "link-entity" => query.joins.push(parse_link_entity(child, entity_name)?),
            other => {
                return Err(FetchXmlError::UnexpectedElement {
                    expected: "attribute, order, filter or link-entity".to_string(),
                    found: other.to_string(),
                })
            }
        }
    }
    query.criteria = merge_filters(filters);
    Ok(query)
}

/// The first `<filter>` is the node itself; any further siblings nest under it.
fn merge_filters(filters: Vec<FilterNode>) -> FilterNode {
    let mut filters = filters.into_iter();
    match filters.next() {
        Some(mut first) => {
            first.filters.extend(filters);
            first
        }
        None => FilterNode::default(),
    }
}

fn parse_link_entity(element: &Element, parent_entity: &str) -> Result<JoinSpec, FetchXmlError> {
    let to_entity = required(element, "name")?;
    let mut join = JoinSpec::new(
        parent_entity,
        required(element, "to")?,
        to_entity,
        required(element, "from")?,
    );
    join.alias = element.attribute("alias").unwrap_or_default().to_string();
    join.join_type = match element.attribute("link-type").unwrap_or("inner") {
        "inner" => JoinType::Inner,
        "outer" => JoinType::LeftOuter,
        other => {
            return Err(FetchXmlError::InvalidValue {
                attribute: "link-type".to_string(),
                value: other.to_string(),
            })
        }
    };

    let mut filters = Vec::new();
    for child in element.elements() {
        match child.name.as_str() {
            "attribute" => join.add_column(required(child, "name")?),
            "filter" => filters.push(parse_filter(child)?),
            "link-entity" => join.joins.push(parse_link_entity(child, to_entity)?),
            // Join-level orders and all-attributes carry nothing the tree models
            "order" | "all-attributes" => {}
            other => {
                return Err(FetchXmlError::UnexpectedElement {
                    expected: "attribute, filter or link-entity".to_string(),
                    found: other.to_string(),
                })
            }
        }
    }
    join.criteria = merge_filters(filters);
    Ok(join)
}

fn parse_filter(element: &Element) -> Result<FilterNode, FetchXmlError> {
    let logic = match element.attribute("type").unwrap_or("and") {
        "and" => LogicalOperator::And,
        "or" => LogicalOperator::Or,
        other => {
            return Err(FetchXmlError::InvalidValue {
                attribute: "type".to_string(),
                value: other.to_string(),
            })
        }
    };

    let mut conditions = Vec::new();
    let mut filters = Vec::new();
    for child in element.elements() {
        match child.name.as_str() {
            "condition" => conditions.push(parse_condition(child)?),
            "filter" => filters.push(parse_filter(child)?),
            other => {
                return Err(FetchXmlError::UnexpectedElement {
                    expected: "condition or filter".to_string(),
                    found: other.to_string(),
                })
            }
        }
    }
    Ok(FilterNode::new(logic, conditions, filters))
}

fn parse_condition(element: &Element) -> Result<Condition, FetchXmlError> {
    let attribute = required(element, "attribute")?;
    let operator_name = required(element, "operator")?;
    let operator = ConditionOperator::from_fetch_str(operator_name)
        .ok_or_else(|| FetchXmlError::UnknownOperator(operator_name.to_string()))?;

    let mut values = Vec::new();
    if let Some(value) = element.attribute("value") {
        values.push(Value::from_literal(value));
    }
    for child in element.elements() {
        expect_element(child, "value")?;
        values.push(Value::from_literal(child.text().trim()));
    }

    let mut condition = Condition::new(attribute, operator, values);
    condition.entity_name = element.attribute("entityname").map(str::to_string);
    condition.validate().map_err(FetchXmlError::Arity)?;
    Ok(condition)
}

fn expect_element(element: &Element, name: &str) -> Result<(), FetchXmlError> {
    if element.name == name {
        Ok(())
    } else {
        Err(FetchXmlError::UnexpectedElement {
            expected: name.to_string(),
            found: element.name.clone(),
        })
    }
}

fn required<'e>(element: &'e Element, attribute: &str) -> Result<&'e str, FetchXmlError> {
    element
        .attribute(attribute)
        .ok_or_else(|| FetchXmlError::MissingAttribute {
            element: element.name.clone(),
            attribute: attribute.to_string(),
        })
}

fn flag(element: &Element, attribute: &str) -> Result<bool, FetchXmlError> {
    match element.attribute(attribute) {
        None => Ok(false),
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(other) => Err(FetchXmlError::InvalidValue {
            attribute: attribute.to_string(),
            value: other.to_string(),
        }),
    }
}

/// Serializes a tree as indented FetchXml.
pub fn to_fetch_xml(query: &QueryTree) -> String {
    let mut out = String::new();
    let _ = write!(out, "<fetch mapping=\"logical\"");
    if query.distinct {
        out.push_str(" distinct=\"true\"");
    }
    if let Some(top) = query.top {
        let _ = write!(out, " top=\"{}\"", top);
    }
    out.push_str(">\n");

    let _ = writeln!(out, "  <entity name=\"{}\">", escape(&query.entity_name));
    if query.all_columns {
        out.push_str("    <all-attributes />\n");
    }
    write_columns(&mut out, &query.columns, 2);
    for order in &query.orders {
        let _ = writeln!(
            out,
            "    <order attribute=\"{}\" descending=\"{}\" />",
            escape(&order.attribute),
            order.descending
        );
    }
    if !query.criteria.is_empty() {
        write_filter(&mut out, &query.criteria, 2);
    }
    for join in &query.joins {
        write_link_entity(&mut out, join, 2);
    }
    out.push_str("  </entity>\n</fetch>");
    out
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn write_columns(out: &mut String, columns: &[String], depth: usize) {
    for column in columns {
        indent(out, depth);
        let _ = writeln!(out, "<attribute name=\"{}\" />", escape(column));
    }
}

fn write_link_entity(out: &mut String, join: &JoinSpec, depth: usize) {
    indent(out, depth);
    let _ = write!(
        out,
        "<link-entity name=\"{}\" from=\"{}\" to=\"{}\"",
        escape(&join.to_entity),
        escape(&join.to_attribute),
        escape(&join.from_attribute)
    );
    if !join.alias.is_empty() {
        let _ = write!(out, " alias=\"{}\"", escape(&join.alias));
    }
    if join.join_type == JoinType::LeftOuter {
        out.push_str(" link-type=\"outer\"");
    }
    if join.columns.is_empty() && join.criteria.is_empty() && join.joins.is_empty() {
        out.push_str(" />\n");
        return;
    }
    out.push_str(">\n");
    write_columns(out, &join.columns, depth + 1);
    if !join.criteria.is_empty() {
        write_filter(out, &join.criteria, depth + 1);
    }
    for nested in &join.joins {
        write_link_entity(out, nested, depth + 1);
    }
    indent(out, depth);
    out.push_str("</link-entity>\n");
}

fn write_filter(out: &mut String, filter: &FilterNode, depth: usize) {
    indent(out, depth);
    let logic = match filter.logic {
        LogicalOperator::And => "and",
        LogicalOperator::Or => "or",
    };
    let _ = writeln!(out, "<filter type=\"{}\">", logic);
    for condition in &filter.conditions {
        write_condition(out, condition, depth + 1);
    }
    for nested in &filter.filters {
        write_filter(out, nested, depth + 1);
    }
    indent(out, depth);
    out.push_str("</filter>\n");
}

fn write_condition(out: &mut String, condition: &Condition, depth: usize) {
    indent(out, depth);
    let _ = write!(out, "<condition");
    if let Some(entity_name) = &condition.entity_name {
        let _ = write!(out, " entityname=\"{}\"", escape(entity_name));
    }
    let _ = write!(
        out,
        " attribute=\"{}\" operator=\"{}\"",
        escape(&condition.attribute),
        condition.operator.as_fetch_str()
    );
    match condition.values.as_slice() {
        [] => out.push_str(" />\n"),
        [single] if condition.operator.arity() != crate::ast::Arity::Many => {
            let _ = writeln!(out, " value=\"{}\" />", escape(&single.to_string()));
        }
        values => {
            out.push_str(">\n");
            for value in values {
                indent(out, depth + 1);
                let _ = writeln!(out, "<value>{}</value>", escape(&value.to_string()));
            }
            indent(out, depth);
            out.push_str("</condition>\n");
        }
    }
}
