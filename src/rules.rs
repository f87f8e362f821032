//! The query rewrite rules.
//!
//! Every rule checks its argument counts and structural preconditions first
//! and returns [`RevisionOutcome::Skipped`] without touching the query when one
//! does not hold. Mutation happens only after all checks pass.

use crate::anchor::find_anchor;
use crate::ast::{id_attribute_of, Condition, JoinType, QueryTree};
use crate::directive::Directive;
use crate::record::{EntityReference, Record, Value};
use crate::revisor::{CollectionRule, QueryRule, RevisionOutcome, StructuralMismatch};
use crate::service::{DataService, ServiceError};
use crate::trace::TraceSink;
use crate::trace_line;
use uuid::Uuid;

fn skip(trace: &mut dyn TraceSink, reason: StructuralMismatch) -> RevisionOutcome {
    trace_line!(trace, "Not applicable: {}", reason);
    RevisionOutcome::Skipped(reason)
}

fn position_text(index: Option<usize>) -> String {
    index.map_or_else(|| "-1".to_string(), |i| i.to_string())
}

/// Rewrites an inner join on a 1:N relationship into a left outer join whose
/// joined attribute must be null, i.e. "has no related record".
///
/// Value: `{FetchXml}{entity(attribute)}`
pub struct AdjustConditionLinkEntityNotExists;

impl QueryRule for AdjustConditionLinkEntityNotExists {
    fn apply(
        &self,
        directive: &Directive,
        query: &mut QueryTree,
        _service: &dyn DataService,
        trace: &mut dyn TraceSink,
    ) -> Result<RevisionOutcome, ServiceError> {
        let found = directive.segments().len();
        if found != 2 {
            return Ok(skip(trace, StructuralMismatch::SegmentCount { expected: "2", found }));
        }
        let tokens = directive.segment_arguments(1);
        let [entity, attribute] = tokens.as_slice() else {
            return Ok(skip(
                trace,
                StructuralMismatch::TokenCount { segment: 1, expected: "2", found: tokens.len() },
            ));
        };

        trace_line!(trace, "Expected Filter...");
        if find_anchor(&query.criteria.filters, attribute).is_none() {
            return Ok(skip(trace, StructuralMismatch::MissingAnchor(attribute.clone())));
        }

        let root = query.entity_name.clone();
        let root_id = query.id_attribute();
        let index = query
            .joins
            .iter()
            .position(|j| j.links(&root, &root_id, entity, attribute));
        trace_line!(trace, "System Link Entity: {}", position_text(index));
        let Some(index) = index else {
            return Ok(skip(trace, StructuralMismatch::MissingSystemJoin));
        };

        let join = &mut query.joins[index];
        let anchor = find_anchor(&join.criteria.filters, attribute);
        trace_line!(trace, "Entity/LinkEntity Filter: true/{}", anchor.is_some());
        let Some(anchor) = anchor else {
            return Ok(skip(trace, StructuralMismatch::MissingAnchor(attribute.clone())));
        };

        trace_line!(trace, "Mutating...");
        join.join_type = JoinType::LeftOuter;
        if let Some(filter) = anchor.get_mut(&mut join.criteria.filters) {
            filter.clear_conditions();
        }
        query
            .criteria
            .add_condition(Condition::null(attribute.as_str()).on_entity(entity.as_str()));
        Ok(RevisionOutcome::Applied)
    }
}

/// Appends the template's root conditions and filters to the target's root criteria.
pub struct AppendCriteria;

impl QueryRule for AppendCriteria {
    fn apply(
        &self,
        directive: &Directive,
        query: &mut QueryTree,
        _service: &dyn DataService,
        trace: &mut dyn TraceSink,
    ) -> Result<RevisionOutcome, ServiceError> {
        let template = &directive.template().criteria;
        trace_line!(
            trace,
            "Appending {} condition(s) and {} filter(s)",
            template.conditions.len(),
            template.filters.len()
        );
        query.criteria.conditions.extend(template.conditions.iter().cloned());
        query.criteria.filters.extend(template.filters.iter().cloned());
        Ok(RevisionOutcome::Applied)
    }
}

/// Appends a copy of a template join to the target, merged with the columns
/// of the target's own N:1 join on the same lookup.
///
/// Value: `{FetchXml}{templateAlias}{entity(lookupAttribute)}`
pub struct AppendLinkEntity;

impl QueryRule for AppendLinkEntity {
    fn apply(
        &self,
        directive: &Directive,
        query: &mut QueryTree,
        _service: &dyn DataService,
        trace: &mut dyn TraceSink,
    ) -> Result<RevisionOutcome, ServiceError> {
        let found = directive.segments().len();
        if found != 3 {
            return Ok(skip(trace, StructuralMismatch::SegmentCount { expected: "3", found }));
        }
        let tokens = directive.segment_arguments(2);
        let [entity, attribute] = tokens.as_slice() else {
            return Ok(skip(
                trace,
                StructuralMismatch::TokenCount { segment: 2, expected: "2", found: tokens.len() },
            ));
        };

        trace_line!(trace, "Expected Column...");
        if !query.has_column(attribute) {
            return Ok(skip(trace, StructuralMismatch::MissingColumn(attribute.clone())));
        }
        trace_line!(trace, "Expected Filter...");
        if find_anchor(&query.criteria.filters, attribute).is_none() {
            return Ok(skip(trace, StructuralMismatch::MissingAnchor(attribute.clone())));
        }

        let entity_id = id_attribute_of(entity);
        let system = query
            .joins
            .iter()
            .position(|j| j.links(&query.entity_name, attribute, entity, &entity_id));
        trace_line!(trace, "System Link Entity: {}", position_text(system));

        let alias = directive.segment(1).unwrap_or_default();
        let custom = directive.template().joins.iter().position(|j| j.alias == alias);
        trace_line!(trace, "Custom Link Entity: {}", position_text(custom));
        let Some(custom) = custom else {
            return Ok(skip(trace, StructuralMismatch::MissingTemplateJoin(alias.to_string())));
        };

        trace_line!(trace, "Mutating...");
        let mut join = directive.template().joins[custom].clone();
        if let Some(system) = system {
            for column in &query.joins[system].columns {
                join.add_column(column.as_str());
            }
        }
        query.joins.push(join);
        Ok(RevisionOutcome::Applied)
    }
}

/// Reserved; never changes the query.
pub struct ReplaceCondition;

impl QueryRule for ReplaceCondition {
    fn apply(
        &self,
        _directive: &Directive,
        _query: &mut QueryTree,
        _service: &dyn DataService,
        trace: &mut dyn TraceSink,
    ) -> Result<RevisionOutcome, ServiceError> {
        Ok(skip(trace, StructuralMismatch::Reserved))
    }
}

/// Replaces the id in `attribute = <id>` with an id looked up through the
/// referenced record.
///
/// Value: `{FetchXml}{attribute(entity)(referenceAttribute)}`. Without the
/// lookup tokens the nil id is substituted.
pub struct ReplaceConditionValue;

impl QueryRule for ReplaceConditionValue {
    fn apply(
        &self,
        directive: &Directive,
        query: &mut QueryTree,
        service: &dyn DataService,
        trace: &mut dyn TraceSink,
    ) -> Result<RevisionOutcome, ServiceError> {
        replace_condition(directive, query, service, trace, false)
    }
}

/// Like [`ReplaceConditionValue`], and also renames the condition's attribute.
///
/// Value: `{FetchXml}{attribute(entity)(referenceAttribute)(newAttribute)}`
pub struct ReplaceConditionAttributeValue;

impl QueryRule for ReplaceConditionAttributeValue {
    fn apply(
        &self,
        directive: &Directive,
        query: &mut QueryTree,
        service: &dyn DataService,
        trace: &mut dyn TraceSink,
    ) -> Result<RevisionOutcome, ServiceError> {
        replace_condition(directive, query, service, trace, true)
    }
}

fn replace_condition(
    directive: &Directive,
    query: &mut QueryTree,
    service: &dyn DataService,
    trace: &mut dyn TraceSink,
    rename: bool,
) -> Result<RevisionOutcome, ServiceError> {
    let found = directive.segments().len();
    if found < 2 {
        return Ok(skip(trace, StructuralMismatch::SegmentCount { expected: "at least 2", found }));
    }
    let tokens = directive.segment_arguments(1);
    let (minimum, expected) = if rename { (4, "at least 4") } else { (1, "at least 1") };
    if tokens.len() < minimum {
        return Ok(skip(
            trace,
            StructuralMismatch::TokenCount { segment: 1, expected, found: tokens.len() },
        ));
    }
    let attribute = &tokens[0];

    trace_line!(trace, "Expected Filter...");
    if find_anchor(&query.criteria.filters, attribute).is_none() {
        return Ok(skip(trace, StructuralMismatch::MissingAnchor(attribute.clone())));
    }

    let form = query
        .criteria
        .conditions
        .iter()
        .rposition(|c| c.is_id_equality_on(attribute));
    trace_line!(trace, "Form: {}", position_text(form));

    let mut entity_id = Uuid::nil();
    if let (Some(index), Some(entity), Some(reference)) = (form, tokens.get(1), tokens.get(2)) {
        let form_id = query.criteria.conditions[index]
            .values
            .first()
            .and_then(Value::as_guid)
            .unwrap_or_default();
        let columns = [id_attribute_of(entity), reference.clone()];
        tracing::debug!(entity = %entity, id = %form_id, "looking up referenced record");
        let record = service.retrieve(entity, form_id, &columns)?;
        if let Some(target) = record.get(reference).and_then(Value::as_reference) {
            entity_id = target.id;
            trace_line!(trace, "Id From/To: {}/{}", form_id, entity_id);
        }
    }

    trace_line!(trace, "Mutating...");
    match form {
        Some(index) => {
            let condition = &mut query.criteria.conditions[index];
            if rename {
                condition.attribute = tokens[3].clone();
            }
            condition.values = vec![Value::Guid(entity_id)];
        }
        None => {
            let target = if rename { &tokens[2] } else { attribute };
            query.criteria.add_condition(Condition::equal(target.as_str(), entity_id));
        }
    }
    Ok(RevisionOutcome::Applied)
}

/// Moves `attribute = <id>` from the root criteria into a join reached by a
/// path of (entity, attribute) pairs, and lifts the join's anchor filter to
/// the root in exchange.
///
/// Value: `{FetchXml}{attribute}{entity(linkAttribute)[entity(linkAttribute)...]}`
pub struct ManeuverConditionLinkEntity;

impl QueryRule for ManeuverConditionLinkEntity {
    fn apply(
        &self,
        directive: &Directive,
        query: &mut QueryTree,
        _service: &dyn DataService,
        trace: &mut dyn TraceSink,
    ) -> Result<RevisionOutcome, ServiceError> {
        let found = directive.segments().len();
        if found < 3 {
            return Ok(skip(trace, StructuralMismatch::SegmentCount { expected: "at least 3", found }));
        }
        let attribute = directive.segment(1).unwrap_or_default();
        let tokens = directive.segment_arguments(2);
        if tokens.len() < 2 || tokens.len() % 2 != 0 {
            return Ok(skip(
                trace,
                StructuralMismatch::TokenCount { segment: 2, expected: "an even number of", found: tokens.len() },
            ));
        }

        let form = query
            .criteria
            .conditions
            .iter()
            .rposition(|c| c.is_id_equality_on(attribute));
        trace_line!(trace, "Form: {}", position_text(form));
        let Some(form) = form else {
            return Ok(skip(trace, StructuralMismatch::MissingCondition(attribute.to_string())));
        };

        let path = join_path(query, &tokens);
        trace_line!(trace, "LinkEntity: {:?}", path);
        let Some(path) = path else {
            return Ok(skip(trace, StructuralMismatch::MissingJoinPath));
        };

        let condition = query.criteria.conditions[form].clone();
        let Some(join) = query.join_at_mut(&path) else {
            return Ok(skip(trace, StructuralMismatch::MissingJoinPath));
        };
        let Some(anchor) = find_anchor(&join.criteria.filters, attribute) else {
            return Ok(skip(trace, StructuralMismatch::MissingAnchor(attribute.to_string())));
        };
        let Some(filter) = anchor.remove(&mut join.criteria.filters) else {
            return Ok(skip(trace, StructuralMismatch::MissingAnchor(attribute.to_string())));
        };

        trace_line!(trace, "Mutating...");
        join.criteria.add_condition(condition);
        query.criteria.conditions.remove(form);
        query.criteria.filters.push(filter);
        Ok(RevisionOutcome::Applied)
    }
}

/// Follows `(entity)(attribute)` pairs down the join tree and returns the
/// index path of the last join matched.
///
/// The first step expects the join to land on `<token0>id`; later steps expect
/// the id of the entity matched last. The token index advances by two while it
/// stays within `tokens.len() / 2`, so paths of three or more pairs are only
/// partially walked. A step that matches nothing leaves the walk at the
/// current level.
pub fn join_path(query: &QueryTree, tokens: &[String]) -> Option<Vec<usize>> {
    let first = tokens.first()?;
    let mut link_from = query.entity_name.clone();
    let mut link_to = id_attribute_of(first);
    let mut joins = &query.joins;
    let mut path = Vec::new();

    for i in (0..=tokens.len() / 2).step_by(2) {
        let (Some(entity), Some(attribute)) = (tokens.get(i), tokens.get(i + 1)) else {
            break;
        };
        let matched = joins
            .iter()
            .position(|j| j.links(&link_from, attribute, entity, &link_to));
        if let Some(index) = matched {
            let join = &joins[index];
            path.push(index);
            link_from = join.to_entity.clone();
            link_to = id_attribute_of(&join.to_entity);
            joins = &join.joins;
        }
    }

    if path.is_empty() {
        None
    } else {
        Some(path)
    }
}

/// Denormalizes joined values on fetched records: writes a reference built
/// from the join's aliased id and name under the lookup attribute, and copies
/// every column of the N:1 join from `alias.column` to `column`.
///
/// Value: `{FetchXml}{alias(idAttribute)(nameAttribute)}{entity(lookupAttribute)}`
pub struct PopulateLinkEntityColumn;

impl CollectionRule for PopulateLinkEntityColumn {
    fn apply(
        &self,
        directive: &Directive,
        query: &QueryTree,
        records: &mut [Record],
        trace: &mut dyn TraceSink,
    ) -> RevisionOutcome {
        let found = directive.segments().len();
        if found != 3 {
            return skip(trace, StructuralMismatch::SegmentCount { expected: "3", found });
        }
        let custom = directive.segment_arguments(1);
        let [alias, id_attribute, name_attribute] = custom.as_slice() else {
            return skip(
                trace,
                StructuralMismatch::TokenCount { segment: 1, expected: "3", found: custom.len() },
            );
        };
        let system = directive.segment_arguments(2);
        let [entity, attribute] = system.as_slice() else {
            return skip(
                trace,
                StructuralMismatch::TokenCount { segment: 2, expected: "2", found: system.len() },
            );
        };

        trace_line!(trace, "Expected Column...");
        if !query.has_column(attribute) {
            return skip(trace, StructuralMismatch::MissingColumn(attribute.clone()));
        }
        trace_line!(trace, "Expected Filter...");
        if find_anchor(&query.criteria.filters, attribute).is_none() {
            return skip(trace, StructuralMismatch::MissingAnchor(attribute.clone()));
        }

        let entity_id = id_attribute_of(entity);
        let system_join = query
            .joins
            .iter()
            .position(|j| j.links(&query.entity_name, attribute, entity, &entity_id));
        trace_line!(trace, "System Link Entity: {}", position_text(system_join));
        let columns = system_join
            .map(|i| query.joins[i].columns.as_slice())
            .unwrap_or_default();

        let id_key = format!("{}.{}", alias, id_attribute);
        let name_key = format!("{}.{}", alias, name_attribute);
        trace_line!(trace, "Key Id/Name: {}/{}", id_key, name_key);

        trace_line!(trace, "Mutating...");
        for record in records.iter_mut() {
            let name = record
                .get(&name_key)
                .and_then(|v| v.unaliased().as_str())
                .map(str::to_string);
            if let Some(value) = record.get(&id_key) {
                let logical_name = value
                    .as_aliased()
                    .map_or_else(|| entity.clone(), |a| a.entity_name.clone());
                let id = value.unaliased().as_guid().unwrap_or_default();
                let reference = EntityReference {
                    logical_name,
                    id,
                    name,
                };
                record.set(attribute.as_str(), reference);
            }
            for column in columns {
                let key = format!("{}.{}", alias, column);
                if let Some(value) = record.get(&key) {
                    let flat = value.unaliased().clone();
                    record.set(column.as_str(), flat);
                }
            }
        }
        RevisionOutcome::Applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FilterNode, JoinSpec, LogicalOperator};
    use crate::directive::RevisionDirective;
    use crate::fetch_xml::FetchXml;
    use crate::record::AliasedValue;
    use crate::revisor::QueryRevisor;
    use crate::service::testing::LookupService;
    use crate::trace::{NoTrace, TraceBuffer};
    use proptest::prelude::*;

    const EMPTY_TEMPLATE: &str = r#"<fetch><entity name="account" /></fetch>"#;

    fn parsed(name: &str, value: &str, template: &str) -> RevisionDirective {
        let directive = RevisionDirective::parse(name, value, template, &FetchXml, &mut NoTrace);
        assert!(!directive.is_inert(), "directive {} {} should parse", name, value);
        directive
    }

    fn revise(directive: &RevisionDirective, query: &mut QueryTree, service: &LookupService) -> RevisionOutcome {
        QueryRevisor::new(directive)
            .revise_query(query, service, &mut NoTrace)
            .unwrap()
    }

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn test_replace_condition_value_end_to_end() {
        let g1 = id(1);
        let g2 = id(2);
        let mut query = QueryTree::new("account")
            .with_columns(["name", "parentaccountid"])
            .with_criteria(
                FilterNode::with_conditions(vec![Condition::equal("parentaccountid", g1)])
                    .with_filter(FilterNode::anchor_on("parentaccountid")),
            );
        let service = LookupService::default().with_record(
            Record::new("account")
                .with_id(g1)
                .with("primarycontactid", EntityReference::new("contact", g2)),
        );
        let directive = parsed(
            "{Replace}{ConditionValue}",
            "{FetchXml}{parentaccountid(account)(primarycontactid)}",
            EMPTY_TEMPLATE,
        );

        let mut trace = TraceBuffer::new();
        let outcome = QueryRevisor::new(&directive)
            .revise_query(&mut query, &service, &mut trace)
            .unwrap();

        assert_eq!(outcome, RevisionOutcome::Applied);
        assert_eq!(query.criteria.conditions[0].values, vec![Value::Guid(g2)]);
        assert_eq!(query.criteria.conditions[0].attribute, "parentaccountid");
        let lookups = service.lookups.borrow();
        assert_eq!(lookups.len(), 1);
        assert_eq!(
            lookups[0],
            ("account".to_string(), g1, vec!["accountid".to_string(), "primarycontactid".to_string()])
        );
        assert!(trace.contains("Form: 0"));
        assert!(trace.contains("Mutating..."));
    }

    #[test]
    fn test_replace_condition_value_without_lookup_tokens_uses_nil() {
        let mut query = QueryTree::new("account").with_criteria(
            FilterNode::with_conditions(vec![Condition::equal("parentaccountid", id(7))])
                .with_filter(FilterNode::anchor_on("parentaccountid")),
        );
        let service = LookupService::default();
        let directive = parsed("{Replace}{ConditionValue}", "{FetchXml}{parentaccountid}", EMPTY_TEMPLATE);

        assert!(revise(&directive, &mut query, &service).is_applied());
        assert_eq!(query.criteria.conditions[0].values, vec![Value::Guid(Uuid::nil())]);
        assert!(service.lookups.borrow().is_empty());
    }

    #[test]
    fn test_anchor_removed_by_direct_edit_blocks_rewrite() {
        let form = id(7);
        let mut query = QueryTree::new("account").with_criteria(
            FilterNode::with_conditions(vec![Condition::equal("parentaccountid", form)])
                .with_filter(FilterNode::anchor_on("parentaccountid")),
        );
        query.criteria.filters[0].conditions.clear();
        let before = query.clone();
        let directive = parsed("{Replace}{ConditionValue}", "{FetchXml}{parentaccountid}", EMPTY_TEMPLATE);

        let outcome = revise(&directive, &mut query, &LookupService::default());
        assert_eq!(
            outcome,
            RevisionOutcome::Skipped(StructuralMismatch::MissingAnchor("parentaccountid".to_string()))
        );
        assert_eq!(query, before);

        // A pair pushed straight into the vector counts as an anchor again
        query.criteria.filters[0]
            .conditions
            .extend([Condition::null("parentaccountid"), Condition::not_null("parentaccountid")]);
        assert!(revise(&directive, &mut query, &LookupService::default()).is_applied());
        assert_eq!(query.criteria.conditions[0].values, vec![Value::Guid(Uuid::nil())]);
    }

    #[test]
    fn test_replace_condition_value_appends_when_missing() {
        let mut query =
            QueryTree::new("account").with_criteria(FilterNode::default().with_filter(FilterNode::anchor_on("parentaccountid")));
        let directive = parsed(
            "{Replace}{ConditionValue}",
            "{FetchXml}{parentaccountid(account)(primarycontactid)}",
            EMPTY_TEMPLATE,
        );
        assert!(revise(&directive, &mut query, &LookupService::default()).is_applied());
        assert_eq!(query.criteria.conditions, vec![Condition::equal("parentaccountid", Uuid::nil())]);
    }

    #[test]
    fn test_replace_condition_value_lookup_fault_propagates() {
        let mut query = QueryTree::new("account").with_criteria(
            FilterNode::with_conditions(vec![Condition::equal("parentaccountid", id(1))])
                .with_filter(FilterNode::anchor_on("parentaccountid")),
        );
        let directive = parsed(
            "{Replace}{ConditionValue}",
            "{FetchXml}{parentaccountid(account)(primarycontactid)}",
            EMPTY_TEMPLATE,
        );
        let result = QueryRevisor::new(&directive).revise_query(&mut query, &LookupService::default(), &mut NoTrace);
        assert!(matches!(result, Err(ServiceError::Fault(_))));
    }

    #[test]
    fn test_replace_condition_attribute_value() {
        let g1 = id(10);
        let g2 = id(20);
        let mut query = QueryTree::new("contact").with_criteria(
            FilterNode::with_conditions(vec![Condition::equal("parentcustomerid", g1)])
                .with_filter(FilterNode::anchor_on("parentcustomerid")),
        );
        let service = LookupService::default()
            .with_record(Record::new("account").with_id(g1).with("ownerid", EntityReference::new("systemuser", g2)));
        let directive = parsed(
            "{Replace}{ConditionAttributeValue}",
            "{FetchXml}{parentcustomerid(account)(ownerid)(owninguser)}",
            EMPTY_TEMPLATE,
        );

        assert!(revise(&directive, &mut query, &service).is_applied());
        assert_eq!(query.criteria.conditions, vec![Condition::equal("owninguser", g2)]);
    }

    #[test]
    fn test_replace_condition_attribute_value_needs_four_tokens() {
        let mut query = QueryTree::new("contact").with_criteria(
            FilterNode::with_conditions(vec![Condition::equal("parentcustomerid", id(1))])
                .with_filter(FilterNode::anchor_on("parentcustomerid")),
        );
        let before = query.clone();
        let directive = parsed(
            "{Replace}{ConditionAttributeValue}",
            "{FetchXml}{parentcustomerid(account)(ownerid)}",
            EMPTY_TEMPLATE,
        );
        let outcome = revise(&directive, &mut query, &LookupService::default());
        assert!(matches!(outcome, RevisionOutcome::Skipped(StructuralMismatch::TokenCount { .. })));
        assert_eq!(query, before);
    }

    #[test]
    fn test_replace_condition_is_reserved() {
        let mut query = QueryTree::new("account");
        let directive = parsed("{Replace}{Condition}", "{FetchXml}{name}", EMPTY_TEMPLATE);
        assert_eq!(
            revise(&directive, &mut query, &LookupService::default()),
            RevisionOutcome::Skipped(StructuralMismatch::Reserved)
        );
    }

    fn not_exists_target() -> QueryTree {
        QueryTree::new("account")
            .with_columns(["name"])
            .with_criteria(FilterNode::default().with_filter(FilterNode::anchor_on("parentcustomerid")))
            .with_join(
                JoinSpec::new("account", "accountid", "contact", "parentcustomerid")
                    .with_alias("c")
                    .with_criteria(FilterNode::default().with_filter(FilterNode::anchor_on("parentcustomerid"))),
            )
    }

    #[test]
    fn test_adjust_not_exists() {
        let mut query = not_exists_target();
        let directive = parsed(
            "{Adjust}{ConditionLinkEntityNotExists}",
            "{FetchXml}{contact(parentcustomerid)}",
            EMPTY_TEMPLATE,
        );
        assert!(revise(&directive, &mut query, &LookupService::default()).is_applied());

        let join = &query.joins[0];
        assert_eq!(join.join_type, JoinType::LeftOuter);
        assert!(join.criteria.filters[0].conditions.is_empty());
        assert!(join.criteria.filters[0].anchor().is_none());
        assert_eq!(
            query.criteria.conditions,
            vec![Condition::null("parentcustomerid").on_entity("contact")]
        );
        // The root anchor stays in place
        assert!(query.criteria.filters[0].is_anchor_for("parentcustomerid"));
    }

    #[test]
    fn test_adjust_not_exists_requires_join_anchor() {
        let mut query = not_exists_target();
        query.joins[0].criteria = FilterNode::default();
        let before = query.clone();
        let directive = parsed(
            "{Adjust}{ConditionLinkEntityNotExists}",
            "{FetchXml}{contact(parentcustomerid)}",
            EMPTY_TEMPLATE,
        );
        assert_eq!(
            revise(&directive, &mut query, &LookupService::default()),
            RevisionOutcome::Skipped(StructuralMismatch::MissingAnchor("parentcustomerid".to_string()))
        );
        assert_eq!(query, before);
    }

    #[test]
    fn test_append_criteria() {
        let template = r#"<fetch><entity name="account">
            <filter>
              <condition attribute="statecode" operator="eq" value="0" />
              <filter type="or">
                <condition attribute="revenue" operator="gt" value="100" />
                <condition attribute="revenue" operator="null" />
              </filter>
            </filter>
          </entity></fetch>"#;
        let mut query = QueryTree::new("account")
            .with_criteria(FilterNode::with_conditions(vec![Condition::equal("name", "Contoso")]));
        let directive = parsed("{Append}{Criteria}", "{FetchXml}", template);

        assert!(revise(&directive, &mut query, &LookupService::default()).is_applied());
        assert_eq!(query.criteria.conditions.len(), 2);
        assert_eq!(query.criteria.conditions[1], Condition::equal("statecode", 0i64));
        assert_eq!(query.criteria.filters.len(), 1);
        assert_eq!(query.criteria.filters[0].logic, LogicalOperator::Or);

        // No de-duplication
        assert!(revise(&directive, &mut query, &LookupService::default()).is_applied());
        assert_eq!(query.criteria.conditions.len(), 3);
    }

    const LINK_TEMPLATE: &str = r#"<fetch><entity name="account">
        <link-entity name="contact" from="contactid" to="primarycontactid" alias="pc" link-type="outer">
          <attribute name="fullname" />
        </link-entity>
      </entity></fetch>"#;

    fn link_target() -> QueryTree {
        QueryTree::new("account")
            .with_columns(["name", "primarycontactid"])
            .with_criteria(FilterNode::default().with_filter(FilterNode::anchor_on("primarycontactid")))
            .with_join(
                JoinSpec::new("account", "primarycontactid", "contact", "contactid")
                    .with_alias("sys")
                    .with_columns(["emailaddress1", "fullname"]),
            )
    }

    #[test]
    fn test_append_link_entity_merges_system_columns() {
        let mut query = link_target();
        let directive = parsed("{Append}{LinkEntity}", "{FetchXml}{pc}{contact(primarycontactid)}", LINK_TEMPLATE);

        assert!(revise(&directive, &mut query, &LookupService::default()).is_applied());
        assert_eq!(query.joins.len(), 2);
        let appended = &query.joins[1];
        assert_eq!(appended.alias, "pc");
        assert_eq!(appended.join_type, JoinType::LeftOuter);
        assert_eq!(appended.columns, vec!["fullname".to_string(), "emailaddress1".to_string()]);
    }

    #[test]
    fn test_append_link_entity_twice_duplicates_alias() {
        let mut query = link_target();
        let directive = parsed("{Append}{LinkEntity}", "{FetchXml}{pc}{contact(primarycontactid)}", LINK_TEMPLATE);

        revise(&directive, &mut query, &LookupService::default());
        revise(&directive, &mut query, &LookupService::default());
        let aliases: Vec<_> = query.joins.iter().map(|j| j.alias.as_str()).collect();
        assert_eq!(aliases, vec!["sys", "pc", "pc"]);
    }

    #[test]
    fn test_append_link_entity_requires_column_and_template_join() {
        let directive = parsed("{Append}{LinkEntity}", "{FetchXml}{missing}{contact(primarycontactid)}", LINK_TEMPLATE);
        let mut query = link_target();
        assert_eq!(
            revise(&directive, &mut query, &LookupService::default()),
            RevisionOutcome::Skipped(StructuralMismatch::MissingTemplateJoin("missing".to_string()))
        );

        let mut query = link_target();
        query.columns.retain(|c| c != "primarycontactid");
        let directive = parsed("{Append}{LinkEntity}", "{FetchXml}{pc}{contact(primarycontactid)}", LINK_TEMPLATE);
        assert_eq!(
            revise(&directive, &mut query, &LookupService::default()),
            RevisionOutcome::Skipped(StructuralMismatch::MissingColumn("primarycontactid".to_string()))
        );
    }

    fn maneuver_before(form: Uuid) -> QueryTree {
        QueryTree::new("contact")
            .with_columns(["fullname"])
            .with_criteria(FilterNode::with_conditions(vec![
                Condition::equal("statecode", 0i64),
                Condition::equal("parentcustomerid", form),
            ]))
            .with_join(
                JoinSpec::new("contact", "parentcustomerid", "account", "accountid")
                    .with_alias("a")
                    .with_criteria(FilterNode::default().with_filter(FilterNode::anchor_on("parentcustomerid"))),
            )
    }

    #[test]
    fn test_maneuver_swaps_condition_and_anchor() {
        let form = id(42);
        let mut query = maneuver_before(form);
        let directive = parsed(
            "{Maneuver}{ConditionLinkEntity}",
            "{FetchXml}{parentcustomerid}{account(parentcustomerid)}",
            EMPTY_TEMPLATE,
        );
        assert!(revise(&directive, &mut query, &LookupService::default()).is_applied());

        let expected = QueryTree::new("contact")
            .with_columns(["fullname"])
            .with_criteria(
                FilterNode::with_conditions(vec![Condition::equal("statecode", 0i64)])
                    .with_filter(FilterNode::anchor_on("parentcustomerid")),
            )
            .with_join(
                JoinSpec::new("contact", "parentcustomerid", "account", "accountid")
                    .with_alias("a")
                    .with_criteria(FilterNode::with_conditions(vec![Condition::equal("parentcustomerid", form)])),
            );
        assert_eq!(query, expected);

        // Moving the pieces back by hand restores the original tree
        let mut restored = query.clone();
        let filter = restored.criteria.filters.remove(0);
        let condition = restored.joins[0].criteria.conditions.remove(0);
        restored.joins[0].criteria.filters.push(filter);
        restored.criteria.add_condition(condition);
        assert_eq!(restored, maneuver_before(form));
    }

    #[test]
    fn test_maneuver_moves_nested_anchor_once() {
        let form = id(5);
        let mut query = maneuver_before(form);
        query.joins[0].criteria = FilterNode::with_conditions(vec![Condition::equal("statecode", 0i64)])
            .with_filter(FilterNode::default().with_filter(FilterNode::anchor_on("parentcustomerid")));
        let directive = parsed(
            "{Maneuver}{ConditionLinkEntity}",
            "{FetchXml}{parentcustomerid}{account(parentcustomerid)}",
            EMPTY_TEMPLATE,
        );
        assert!(revise(&directive, &mut query, &LookupService::default()).is_applied());

        let join = &query.joins[0];
        assert!(join.criteria.filters[0].filters.is_empty());
        assert_eq!(query.criteria.filters.len(), 1);
        assert!(query.criteria.filters[0].is_anchor_for("parentcustomerid"));
    }

    #[test]
    fn test_maneuver_walks_nested_joins() {
        let form = id(9);
        let mut query = QueryTree::new("incident")
            .with_criteria(FilterNode::with_conditions(vec![Condition::equal("ownerid", form)]))
            .with_join(
                JoinSpec::new("incident", "customerid", "account", "accountid").with_join(
                    JoinSpec::new("account", "accountid", "contact", "accountid")
                        .with_criteria(FilterNode::default().with_filter(FilterNode::anchor_on("ownerid"))),
                ),
            );
        let directive = parsed(
            "{Maneuver}{ConditionLinkEntity}",
            "{FetchXml}{ownerid}{account(customerid)contact(accountid)}",
            EMPTY_TEMPLATE,
        );
        assert!(revise(&directive, &mut query, &LookupService::default()).is_applied());
        let terminal = query.join_at(&[0, 0]).unwrap();
        assert_eq!(terminal.criteria.conditions, vec![Condition::equal("ownerid", form)]);
        assert!(query.criteria.conditions.is_empty());
    }

    #[test]
    fn test_maneuver_requires_form_condition() {
        let mut query = maneuver_before(id(1));
        query.criteria.conditions.pop();
        let before = query.clone();
        let directive = parsed(
            "{Maneuver}{ConditionLinkEntity}",
            "{FetchXml}{parentcustomerid}{account(parentcustomerid)}",
            EMPTY_TEMPLATE,
        );
        assert_eq!(
            revise(&directive, &mut query, &LookupService::default()),
            RevisionOutcome::Skipped(StructuralMismatch::MissingCondition("parentcustomerid".to_string()))
        );
        assert_eq!(query, before);
    }

    fn populate_query() -> QueryTree {
        QueryTree::new("account")
            .with_columns(["name", "primarycontactid"])
            .with_criteria(FilterNode::default().with_filter(FilterNode::anchor_on("primarycontactid")))
            .with_join(
                JoinSpec::new("account", "primarycontactid", "contact", "contactid")
                    .with_alias("sys")
                    .with_columns(["extra"]),
            )
    }

    #[test]
    fn test_populate_link_entity_column() {
        let contact = id(77);
        let mut records = vec![
            Record::new("account")
                .with("pc.contactid", AliasedValue::new("pc", "contact", "contactid", Value::Guid(contact)))
                .with("pc.fullname", AliasedValue::new("pc", "contact", "fullname", "Yvonne".into()))
                .with("pc.extra", AliasedValue::new("pc", "contact", "extra", Value::Int(3))),
            Record::new("account").with("name", "No contact"),
        ];
        let directive = parsed(
            "{Populate}{LinkEntityColumn}",
            "{FetchXml}{pc(contactid)(fullname)}{contact(primarycontactid)}",
            EMPTY_TEMPLATE,
        );

        let outcome = QueryRevisor::new(&directive).revise_collection(&populate_query(), &mut records, &mut NoTrace);
        assert_eq!(outcome, RevisionOutcome::Applied);

        let reference = records[0].get("primarycontactid").and_then(Value::as_reference).unwrap();
        assert_eq!(reference, &EntityReference::new("contact", contact).with_name("Yvonne"));
        assert_eq!(records[0].get("extra"), Some(&Value::Int(3)));
        assert!(!records[1].contains("primarycontactid"));
        assert!(!records[1].contains("extra"));
    }

    #[test]
    fn test_populate_requires_anchor() {
        let mut query = populate_query();
        query.criteria = FilterNode::default();
        let mut records = vec![Record::new("account")
            .with("pc.contactid", AliasedValue::new("pc", "contact", "contactid", Value::Guid(id(1))))];
        let before = records.clone();
        let directive = parsed(
            "{Populate}{LinkEntityColumn}",
            "{FetchXml}{pc(contactid)(fullname)}{contact(primarycontactid)}",
            EMPTY_TEMPLATE,
        );
        let outcome = QueryRevisor::new(&directive).revise_collection(&query, &mut records, &mut NoTrace);
        assert!(matches!(outcome, RevisionOutcome::Skipped(StructuralMismatch::MissingAnchor(_))));
        assert_eq!(records, before);
    }

    /// A chain of `depth` joins where each step matches the next token pair.
    fn chain(depth: usize) -> (QueryTree, Vec<String>) {
        let mut tokens = Vec::new();
        let mut joins: Option<JoinSpec> = None;
        let entities: Vec<String> = (0..depth).map(|i| format!("e{}", i)).collect();
        for i in (0..depth).rev() {
            let from = if i == 0 { "root".to_string() } else { entities[i - 1].clone() };
            let to = if i == 0 { id_attribute_of(&entities[0]) } else { id_attribute_of(&entities[i - 1]) };
            let mut join = JoinSpec::new(from, format!("link{}", i), entities[i].clone(), to);
            if let Some(child) = joins.take() {
                join = join.with_join(child);
            }
            joins = Some(join);
        }
        for (i, entity) in entities.iter().enumerate() {
            tokens.push(entity.clone());
            tokens.push(format!("link{}", i));
        }
        let mut query = QueryTree::new("root");
        if let Some(join) = joins {
            query = query.with_join(join);
        }
        (query, tokens)
    }

    /// Filters that come close to an anchor on `attribute` without being one.
    fn near_miss(shape: u8, attribute: &str) -> Vec<FilterNode> {
        let lone_null = || FilterNode::with_conditions(vec![Condition::null(attribute)]);
        let lone_not_null = || FilterNode::with_conditions(vec![Condition::not_null(attribute)]);
        match shape {
            0 => vec![lone_null()],
            1 => vec![lone_not_null()],
            2 => vec![FilterNode::anchor_on("ownerid")],
            3 => vec![FilterNode::default().with_filter(FilterNode::default().with_filter(FilterNode::anchor_on(attribute)))],
            4 => vec![lone_null(), lone_not_null()],
            _ => vec![FilterNode::default().with_filter(lone_null()).with_filter(lone_not_null())],
        }
    }

    proptest! {
        #[test]
        fn prop_join_path_bound(depth in 1usize..8) {
            let (query, tokens) = chain(depth);
            let walked = join_path(&query, &tokens).map_or(0, |p| p.len());
            prop_assert_eq!(walked, depth.min(depth / 2 + 1));
        }

        #[test]
        fn prop_no_anchor_leaves_query_unchanged(
            conditions in prop::collection::vec((0usize..3, 0u8..4, any::<u128>()), 0..6),
            shapes in prop::collection::vec((0u8..6, 0usize..3), 0..4),
            joined in any::<bool>(),
        ) {
            let attributes = ["parentaccountid", "primarycontactid", "parentcustomerid"];
            let mut root = FilterNode::default();
            for (attribute, op, value) in conditions {
                let condition = match op {
                    0 => Condition::equal(attributes[attribute], Uuid::from_u128(value)),
                    1 => Condition::null(attributes[attribute]),
                    2 => Condition::not_null(attributes[attribute]),
                    _ => Condition::equal("statecode", (value % 3) as i64),
                };
                root.add_condition(condition);
            }
            // A root-level pair is not an anchor; only nested filters count
            let nested: Vec<FilterNode> = shapes
                .into_iter()
                .flat_map(|(shape, attribute)| near_miss(shape, attributes[attribute]))
                .collect();
            root.filters.extend(nested.iter().cloned());
            let mut query = QueryTree::new("account")
                .with_columns(attributes)
                .with_criteria(root);
            if joined {
                query = query
                    .with_join(JoinSpec::new("account", "accountid", "contact", "parentcustomerid"))
                    .with_join(JoinSpec::new("account", "primarycontactid", "contact", "contactid").with_alias("sys"))
                    .with_join(JoinSpec::new("account", "parentaccountid", "contact", "contactid"));
                for join in &mut query.joins {
                    join.criteria.filters.extend(nested.iter().cloned());
                }
            }
            let before = query.clone();

            let directives = [
                ("{Adjust}{ConditionLinkEntityNotExists}", "{FetchXml}{contact(parentcustomerid)}"),
                ("{Append}{LinkEntity}", "{FetchXml}{pc}{contact(primarycontactid)}"),
                ("{Replace}{ConditionValue}", "{FetchXml}{parentaccountid(account)(primarycontactid)}"),
                ("{Replace}{ConditionAttributeValue}", "{FetchXml}{parentaccountid(account)(primarycontactid)(ownerid)}"),
                ("{Maneuver}{ConditionLinkEntity}", "{FetchXml}{parentaccountid}{contact(parentaccountid)}"),
            ];
            let service = LookupService::default();
            for (name, value) in directives {
                let directive = parsed(name, value, LINK_TEMPLATE);
                let outcome = QueryRevisor::new(&directive).revise_query(&mut query, &service, &mut NoTrace);
                prop_assert!(matches!(outcome, Ok(RevisionOutcome::Skipped(_))));
                prop_assert_eq!(&query, &before);
            }
            prop_assert!(service.lookups.borrow().is_empty());

            let populate = parsed(
                "{Populate}{LinkEntityColumn}",
                "{FetchXml}{pc(contactid)(fullname)}{contact(primarycontactid)}",
                LINK_TEMPLATE,
            );
            let mut records = vec![Record::new("account")
                .with("pc.contactid", AliasedValue::new("pc", "contact", "contactid", Value::Guid(Uuid::from_u128(1))))];
            let records_before = records.clone();
            QueryRevisor::new(&populate).revise_collection(&query, &mut records, &mut NoTrace);
            prop_assert_eq!(records, records_before);
        }
    }
}
