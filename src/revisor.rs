//! Query revisor
//!
//! Applies one [`RevisionDirective`] to a target query, or to a result set
//! already fetched with it. Each supported `(Command, Action)` pair maps to a
//! rule object; every other pair is a no-op.
//!
//! | Command  | Action                       | Rule                              |
//! |----------|------------------------------|-----------------------------------|
//! | Adjust   | ConditionLinkEntityNotExists | [`AdjustConditionLinkEntityNotExists`] |
//! | Append   | Criteria                     | [`AppendCriteria`]                |
//! | Append   | LinkEntity                   | [`AppendLinkEntity`]              |
//! | Replace  | Condition                    | [`ReplaceCondition`]              |
//! | Replace  | ConditionValue               | [`ReplaceConditionValue`]         |
//! | Replace  | ConditionAttributeValue      | [`ReplaceConditionAttributeValue`]|
//! | Maneuver | ConditionLinkEntity          | [`ManeuverConditionLinkEntity`]   |
//! | Populate | LinkEntityColumn             | [`PopulateLinkEntityColumn`]      |

use crate::ast::QueryTree;
use crate::directive::{Action, Command, Directive, RevisionDirective};
use crate::record::Record;
use crate::rules::{
    AdjustConditionLinkEntityNotExists, AppendCriteria, AppendLinkEntity, ManeuverConditionLinkEntity,
    PopulateLinkEntityColumn, ReplaceCondition, ReplaceConditionAttributeValue, ReplaceConditionValue,
};
use crate::service::{DataService, ServiceError};
use crate::trace::TraceSink;
use crate::trace_line;
use std::fmt;

/// What applying a directive did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionOutcome {
    Applied,
    /// The query did not have the structure the rule needs; nothing changed
    Skipped(StructuralMismatch),
    /// No rule is registered for the directive (or the directive is inert)
    NoRule,
}

impl RevisionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, RevisionOutcome::Applied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralMismatch {
    SegmentCount { expected: &'static str, found: usize },
    TokenCount { segment: usize, expected: &'static str, found: usize },
    MissingColumn(String),
    MissingAnchor(String),
    MissingSystemJoin,
    MissingTemplateJoin(String),
    MissingCondition(String),
    MissingJoinPath,
    Reserved,
}

impl fmt::Display for StructuralMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructuralMismatch::SegmentCount { expected, found } => {
                write!(f, "expected {} value segments, found {}", expected, found)
            }
            StructuralMismatch::TokenCount { segment, expected, found } => {
                write!(f, "expected {} tokens in segment {}, found {}", expected, segment, found)
            }
            StructuralMismatch::MissingColumn(c) => write!(f, "column '{}' is not projected", c),
            StructuralMismatch::MissingAnchor(a) => write!(f, "no anchor filter on '{}'", a),
            StructuralMismatch::MissingSystemJoin => f.write_str("system link entity not found"),
            StructuralMismatch::MissingTemplateJoin(a) => write!(f, "template has no link entity aliased '{}'", a),
            StructuralMismatch::MissingCondition(a) => write!(f, "no id condition on '{}'", a),
            StructuralMismatch::MissingJoinPath => f.write_str("link entity path not found"),
            StructuralMismatch::Reserved => f.write_str("action is reserved"),
        }
    }
}

/// A rewrite of the target query.
pub trait QueryRule: Sync {
    fn apply(
        &self,
        directive: &Directive,
        query: &mut QueryTree,
        service: &dyn DataService,
        trace: &mut dyn TraceSink,
    ) -> Result<RevisionOutcome, ServiceError>;
}

/// A post-processing pass over records fetched with the target query.
pub trait CollectionRule: Sync {
    fn apply(
        &self,
        directive: &Directive,
        query: &QueryTree,
        records: &mut [Record],
        trace: &mut dyn TraceSink,
    ) -> RevisionOutcome;
}

/// Rule registered for a `(Command, Action)` pair, if any.
pub fn query_rule(command: Command, action: Action) -> Option<&'static dyn QueryRule> {
    let rule: &'static dyn QueryRule = match (command, action) {
        (Command::Adjust, Action::ConditionLinkEntityNotExists) => &AdjustConditionLinkEntityNotExists,
        (Command::Append, Action::Criteria) => &AppendCriteria,
        (Command::Append, Action::LinkEntity) => &AppendLinkEntity,
        (Command::Replace, Action::Condition) => &ReplaceCondition,
        (Command::Replace, Action::ConditionValue) => &ReplaceConditionValue,
        (Command::Replace, Action::ConditionAttributeValue) => &ReplaceConditionAttributeValue,
        (Command::Maneuver, Action::ConditionLinkEntity) => &ManeuverConditionLinkEntity,
        _ => return None,
    };
    Some(rule)
}

pub fn collection_rule(command: Command, action: Action) -> Option<&'static dyn CollectionRule> {
    match (command, action) {
        (Command::Populate, Action::LinkEntityColumn) => Some(&PopulateLinkEntityColumn),
        _ => None,
    }
}

pub struct QueryRevisor<'d> {
    directive: &'d RevisionDirective,
}

impl<'d> QueryRevisor<'d> {
    pub fn new(directive: &'d RevisionDirective) -> Self {
        Self { directive }
    }

    /// Applies the directive to `query`. Only remote lookups can fail.
    pub fn revise_query(
        &self,
        query: &mut QueryTree,
        service: &dyn DataService,
        trace: &mut dyn TraceSink,
    ) -> Result<RevisionOutcome, ServiceError> {
        let Some(directive) = self.directive.directive() else {
            return Ok(RevisionOutcome::NoRule);
        };
        let Some(rule) = query_rule(directive.command(), directive.action()) else {
            tracing::debug!(command = %directive.command(), action = %directive.action(), "no query rule");
            return Ok(RevisionOutcome::NoRule);
        };
        let outcome = rule.apply(directive, query, service, trace)?;
        log_outcome(directive, &outcome, trace);
        Ok(outcome)
    }

    /// Applies the directive to records already fetched with `query`.
    pub fn revise_collection(
        &self,
        query: &QueryTree,
        records: &mut [Record],
        trace: &mut dyn TraceSink,
    ) -> RevisionOutcome {
        let Some(directive) = self.directive.directive() else {
            return RevisionOutcome::NoRule;
        };
        let Some(rule) = collection_rule(directive.command(), directive.action()) else {
            return RevisionOutcome::NoRule;
        };
        let outcome = rule.apply(directive, query, records, trace);
        log_outcome(directive, &outcome, trace);
        outcome
    }
}

fn log_outcome(directive: &Directive, outcome: &RevisionOutcome, trace: &mut dyn TraceSink) {
    match outcome {
        RevisionOutcome::Skipped(reason) => {
            tracing::debug!(command = %directive.command(), action = %directive.action(), %reason, "revision skipped");
            trace_line!(trace, "Skipped: {}", reason);
        }
        RevisionOutcome::Applied => {
            tracing::debug!(command = %directive.command(), action = %directive.action(), "revision applied");
        }
        RevisionOutcome::NoRule => {}
    }
}
