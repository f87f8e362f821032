//! Directive parser
//!
//! A directive is configured as two brace-delimited strings plus a template
//! query:
//!
//! ```text
//! name:  {Replace}{ConditionValue}
//! value: {FetchXml}{parentaccountid(account)(primarycontactid)}
//! ```
//!
//! `name` supplies the command and action. `value` starts with the template
//! source kind; the remaining segments carry parenthesised argument tokens.
//! Anything malformed yields [`RevisionDirective::Inert`], which every revisor
//! treats as a no-op.

use crate::ast::QueryTree;
use crate::config::PluginSettings;
use crate::fetch_xml::QueryConverter;
use crate::trace::TraceSink;
use crate::trace_line;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Append,
    Adjust,
    Replace,
    Interchange,
    Populate,
    Maneuver,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Append => "Append",
            Command::Adjust => "Adjust",
            Command::Replace => "Replace",
            Command::Interchange => "Interchange",
            Command::Populate => "Populate",
            Command::Maneuver => "Maneuver",
        }
    }
}

impl FromStr for Command {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Append" => Ok(Command::Append),
            "Adjust" => Ok(Command::Adjust),
            "Replace" => Ok(Command::Replace),
            "Interchange" => Ok(Command::Interchange),
            "Populate" => Ok(Command::Populate),
            "Maneuver" => Ok(Command::Maneuver),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Condition,
    Criteria,
    Filter,
    LinkEntity,
    ConditionValue,
    ConditionAttributeValue,
    LinkEntityColumn,
    ConditionLinkEntity,
    ConditionLinkEntityNotExists,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Condition => "Condition",
            Action::Criteria => "Criteria",
            Action::Filter => "Filter",
            Action::LinkEntity => "LinkEntity",
            Action::ConditionValue => "ConditionValue",
            Action::ConditionAttributeValue => "ConditionAttributeValue",
            Action::LinkEntityColumn => "LinkEntityColumn",
            Action::ConditionLinkEntity => "ConditionLinkEntity",
            Action::ConditionLinkEntityNotExists => "ConditionLinkEntityNotExists",
        }
    }
}

impl FromStr for Action {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Condition" => Ok(Action::Condition),
            "Criteria" => Ok(Action::Criteria),
            "Filter" => Ok(Action::Filter),
            "LinkEntity" => Ok(Action::LinkEntity),
            "ConditionValue" => Ok(Action::ConditionValue),
            "ConditionAttributeValue" => Ok(Action::ConditionAttributeValue),
            "LinkEntityColumn" => Ok(Action::LinkEntityColumn),
            "ConditionLinkEntity" => Ok(Action::ConditionLinkEntity),
            "ConditionLinkEntityNotExists" => Ok(Action::ConditionLinkEntityNotExists),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the template query comes from. FetchXml is the only supported kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateSource {
    FetchXml,
}

impl FromStr for TemplateSource {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FetchXml" => Ok(TemplateSource::FetchXml),
            _ => Err(()),
        }
    }
}

/// Why a directive was not built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InertReason {
    EmptyInput,
    TooFewSegments,
    UnsupportedSource(String),
    TemplateConversion(String),
    UnknownCommand(String),
    UnknownAction(String),
}

impl fmt::Display for InertReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InertReason::EmptyInput => f.write_str("name, value or template is empty"),
            InertReason::TooFewSegments => f.write_str("name needs two segments and value at least one"),
            InertReason::UnsupportedSource(s) => write!(f, "unsupported template source '{}'", s),
            InertReason::TemplateConversion(e) => write!(f, "template conversion failed: {}", e),
            InertReason::UnknownCommand(s) => write!(f, "unknown command '{}'", s),
            InertReason::UnknownAction(s) => write!(f, "unknown action '{}'", s),
        }
    }
}

/// A parsed, immutable directive. Can be applied to any number of queries.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    command: Command,
    action: Action,
    source: TemplateSource,
    template: QueryTree,
    segments: Vec<String>,
}

impl Directive {
    pub fn command(&self) -> Command {
        self.command
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn source(&self) -> TemplateSource {
        self.source
    }

    pub fn template(&self) -> &QueryTree {
        &self.template
    }

    /// Brace segments of the value string; segment 0 is the template source.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn segment(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }

    /// Argument tokens of the first segment after the source.
    pub fn arguments(&self) -> Vec<String> {
        self.segment_arguments(1)
    }

    /// Parenthesised tokens of segment `index`; empty when the segment is absent.
    pub fn segment_arguments(&self, index: usize) -> Vec<String> {
        self.segment(index).map(paren_tokens).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RevisionDirective {
    Inert(InertReason),
    Active(Directive),
}

impl RevisionDirective {
    pub fn parse(
        name: &str,
        value: &str,
        template: &str,
        converter: &dyn QueryConverter,
        trace: &mut dyn TraceSink,
    ) -> Self {
        if name.trim().is_empty() || value.trim().is_empty() || template.trim().is_empty() {
            return RevisionDirective::Inert(InertReason::EmptyInput);
        }

        let name_segments = brace_segments(name);
        let segments = brace_segments(value);
        if name_segments.len() < 2 || segments.is_empty() {
            return RevisionDirective::Inert(InertReason::TooFewSegments);
        }
        let Ok(source) = segments[0].parse::<TemplateSource>() else {
            return RevisionDirective::Inert(InertReason::UnsupportedSource(segments[0].clone()));
        };

        trace_line!(trace, "Config Name/Value: {}/{}", name, value);
        let directive = Self::build(&name_segments, source, segments, template, converter);
        match &directive {
            RevisionDirective::Active(d) => {
                tracing::debug!(command = %d.command, action = %d.action, "directive parsed");
                trace_line!(trace, "Config Command/Action: {}/{}", d.command, d.action);
            }
            RevisionDirective::Inert(reason) => {
                tracing::debug!(%reason, "directive inert");
                trace_line!(trace, "Config Command/Action: {}/{}", name_segments[0], name_segments[1]);
                trace_line!(trace, "Directive inert: {}", reason);
            }
        }
        directive
    }

    fn build(
        name_segments: &[String],
        source: TemplateSource,
        segments: Vec<String>,
        template: &str,
        converter: &dyn QueryConverter,
    ) -> Self {
        let template = match converter.to_query(template) {
            Ok(query) => query,
            Err(e) => return RevisionDirective::Inert(InertReason::TemplateConversion(e.to_string())),
        };
        let Ok(command) = name_segments[0].parse::<Command>() else {
            return RevisionDirective::Inert(InertReason::UnknownCommand(name_segments[0].clone()));
        };
        let Ok(action) = name_segments[1].parse::<Action>() else {
            return RevisionDirective::Inert(InertReason::UnknownAction(name_segments[1].clone()));
        };
        RevisionDirective::Active(Directive {
            command,
            action,
            source,
            template,
            segments,
        })
    }

    /// Builds a directive from a plugin settings document. A missing setting
    /// or template node yields an inert directive.
    pub fn from_settings(
        settings: &PluginSettings,
        key: &str,
        template_node: &str,
        converter: &dyn QueryConverter,
        trace: &mut dyn TraceSink,
    ) -> Self {
        let (name, value) = settings.setting(key).unwrap_or_default();
        let template = settings.cdata(template_node).unwrap_or_default();
        Self::parse(&name, &value, &template, converter, trace)
    }

    pub fn directive(&self) -> Option<&Directive> {
        match self {
            RevisionDirective::Active(d) => Some(d),
            RevisionDirective::Inert(_) => None,
        }
    }

    pub fn is_inert(&self) -> bool {
        matches!(self, RevisionDirective::Inert(_))
    }
}

/// Splits on `{` and `}`, trimming and dropping empty pieces.
pub fn brace_segments(text: &str) -> Vec<String> {
    split_tokens(text, &['{', '}'])
}

/// Splits on `(` and `)`, trimming and dropping empty pieces.
pub fn paren_tokens(text: &str) -> Vec<String> {
    split_tokens(text, &['(', ')'])
}

fn split_tokens(text: &str, delimiters: &[char]) -> Vec<String> {
    text.split(delimiters)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
