//! Rule-driven rewriting of entity queries.
//!
//! A [`RevisionDirective`] parsed from plugin settings names one rewrite rule
//! and its arguments. [`QueryRevisor`] applies it to a [`QueryTree`] before the
//! query runs, or to the fetched records afterwards. [`PagedFetcher`] and
//! [`BatchExecutor`] drive reads and writes against a [`DataService`].

pub mod anchor;
pub mod ast;
pub mod batch;
pub mod config;
pub mod directive;
pub mod fetch_xml;
pub mod lexer;
pub mod paging;
pub mod parser;
pub mod record;
pub mod revisor;
pub mod rules;
pub mod service;
pub mod sql_compiler;
pub mod token;
pub mod trace;

pub use ast::{Condition, ConditionOperator, FilterNode, JoinSpec, JoinType, LogicalOperator, QueryTree};
pub use batch::{BatchError, BatchExecutor, BatchOutcome, Operation};
pub use config::{ConfigError, EngineSettings, PluginSettings};
pub use directive::{Action, Command, Directive, RevisionDirective};
pub use fetch_xml::{parse_fetch_xml, to_fetch_xml, FetchXml, QueryConverter};
pub use paging::PagedFetcher;
pub use record::{EntityReference, Record, Value};
pub use revisor::{QueryRevisor, RevisionOutcome};
pub use service::{DataService, ServiceError};
pub use sql_compiler::SqlCompiler;
pub use trace::{NoTrace, TraceBuffer, TraceSink};
