//! The remote data service contract.
//!
//! The engine never talks to a network itself; it drives an implementation of
//! [`DataService`] supplied by the host. Calls are synchronous and sequential.

use crate::ast::QueryTree;
use crate::record::{EntityReference, Record};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Paging position sent with each retrieve-multiple call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagingInfo {
    /// Records per page
    pub count: usize,
    /// 1-based page number
    pub page_number: u32,
    /// Continuation cursor from the previous page; `None` for the first page
    pub paging_cookie: Option<String>,
}

impl PagingInfo {
    pub fn first(count: usize) -> Self {
        Self {
            count,
            page_number: 1,
            paging_cookie: None,
        }
    }
}

/// One page of a retrieve-multiple response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityPage {
    pub records: Vec<Record>,
    pub more_records: bool,
    pub paging_cookie: Option<String>,
}

/// A single write inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchRequest {
    Create(Record),
    Update(Record),
    Delete(EntityReference),
    SetState {
        target: EntityReference,
        state: i32,
        status: i32,
    },
}

impl BatchRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            BatchRequest::Create(_) => "Create",
            BatchRequest::Update(_) => "Update",
            BatchRequest::Delete(_) => "Delete",
            BatchRequest::SetState { .. } => "SetState",
        }
    }
}

/// Execution flags sent with a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub continue_on_error: bool,
    pub return_responses: bool,
}

/// The service's answer for one request of a batch, keyed by its index in the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItemResponse {
    pub request_index: usize,
    pub outcome: BatchItemOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchItemOutcome {
    /// `id` is set when the server assigned one (creates)
    Succeeded { id: Option<Uuid> },
    Faulted(Fault),
}

/// A server-side fault, possibly wrapping an inner fault.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fault {
    pub message: String,
    pub inner: Option<Box<Fault>>,
    pub trace_text: Option<String>,
}

impl Fault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_inner(mut self, inner: Fault) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    pub fn with_trace(mut self, trace_text: impl Into<String>) -> Self {
        self.trace_text = Some(trace_text.into());
        self
    }

    /// `MAIN: <message>[INNER: <inner message>]` followed by the trace text on its own line.
    pub fn compose(&self) -> String {
        let inner = self
            .inner
            .as_ref()
            .map(|f| format!("INNER: {}", f.message))
            .unwrap_or_default();
        format!(
            "MAIN: {}{}\n{}",
            self.message,
            inner,
            self.trace_text.as_deref().unwrap_or_default()
        )
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(inner) = &self.inner {
            write!(f, " ({})", inner)?;
        }
        Ok(())
    }
}

/// A failed remote call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServiceError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("service fault: {0}")]
    Fault(Fault),
}

/// The remote procedure boundary.
pub trait DataService {
    /// Executes one page of a query.
    fn retrieve_multiple(&self, query: &QueryTree, paging: &PagingInfo) -> Result<EntityPage, ServiceError>;

    /// Reads a single record by id.
    fn retrieve(&self, entity_name: &str, id: Uuid, columns: &[String]) -> Result<Record, ServiceError>;

    /// Executes a group of writes as one call; the response lists per-request outcomes.
    fn execute_batch(
        &self,
        requests: &[BatchRequest],
        settings: &BatchSettings,
    ) -> Result<Vec<BatchItemResponse>, ServiceError>;
}

impl<S: DataService + ?Sized> DataService for &S {
    fn retrieve_multiple(&self, query: &QueryTree, paging: &PagingInfo) -> Result<EntityPage, ServiceError> {
        (**self).retrieve_multiple(query, paging)
    }

    fn retrieve(&self, entity_name: &str, id: Uuid, columns: &[String]) -> Result<Record, ServiceError> {
        (**self).retrieve(entity_name, id, columns)
    }

    fn execute_batch(
        &self,
        requests: &[BatchRequest],
        settings: &BatchSettings,
    ) -> Result<Vec<BatchItemResponse>, ServiceError> {
        (**self).execute_batch(requests, settings)
    }
}
