//! Paged retrieval
//!
//! ```text
//! page 1, no cookie ──► retrieve_multiple ──► records ──► more_records?
//!      ▲                                                     │ yes
//!      └──── page + 1, cookie from response ◄────────────────┘
//! ```
//!
//! Pages are requested strictly in sequence. A failing page aborts the whole
//! fetch; nothing is retried.

use crate::ast::{FilterNode, QueryTree};
use crate::config::EngineSettings;
use crate::record::Record;
use crate::service::{DataService, PagingInfo, ServiceError};
use crate::sql_compiler::SqlCompiler;
use crate::trace::TraceSink;
use crate::trace_line;

/// Totals of a streamed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchSummary {
    pub pages: u32,
    pub records: usize,
}

pub struct PagedFetcher<'s, S: DataService + ?Sized> {
    service: &'s S,
    page_size: usize,
}

impl<'s, S: DataService + ?Sized> PagedFetcher<'s, S> {
    pub fn new(service: &'s S, page_size: usize) -> Self {
        Self {
            service,
            page_size: page_size.max(1),
        }
    }

    pub fn from_settings(service: &'s S, settings: &EngineSettings) -> Self {
        Self::new(service, settings.record_per_page)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Fetches every page and returns the records in server order.
    pub fn retrieve_all(&self, query: &QueryTree, trace: &mut dyn TraceSink) -> Result<Vec<Record>, ServiceError> {
        let mut records = Vec::new();
        self.retrieve_each(query, trace, |page| records.extend(page))?;
        Ok(records)
    }

    /// Fetches every page, handing each page's records to `on_page` as it arrives.
    pub fn retrieve_each<F>(
        &self,
        query: &QueryTree,
        trace: &mut dyn TraceSink,
        mut on_page: F,
    ) -> Result<FetchSummary, ServiceError>
    where
        F: FnMut(Vec<Record>),
    {
        if tracing::enabled!(tracing::Level::DEBUG) {
            match SqlCompiler::default().compile(query) {
                Ok(compiled) => tracing::debug!(entity = %query.entity_name, sql = %compiled.sql, "paged fetch"),
                Err(e) => tracing::debug!(entity = %query.entity_name, error = %e, "paged fetch"),
            }
        }

        let mut paging = PagingInfo::first(self.page_size);
        let mut summary = FetchSummary::default();
        loop {
            let page = self.service.retrieve_multiple(query, &paging).map_err(|e| {
                tracing::warn!(page = paging.page_number, error = %e, "page retrieval failed");
                e
            })?;
            summary.pages += 1;
            summary.records += page.records.len();
            trace_line!(
                trace,
                "Page {}: {} record(s), more: {}",
                paging.page_number,
                page.records.len(),
                page.more_records
            );
            tracing::trace!(page = paging.page_number, records = page.records.len(), "page received");
            on_page(page.records);

            if !page.more_records {
                break;
            }
            paging.page_number += 1;
            paging.paging_cookie = page.paging_cookie;
        }
        tracing::debug!(pages = summary.pages, records = summary.records, "paged fetch complete");
        Ok(summary)
    }

    /// Fetches the ids of the query's root entity, narrowed by `extra_filters`.
    ///
    /// The query is copied; the caller's tree is left untouched.
    pub fn retrieve_entity_set(
        &self,
        query: &QueryTree,
        extra_filters: &[FilterNode],
        trace: &mut dyn TraceSink,
    ) -> Result<Vec<Record>, ServiceError> {
        let mut query = query.clone();
        query.add_column(query.id_attribute());
        query.criteria.filters.extend(extra_filters.iter().cloned());
        self.retrieve_all(&query, trace)
    }
}
