//! Batched writes
//!
//! Records are turned into one request each and sent in groups of at most
//! `batch_size` requests, one service call per group, with continue-on-error
//! set so one faulting request does not stop the rest of its group. Faults
//! are collected per record; a failed service call stops the run.

use crate::config::EngineSettings;
use crate::record::Record;
use crate::service::{BatchItemOutcome, BatchRequest, BatchSettings, DataService, Fault, ServiceError};
use crate::trace::TraceSink;
use crate::trace_line;
use std::collections::HashMap;
use thiserror::Error;

/// The write applied to every record of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
    SetState { state: i32, status: i32 },
}

impl Operation {
    pub fn request(&self, record: &Record) -> BatchRequest {
        match *self {
            Operation::Create => BatchRequest::Create(record.clone()),
            Operation::Update => BatchRequest::Update(record.clone()),
            Operation::Delete => BatchRequest::Delete(record.to_reference()),
            Operation::SetState { state, status } => BatchRequest::SetState {
                target: record.to_reference(),
                state,
                status,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    pub record: Record,
    /// Composed fault text, see [`Fault::compose`]
    pub reason: String,
}

/// Per-record results in input order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchOutcome {
    pub succeeded: Vec<Record>,
    pub failed: Vec<BatchFailure>,
    /// Service calls completed
    pub batches: usize,
}

impl BatchOutcome {
    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A whole batch call failed. `outcome` holds the results of the batches
/// completed before it; records of the failed batch and later ones are in
/// neither list.
#[derive(Debug, Error)]
#[error("batch {batch} failed: {source}")]
pub struct BatchError {
    /// 0-based index of the failed batch
    pub batch: usize,
    pub source: ServiceError,
    pub outcome: BatchOutcome,
}

pub struct BatchExecutor<'s, S: DataService + ?Sized> {
    service: &'s S,
    batch_size: usize,
    return_responses: bool,
}

impl<'s, S: DataService + ?Sized> BatchExecutor<'s, S> {
    pub fn new(service: &'s S, batch_size: usize) -> Self {
        Self {
            service,
            batch_size: batch_size.max(1),
            return_responses: true,
        }
    }

    pub fn from_settings(service: &'s S, settings: &EngineSettings) -> Self {
        Self::new(service, settings.request_per_batch).with_return_responses(settings.return_responses)
    }

    pub fn with_return_responses(mut self, return_responses: bool) -> Self {
        self.return_responses = return_responses;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn execute(
        &self,
        records: Vec<Record>,
        operation: Operation,
        trace: &mut dyn TraceSink,
    ) -> Result<BatchOutcome, BatchError> {
        let settings = BatchSettings {
            continue_on_error: true,
            return_responses: self.return_responses,
        };
        let mut outcome = BatchOutcome::default();

        for (batch, chunk) in records.chunks(self.batch_size).enumerate() {
            let requests: Vec<BatchRequest> = chunk.iter().map(|r| operation.request(r)).collect();
            let responses = match self.service.execute_batch(&requests, &settings) {
                Ok(responses) => responses,
                Err(source) => {
                    tracing::error!(batch, requests = requests.len(), error = %source, "batch call failed");
                    trace_line!(trace, "Batch {}: call failed: {}", batch + 1, source);
                    return Err(BatchError { batch, source, outcome });
                }
            };

            let by_index: HashMap<usize, BatchItemOutcome> =
                responses.into_iter().map(|r| (r.request_index, r.outcome)).collect();
            let mut faults = 0;
            for (index, record) in chunk.iter().enumerate() {
                let mut record = record.clone();
                match by_index.get(&index) {
                    Some(BatchItemOutcome::Faulted(fault)) => {
                        faults += 1;
                        outcome.failed.push(failure(record, fault));
                    }
                    Some(BatchItemOutcome::Succeeded { id: Some(id) }) => {
                        record.id = Some(*id);
                        outcome.succeeded.push(record);
                    }
                    Some(BatchItemOutcome::Succeeded { id: None }) | None => outcome.succeeded.push(record),
                }
            }
            outcome.batches += 1;
            trace_line!(
                trace,
                "Batch {}: {} request(s), {} fault(s)",
                batch + 1,
                requests.len(),
                faults
            );
            tracing::debug!(batch, requests = requests.len(), faults, "batch executed");
        }

        if !outcome.failed.is_empty() {
            tracing::warn!(failed = outcome.failed.len(), succeeded = outcome.succeeded.len(), "batch run had faults");
        }
        Ok(outcome)
    }
}

fn failure(record: Record, fault: &Fault) -> BatchFailure {
    BatchFailure {
        record,
        reason: fault.compose(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::BatchService;
    use crate::trace::{NoTrace, TraceBuffer};
    use uuid::Uuid;

    fn records(count: usize) -> Vec<Record> {
        (0..count)
            .map(|n| Record::new("contact").with("seq", n as i64))
            .collect()
    }

    fn seqs(records: &[Record]) -> Vec<i64> {
        records
            .iter()
            .filter_map(|r| match r.get("seq") {
                Some(crate::record::Value::Int(n)) => Some(*n),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_batch_count_and_sizes() {
        let service = BatchService::default();
        let executor = BatchExecutor::new(&service, 20);
        let outcome = executor.execute(records(45), Operation::Create, &mut NoTrace).unwrap();

        let sizes: Vec<_> = service.batches.borrow().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![20, 20, 5]);
        assert_eq!(outcome.batches, 3);
        assert_eq!(outcome.succeeded.len(), 45);
        assert!(outcome.is_complete_success());
        assert!(outcome.succeeded.iter().all(|r| r.id.is_some()));
        assert_eq!(seqs(&outcome.succeeded), (0..45).collect::<Vec<_>>());
    }

    #[test]
    fn test_exact_multiple_of_batch_size() {
        let service = BatchService::default();
        BatchExecutor::new(&service, 5)
            .execute(records(10), Operation::Update, &mut NoTrace)
            .unwrap();
        assert_eq!(service.batches.borrow().len(), 2);
    }

    #[test]
    fn test_empty_input_makes_no_calls() {
        let service = BatchService::default();
        let outcome = BatchExecutor::new(&service, 5)
            .execute(Vec::new(), Operation::Create, &mut NoTrace)
            .unwrap();
        assert_eq!(outcome, BatchOutcome::default());
        assert!(service.batches.borrow().is_empty());
    }

    #[test]
    fn test_fault_isolated_at_any_position() {
        let total = 7;
        for k in 0..total {
            let service = BatchService {
                faulty: vec![k as i64],
                ..Default::default()
            };
            let outcome = BatchExecutor::new(&service, 3)
                .execute(records(total), Operation::Create, &mut NoTrace)
                .unwrap();

            assert_eq!(outcome.failed.len(), 1, "fault at {}", k);
            assert_eq!(seqs(&[outcome.failed[0].record.clone()]), vec![k as i64]);
            assert!(!outcome.failed[0].reason.is_empty());
            let expected: Vec<i64> = (0..total as i64).filter(|n| *n != k as i64).collect();
            assert_eq!(seqs(&outcome.succeeded), expected);
            assert_eq!(service.batches.borrow().len(), 3);
        }
    }

    #[test]
    fn test_fault_reason_is_composed() {
        let service = BatchService {
            faulty: vec![1],
            ..Default::default()
        };
        let outcome = BatchExecutor::new(&service, 10)
            .execute(records(2), Operation::Create, &mut NoTrace)
            .unwrap();
        assert_eq!(
            outcome.failed[0].reason,
            "MAIN: Duplicate recordINNER: A record with matching key values already exists\nat Create"
        );
        assert!(outcome.failed[0].record.id.is_none());
    }

    #[test]
    fn test_missing_responses_count_as_success() {
        let service = BatchService {
            faulty: vec![2],
            ..Default::default()
        };
        service.omit_successes.set(true);
        let outcome = BatchExecutor::new(&service, 10)
            .execute(records(4), Operation::Update, &mut NoTrace)
            .unwrap();
        assert_eq!(seqs(&outcome.succeeded), vec![0, 1, 3]);
        assert_eq!(outcome.failed.len(), 1);
    }

    #[test]
    fn test_transport_failure_keeps_partial_outcome() {
        let service = BatchService {
            fail_batch: Some(1),
            ..Default::default()
        };
        let mut trace = TraceBuffer::new();
        let err = BatchExecutor::new(&service, 4)
            .execute(records(10), Operation::Create, &mut trace)
            .unwrap_err();

        assert_eq!(err.batch, 1);
        assert!(matches!(err.source, ServiceError::Transport(_)));
        assert_eq!(seqs(&err.outcome.succeeded), vec![0, 1, 2, 3]);
        assert_eq!(err.outcome.batches, 1);
        assert_eq!(service.batches.borrow().len(), 2);
        assert!(trace.contains("Batch 2: call failed"));
    }

    #[test]
    fn test_requests_and_settings() {
        let service = BatchService::default();
        let settings = EngineSettings {
            request_per_batch: 2,
            return_responses: false,
            ..Default::default()
        };
        let id = Uuid::new_v4();
        let input = vec![Record::new("incident").with_id(id), Record::new("incident")];
        BatchExecutor::from_settings(&service, &settings)
            .execute(input, Operation::SetState { state: 1, status: 5 }, &mut NoTrace)
            .unwrap();

        let seen = service.settings_seen.borrow();
        assert_eq!(
            seen[0],
            BatchSettings {
                continue_on_error: true,
                return_responses: false
            }
        );
        let batches = service.batches.borrow();
        match &batches[0][0] {
            BatchRequest::SetState { target, state, status } => {
                assert_eq!(target.id, id);
                assert_eq!(target.logical_name, "incident");
                assert_eq!((*state, *status), (1, 5));
            }
            other => panic!("unexpected request {:?}", other),
        }
        assert_eq!(batches[0][1].kind(), "SetState");
    }

    #[test]
    fn test_delete_requests_target_references() {
        let service = BatchService::default();
        let id = Uuid::new_v4();
        BatchExecutor::new(&service, 5)
            .execute(vec![Record::new("contact").with_id(id)], Operation::Delete, &mut NoTrace)
            .unwrap();
        assert_eq!(
            service.batches.borrow()[0][0],
            BatchRequest::Delete(crate::record::EntityReference::new("contact", id))
        );
    }
}
