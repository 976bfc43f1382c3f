//! Change-event consistency oracle.
//!
//! Each worker tracks the change events its own multi-writes should produce
//! and validates delivery against the store's resumable change stream. Two
//! modes, selected by whether the cluster guarantees exactly-once application
//! of multi-document writes under concurrent chunk migration:
//!
//! - **Exactly-once**: expected events are queued FIFO and matched strictly
//!   in order against observed events; any mismatch is a hard failure.
//! - **Best-effort**: the store may apply a multi-write more than once, so
//!   the oracle only asserts that no event is delivered twice; it makes no
//!   claim about completeness. This weaker contract is intentional and must
//!   not be "fixed" into a false exactly-once guarantee.
//!
//! Both modes ignore events outside the worker's owned-id partition, so
//! concurrent workers never interfere with each other's bookkeeping.

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use thiserror::Error;

use crate::context::OwnedPartition;
use crate::error::HarnessError;
use crate::store::{DocumentId, DocumentStore, OperationType, ResumePoint, StoreError};

/// Default bound on cursor reopen attempts while waiting for pending events.
const DEFAULT_MAX_DRAIN_ATTEMPTS: u32 = 50;

/// Default pause between reopen attempts.
const DEFAULT_POLL_BACKOFF: Duration = Duration::from_millis(10);

/// Oracle operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleMode {
    /// Multi-writes are applied exactly once: strict FIFO matching.
    ExactlyOnce,
    /// Multi-writes may be applied more than once: duplicate detection only.
    BestEffort,
}

/// An expected change event, queued when a multi-write is issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    /// Expected operation type.
    pub operation: OperationType,
    /// Expected document id.
    pub doc_id: DocumentId,
    /// Expected resulting value (`None` for deletes).
    pub expected_value: Option<i64>,
}

/// Hard assertion failures detected by the oracle.
#[derive(Debug, Clone, Error)]
pub enum OracleViolation {
    /// Best-effort mode: the same event was delivered twice.
    #[error(
        "duplicate event: {operation} on doc {doc_id} observed twice (fingerprint {fingerprint:016x})"
    )]
    DuplicateEvent {
        /// Affected document.
        doc_id: DocumentId,
        /// Operation type of the duplicated event.
        operation: OperationType,
        /// Fingerprint of the duplicated event body.
        fingerprint: u64,
    },

    /// Exactly-once mode: the observed event does not match the queue head.
    #[error(
        "event mismatch: expected {expected_operation} on doc {expected_doc}, \
         observed {observed_operation} on doc {observed_doc}"
    )]
    EventMismatch {
        /// Operation expected at the queue head.
        expected_operation: OperationType,
        /// Document expected at the queue head.
        expected_doc: DocumentId,
        /// Operation actually observed.
        observed_operation: OperationType,
        /// Document actually observed.
        observed_doc: DocumentId,
    },

    /// Exactly-once mode: the observed value differs from the expected one.
    #[error("value mismatch on doc {doc_id}: expected {expected:?}, observed {observed:?}")]
    ValueMismatch {
        /// Affected document.
        doc_id: DocumentId,
        /// Value the multi-write should have produced.
        expected: Option<i64>,
        /// Value carried by the event.
        observed: Option<i64>,
    },

    /// Exactly-once mode: an owned-partition event arrived with an empty
    /// expectation queue.
    #[error("unexpected event: {operation} on doc {doc_id} with no pending expectation")]
    UnexpectedEvent {
        /// Affected document.
        doc_id: DocumentId,
        /// Operation type of the surplus event.
        operation: OperationType,
    },

    /// Exactly-once mode: expected events never arrived.
    #[error("change stream starved: {pending} expected events missing after {attempts} reopens")]
    Starved {
        /// Events still queued when the retry bound was hit.
        pending: usize,
        /// Reopen attempts made.
        attempts: u32,
    },
}

/// Per-worker change-event bookkeeping and validation.
#[derive(Debug)]
pub struct ConsistencyOracle {
    mode: OracleMode,
    partition: OwnedPartition,
    /// Where the next cursor opens: the last observed token, or the start
    /// point saved at setup time.
    resume: ResumePoint,
    pending: VecDeque<PendingEvent>,
    seen: BTreeSet<(DocumentId, OperationType, u64)>,
    max_drain_attempts: u32,
    poll_backoff: Duration,
}

impl ConsistencyOracle {
    /// Creates an oracle for one worker.
    #[must_use]
    pub const fn new(mode: OracleMode, partition: OwnedPartition, start: ResumePoint) -> Self {
        Self {
            mode,
            partition,
            resume: start,
            pending: VecDeque::new(),
            seen: BTreeSet::new(),
            max_drain_attempts: DEFAULT_MAX_DRAIN_ATTEMPTS,
            poll_backoff: DEFAULT_POLL_BACKOFF,
        }
    }

    /// Overrides the bounded-wait tuning.
    #[must_use]
    pub const fn with_drain_bounds(mut self, attempts: u32, backoff: Duration) -> Self {
        self.max_drain_attempts = attempts;
        self.poll_backoff = backoff;
        self
    }

    /// Returns the oracle's mode.
    #[must_use]
    pub const fn mode(&self) -> OracleMode {
        self.mode
    }

    /// Records the event a multi-write is expected to produce.
    ///
    /// Only meaningful in exactly-once mode; in best-effort mode the store
    /// cannot promise the write maps to exactly one event, so nothing is
    /// queued.
    pub fn expect(
        &mut self,
        operation: OperationType,
        doc_id: DocumentId,
        expected_value: Option<i64>,
    ) {
        if self.mode == OracleMode::ExactlyOnce {
            self.pending.push_back(PendingEvent {
                operation,
                doc_id,
                expected_value,
            });
        }
    }

    /// Number of expected events not yet observed.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of distinct events observed so far (best-effort mode).
    #[must_use]
    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    /// Drains the change stream and validates delivery.
    ///
    /// Opens a cursor at the saved resume position, consumes every currently
    /// available event for this worker's owned ids, and applies the mode's
    /// check. In exactly-once mode, a non-empty expectation queue after a
    /// drain triggers a bounded reopen-and-wait; this is the only blocking
    /// wait inside the FSM loop besides the startup barrier.
    ///
    /// # Errors
    ///
    /// Returns an [`OracleViolation`] on any delivery violation, or the
    /// underlying [`StoreError`] if the stream cannot be opened.
    pub fn check(&mut self, store: &dyn DocumentStore, coll: &str) -> Result<(), HarnessError> {
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            self.drain_once(store, coll)?;

            if self.mode == OracleMode::BestEffort || self.pending.is_empty() {
                return Ok(());
            }
            if attempts >= self.max_drain_attempts {
                return Err(OracleViolation::Starved {
                    pending: self.pending.len(),
                    attempts,
                }
                .into());
            }
            std::thread::sleep(self.poll_backoff);
        }
    }

    /// Opens one cursor and consumes everything currently available.
    fn drain_once(&mut self, store: &dyn DocumentStore, coll: &str) -> Result<(), HarnessError> {
        let mut cursor = match store.open_change_stream(coll, self.resume) {
            Ok(cursor) => cursor,
            // An invalidated token falls back to a fresh open on retry.
            Err(StoreError::CursorClosed(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        loop {
            let event = match cursor.try_next() {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(()),
                Err(StoreError::CursorClosed(_)) => return Ok(()),
                Err(err) => return Err(err.into()),
            };

            self.resume = ResumePoint::Token(event.token);
            if !self.partition.contains(event.doc_id) {
                continue;
            }

            match self.mode {
                OracleMode::BestEffort => {
                    let fingerprint = event.fingerprint();
                    let key = (event.doc_id, event.operation, fingerprint);
                    if !self.seen.insert(key) {
                        return Err(OracleViolation::DuplicateEvent {
                            doc_id: event.doc_id,
                            operation: event.operation,
                            fingerprint,
                        }
                        .into());
                    }
                }
                OracleMode::ExactlyOnce => {
                    let Some(expected) = self.pending.pop_front() else {
                        return Err(OracleViolation::UnexpectedEvent {
                            doc_id: event.doc_id,
                            operation: event.operation,
                        }
                        .into());
                    };
                    if expected.operation != event.operation || expected.doc_id != event.doc_id {
                        return Err(OracleViolation::EventMismatch {
                            expected_operation: expected.operation,
                            expected_doc: expected.doc_id,
                            observed_operation: event.operation,
                            observed_doc: event.doc_id,
                        }
                        .into());
                    }
                    if expected.expected_value != event.value {
                        return Err(OracleViolation::ValueMismatch {
                            doc_id: event.doc_id,
                            expected: expected.expected_value,
                            observed: event.value,
                        }
                        .into());
                    }
                }
            }
        }
    }
}
