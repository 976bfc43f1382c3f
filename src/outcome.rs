//! Worker outcome collection and the shared stop signal.
//!
//! Workers never abort each other: the first recorded failure counts the
//! shared stop latch down, and every other worker notices at its next step
//! boundary and unwinds on its own.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::sync::{Arc, Mutex};

use crate::error::HarnessError;
use crate::fsm::FsmSummary;
use crate::latch::CountdownLatch;

/// Terminal result of one worker.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// Worker thread id.
    pub tid: u32,
    /// True if the worker completed without error.
    pub ok: bool,
    /// Rendered error, when the worker failed.
    pub error: Option<String>,
    /// Backtrace captured where the failure was recorded, when the platform
    /// produced one.
    pub backtrace: Option<String>,
    /// Panic payload, when the worker thread panicked.
    pub panic: Option<String>,
    /// Run summary, when the worker got far enough to produce one.
    pub summary: Option<FsmSummary>,
}

impl Outcome {
    /// A clean completion.
    #[must_use]
    pub const fn success(tid: u32, summary: FsmSummary) -> Self {
        Self {
            tid,
            ok: true,
            error: None,
            backtrace: None,
            panic: None,
            summary: Some(summary),
        }
    }

    /// A worker that returned an error. Captures a backtrace at the point of
    /// construction so the report can show where the failure surfaced.
    #[must_use]
    pub fn failure(tid: u32, err: &HarnessError) -> Self {
        let backtrace = Backtrace::force_capture();
        Self {
            tid,
            ok: false,
            error: Some(err.to_string()),
            backtrace: (backtrace.status() == BacktraceStatus::Captured)
                .then(|| backtrace.to_string()),
            panic: None,
            summary: None,
        }
    }

    /// A worker whose thread panicked.
    #[must_use]
    pub const fn panicked(tid: u32, payload: String) -> Self {
        Self {
            tid,
            ok: false,
            error: None,
            backtrace: None,
            panic: Some(payload),
            summary: None,
        }
    }
}

/// Collects outcomes from all workers and broadcasts the stop signal.
///
/// Cloneable across threads; all clones share one outcome list and one
/// stop latch.
#[derive(Debug, Clone)]
pub struct ErrorAggregator {
    outcomes: Arc<Mutex<Vec<Outcome>>>,
    stop_latch: Arc<CountdownLatch>,
}

impl ErrorAggregator {
    /// Creates an aggregator whose stop latch trips on the first failure.
    #[must_use]
    pub fn new() -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(Vec::new())),
            stop_latch: Arc::new(CountdownLatch::new(1)),
        }
    }

    /// Returns the shared stop latch workers poll at step boundaries.
    #[must_use]
    pub fn stop_latch(&self) -> Arc<CountdownLatch> {
        Arc::clone(&self.stop_latch)
    }

    /// Records one worker's outcome; a failure trips the stop latch.
    pub fn record(&self, outcome: Outcome) {
        if !outcome.ok {
            tracing::warn!(
                tid = outcome.tid,
                error = outcome.error.as_deref().unwrap_or("panic"),
                "worker failed, signalling cooperative stop"
            );
            self.stop_latch.count_down();
        }
        self.outcomes
            .lock()
            .expect("lock poisoned")
            .push(outcome);
    }

    /// Consumes the aggregator and produces the run report.
    ///
    /// # Panics
    ///
    /// Panics if a worker thread still holds a clone.
    #[must_use]
    pub fn into_report(self) -> RunReport {
        let outcomes = Arc::try_unwrap(self.outcomes)
            .expect("workers still hold the aggregator")
            .into_inner()
            .expect("lock poisoned");
        RunReport { outcomes }
    }
}

impl Default for ErrorAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Final report for one run.
#[derive(Debug)]
pub struct RunReport {
    outcomes: Vec<Outcome>,
}

impl RunReport {
    /// True if every worker completed cleanly.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.outcomes.iter().all(|o| o.ok)
    }

    /// All recorded outcomes, in recording order.
    #[must_use]
    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    /// The failed outcomes only.
    pub fn failures(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(|o| !o.ok)
    }

    /// Total steps executed across all workers.
    #[must_use]
    pub fn total_steps(&self) -> u64 {
        self.outcomes
            .iter()
            .filter_map(|o| o.summary.as_ref())
            .map(|s| s.steps)
            .sum()
    }
}
