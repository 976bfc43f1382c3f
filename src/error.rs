//! Error types for the workload harness.
//!
//! All errors are handled explicitly: transient store errors are recovered by
//! the retry stack, everything else resolves into a per-worker `Outcome`.

use thiserror::Error;

use crate::config::ConfigError;
use crate::oracle::OracleViolation;
use crate::store::StoreError;

/// The result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Errors that terminate a worker's FSM run.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A store operation failed after the retry stack gave up.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Workload configuration was invalid or mutated after freezing.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The consistency oracle detected a delivery violation.
    #[error(transparent)]
    Oracle(#[from] OracleViolation),

    /// Per-worker bring-up failed before the startup barrier.
    #[error("bootstrap failed for worker {tid} at step '{step}': {source}")]
    Bootstrap {
        /// Worker thread id.
        tid: u32,
        /// Which bootstrap step failed.
        step: &'static str,
        /// Underlying store error.
        source: StoreError,
    },

    /// A state function failed; never retried.
    #[error("state '{state}' failed: {source}")]
    State {
        /// Name of the failing state.
        state: String,
        /// Underlying failure.
        source: Box<HarnessError>,
    },

    /// A workload-level assertion failed.
    #[error("assertion failed: {0}")]
    Assertion(String),
}
