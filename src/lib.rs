//! FSM Workload: concurrent verifiable load testing for sharded document stores.
//!
//! A harness that launches N independent worker threads against an
//! already-running distributed document store and verifies the results. Each
//! worker runs a probabilistic state machine (FSM) drawn from a seeded RNG
//! stream, issuing multi-document writes and chunk migrations through a stack
//! of retryable operation interceptors, and checking change-stream delivery
//! with a per-worker consistency oracle.
//!
//! # Architecture
//!
//! - **Launcher** composes the workload configuration, spawns one worker per
//!   `tid`, and aggregates per-worker outcomes into a single report.
//! - **`SessionBootstrap`** brings each worker's connection, session, and
//!   retry stack up in a fixed order, then releases all workers together
//!   through a shared startup barrier.
//! - **`FsmExecutor`** runs the weighted state-machine loop for one worker
//!   until its iteration budget, a cooperative stop, or an error.
//! - **`ConsistencyOracle`** validates change-event delivery: strict FIFO
//!   matching when the store applies multi-writes exactly once, duplicate
//!   detection only when it cannot.
//!
//! Workers never share mutable state: correctness under concurrency comes
//! from disjoint owned-id partitions, not locking.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use fsm_workload::{migrate, Launcher, SimStore};
//!
//! let store = SimStore::builder().seed(42).build();
//! let launcher = Launcher::new(Arc::new(store.clone()), store.descriptor());
//! let report = launcher.run(&migrate::workload(), &[])?;
//! assert!(report.is_ok());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod bootstrap;
mod config;
mod context;
mod error;
mod fsm;
mod latch;
mod launcher;
mod oracle;
mod outcome;
mod retry;
mod store;

pub mod migrate;
pub mod profiles;
pub mod sim;

pub use bootstrap::SessionBootstrap;
pub use config::{
    compose, ConfigError, HookFn, StateFn, Transition, WorkloadConfig, WorkloadDecl,
    WorkloadOverlay,
};
pub use context::{
    ClusterDescriptor, ExecutionContext, OwnedPartition, Session, SessionOptions, StepdownConfig,
    WorkerSpec,
};
pub use error::{HarnessError, Result};
pub use fsm::{ExecutorState, FsmExecutor, FsmSummary};
pub use latch::CountdownLatch;
pub use launcher::Launcher;
pub use oracle::{ConsistencyOracle, OracleMode, OracleViolation, PendingEvent};
pub use outcome::{ErrorAggregator, Outcome, RunReport};
pub use retry::{
    BackgroundOpRetry, DropPendingRetry, HashedShardKeyRetry, Idempotency, NetworkRetry,
    RetryLayer, RetryStack, StepdownRetry,
};
pub use sim::SimStore;
pub use store::{
    ChangeCursor, ChangeEvent, ChunkRange, ClusterTime, Connector, Document, DocumentId,
    DocumentStore, OperationType, ResumePoint, ResumeToken, StoreError,
};
