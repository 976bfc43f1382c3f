//! Per-worker bring-up.
//!
//! Each spawned worker runs the same fixed sequence before touching workload
//! state: connect, hydrate the serialized cluster time into its typed form,
//! install the retry stack, open the logical session, seed the oracle, then
//! arrive at the startup barrier. The barrier is symmetric: every worker
//! counts down and then waits, so no state function runs until all workers
//! finished bring-up. A worker that fails mid-sequence still counts down on
//! unwind, keeping the surviving workers from waiting forever.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::context::{ExecutionContext, Session, WorkerSpec};
use crate::error::HarnessError;
use crate::latch::CountdownLatch;
use crate::oracle::{ConsistencyOracle, OracleMode};
use crate::retry::{
    BackgroundOpRetry, DropPendingRetry, HashedShardKeyRetry, NetworkRetry, RetryStack,
    StepdownRetry,
};
use crate::store::{ClusterTime, Connector, DocumentStore, ResumePoint, StoreError};

/// Counts the latch down exactly once, on arrival or on unwind.
struct BarrierGuard<'a> {
    latch: &'a CountdownLatch,
    fired: bool,
}

impl<'a> BarrierGuard<'a> {
    const fn new(latch: &'a CountdownLatch) -> Self {
        Self {
            latch,
            fired: false,
        }
    }

    /// Arrives at the barrier and blocks until everyone else has too.
    fn arrive_and_wait(mut self) {
        self.fired = true;
        self.latch.count_down();
        self.latch.wait();
    }
}

impl Drop for BarrierGuard<'_> {
    fn drop(&mut self) {
        if !self.fired {
            self.latch.count_down();
        }
    }
}

/// Brings one worker from a bare spec to a ready execution context.
pub struct SessionBootstrap<'a> {
    spec: &'a WorkerSpec,
    connector: &'a dyn Connector,
    start_latch: &'a CountdownLatch,
}

impl<'a> SessionBootstrap<'a> {
    /// Creates a bootstrap for one worker.
    ///
    /// `start_latch` must have been created with the total worker count.
    #[must_use]
    pub const fn new(
        spec: &'a WorkerSpec,
        connector: &'a dyn Connector,
        start_latch: &'a CountdownLatch,
    ) -> Self {
        Self {
            spec,
            connector,
            start_latch,
        }
    }

    /// Runs the bring-up sequence and blocks on the startup barrier.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Bootstrap`] naming the failing step. The
    /// barrier is still counted down before returning.
    pub fn run(self) -> Result<(Box<dyn DocumentStore>, ExecutionContext), HarnessError> {
        let barrier = BarrierGuard::new(self.start_latch);
        let tid = self.spec.tid;

        let store = self
            .connector
            .connect(&self.spec.host)
            .map_err(|source| HarnessError::Bootstrap {
                tid,
                step: "connect",
                source,
            })?;

        // Hydrate the serialized cluster time and drop the raw form; from
        // here on the clock only moves through typed advances.
        let initial_time = match &self.spec.session_options {
            Some(options) => match &options.raw_cluster_time {
                Some(raw) => Some(parse_cluster_time(raw).map_err(|source| {
                    HarnessError::Bootstrap {
                        tid,
                        step: "cluster-time",
                        source,
                    }
                })?),
                None => None,
            },
            None => None,
        };

        let retry = build_retry_stack(self.spec);

        let session = self.spec.session_options.as_ref().map(|options| {
            Session::new(u64::from(tid), initial_time, options.causal_consistency)
        });

        let mode = if self.spec.cluster.exactly_once_multi_writes {
            OracleMode::ExactlyOnce
        } else {
            OracleMode::BestEffort
        };
        // Capture the resume point before the barrier so the oracle never
        // misses an event another worker writes right after release.
        let oracle = ConsistencyOracle::new(
            mode,
            self.spec.partition,
            ResumePoint::StartTime(store.cluster_time()),
        );

        let cx = ExecutionContext {
            tid,
            db_name: self.spec.db_name.clone(),
            coll_name: self.spec.coll_name.clone(),
            partition: self.spec.partition,
            session,
            rng: ChaCha8Rng::seed_from_u64(self.spec.rng_seed),
            retry,
            oracle,
            scratch: std::collections::BTreeMap::new(),
            span: tracing::info_span!("worker", tid),
        };

        tracing::debug!(tid, host = %self.spec.host, "bootstrap complete, arriving at barrier");
        barrier.arrive_and_wait();
        Ok((store, cx))
    }
}

/// Builds the interceptor stack for one worker, general layers first.
///
/// Install order is significant: the network layer goes in last and so wraps
/// outermost, and each of its attempts re-enters the earlier layers.
fn build_retry_stack(spec: &WorkerSpec) -> RetryStack {
    let mut stack = RetryStack::new();
    stack.install(std::sync::Arc::new(BackgroundOpRetry));
    stack.install(std::sync::Arc::new(DropPendingRetry));
    stack.install(std::sync::Arc::new(HashedShardKeyRetry));
    if let Some(stepdown) = &spec.cluster.stepdown {
        stack.install(std::sync::Arc::new(StepdownRetry::new(
            stepdown.max_retry_attempts,
        )));
    }
    stack.install(std::sync::Arc::new(NetworkRetry));
    stack
}

fn parse_cluster_time(raw: &str) -> Result<ClusterTime, StoreError> {
    serde_json::from_str(raw)
        .map_err(|err| StoreError::Command(format!("malformed cluster time '{raw}': {err}")))
}
