//! Per-worker finite-state-machine executor.
//!
//! Runs one worker's state loop: invoke the current state's function, then
//! select the next state by drawing a single uniform sample from the worker's
//! seeded RNG and walking the state's declaration-ordered weight table.
//! Identical seeds therefore reproduce identical state sequences.

use std::time::Instant;

use hdrhistogram::Histogram;
use rand::Rng;

use crate::config::WorkloadConfig;
use crate::context::ExecutionContext;
use crate::error::HarnessError;
use crate::latch::CountdownLatch;
use crate::store::DocumentStore;

/// Lifecycle of one executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Created, not yet running.
    Idle,
    /// Inside the state loop.
    Running,
    /// Terminated normally (budget reached or cooperative stop).
    Completed,
    /// Terminated by an unrecovered state-function error.
    Failed,
}

/// Result of one executor run.
#[derive(Debug, Clone)]
pub struct FsmSummary {
    /// Steps actually executed.
    pub steps: u64,
    /// Visited state names, in order.
    pub state_trace: Vec<String>,
    /// True if the run stopped on the shared error latch before exhausting
    /// its iteration budget.
    pub stopped_early: bool,
    /// Step latency p50 in microseconds.
    pub step_latency_p50_us: u64,
    /// Step latency p99 in microseconds.
    pub step_latency_p99_us: u64,
    /// Step latency max in microseconds.
    pub step_latency_max_us: u64,
}

/// Executes the state-machine loop for one worker.
pub struct FsmExecutor<'a> {
    config: &'a WorkloadConfig,
    stop_latch: &'a CountdownLatch,
    state: ExecutorState,
}

impl<'a> FsmExecutor<'a> {
    /// Creates an idle executor over a composed config.
    ///
    /// `stop_latch` is the shared error latch: the loop checks it once per
    /// step and unwinds gracefully when it reaches zero.
    #[must_use]
    pub const fn new(config: &'a WorkloadConfig, stop_latch: &'a CountdownLatch) -> Self {
        Self {
            config,
            stop_latch,
            state: ExecutorState::Idle,
        }
    }

    /// Returns the executor's lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ExecutorState {
        self.state
    }

    /// Runs the loop until the iteration budget, a cooperative stop, or an
    /// unrecovered error.
    ///
    /// On error the executor transitions to `Failed` and returns without
    /// attempting to resume or skip to any cleanup state; teardown is a
    /// separate explicit call made by the launcher.
    ///
    /// # Errors
    ///
    /// Returns the state function's failure wrapped with the state name.
    ///
    /// # Panics
    ///
    /// Panics if histogram creation fails (cannot happen with these bounds).
    pub fn run(
        &mut self,
        cx: &mut ExecutionContext,
        store: &dyn DocumentStore,
    ) -> Result<FsmSummary, HarnessError> {
        let mut latencies = Histogram::<u64>::new(3).expect("histogram creation");
        let mut trace = Vec::new();
        let mut current = self.config.start_state().to_string();
        let mut stopped_early = false;
        let mut steps = 0u64;

        self.state = ExecutorState::Running;
        let span = cx.span.clone();
        let _guard = span.enter();

        while steps < self.config.iterations() {
            // Cooperative stop: observed at step granularity, never mid-call.
            if self.stop_latch.is_zero() {
                tracing::debug!(tid = cx.tid, step = steps, "stopping on error latch");
                stopped_early = true;
                break;
            }

            let Some(state_fn) = self.config.state_fn(&current) else {
                self.state = ExecutorState::Failed;
                return Err(HarnessError::Assertion(format!(
                    "state '{current}' has no function"
                )));
            };

            trace.push(current.clone());
            let started = Instant::now();
            let result = state_fn(cx, store);
            #[allow(clippy::cast_possible_truncation)] // step latency fits u64 micros.
            let elapsed_us = started.elapsed().as_micros() as u64;
            let _ = latencies.record(elapsed_us);

            if let Err(err) = result {
                self.state = ExecutorState::Failed;
                return Err(HarnessError::State {
                    state: current,
                    source: Box::new(err),
                });
            }

            steps += 1;
            match self.next_state(cx, &current) {
                Some(next) => current = next,
                None => break,
            }
        }

        self.state = ExecutorState::Completed;
        Ok(FsmSummary {
            steps,
            state_trace: trace,
            stopped_early,
            step_latency_p50_us: latencies.value_at_percentile(50.0),
            step_latency_p99_us: latencies.value_at_percentile(99.0),
            step_latency_max_us: latencies.max(),
        })
    }

    /// Draws the next state from the current state's weight table.
    ///
    /// One uniform sample, then a walk of the declaration-ordered edges; a
    /// state with no outgoing edges ends the run.
    fn next_state(&self, cx: &mut ExecutionContext, current: &str) -> Option<String> {
        let edges = self.config.transitions_for(current);
        if edges.is_empty() {
            return None;
        }

        let draw: f64 = cx.rng.gen();
        let mut cumulative = 0.0;
        for edge in edges {
            cumulative += edge.weight;
            if draw < cumulative {
                return Some(edge.target.clone());
            }
        }
        // Floating-point slack: the draw landed past the last cumulative sum.
        edges.last().map(|edge| edge.target.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::config::{compose, StateFn, Transition, WorkloadDecl};
    use crate::context::OwnedPartition;
    use crate::oracle::{ConsistencyOracle, OracleMode};
    use crate::retry::RetryStack;
    use crate::store::ResumePoint;

    fn test_context(seed: u64) -> ExecutionContext {
        let partition = OwnedPartition::new(0, 1, 10);
        ExecutionContext {
            tid: 0,
            db_name: "test".to_string(),
            coll_name: "fsm".to_string(),
            partition,
            session: None,
            rng: ChaCha8Rng::seed_from_u64(seed),
            retry: RetryStack::new(),
            oracle: ConsistencyOracle::new(
                OracleMode::BestEffort,
                partition,
                ResumePoint::Token(crate::store::ResumeToken(0)),
            ),
            scratch: BTreeMap::new(),
            span: tracing::Span::none(),
        }
    }

    fn counting_state(counter: Arc<std::sync::Mutex<u64>>) -> StateFn {
        Arc::new(move |_cx, _store| {
            *counter.lock().expect("lock poisoned") += 1;
            Ok(())
        })
    }

    fn two_state_decl(counter: Arc<std::sync::Mutex<u64>>) -> WorkloadDecl {
        WorkloadDecl::new("two-state")
            .state("a", counting_state(Arc::clone(&counter)))
            .state("b", counting_state(counter))
            .transitions(
                "a",
                vec![Transition::new("a", 0.5), Transition::new("b", 0.5)],
            )
            .transitions(
                "b",
                vec![Transition::new("a", 0.5), Transition::new("b", 0.5)],
            )
            .start_state("a")
            .iterations(20)
            .thread_count(1)
    }

    #[test]
    fn test_runs_full_iteration_budget() {
        let counter = Arc::new(std::sync::Mutex::new(0));
        let config = compose(&two_state_decl(Arc::clone(&counter)), &[]).expect("compose");
        let stop = CountdownLatch::new(1);
        let store = crate::sim::SimStore::builder().build();

        let mut executor = FsmExecutor::new(&config, &stop);
        let mut cx = test_context(7);
        let summary = executor.run(&mut cx, &store).expect("run");

        assert_eq!(summary.steps, 20);
        assert_eq!(*counter.lock().expect("lock poisoned"), 20);
        assert!(!summary.stopped_early);
        assert_eq!(executor.state(), ExecutorState::Completed);
    }

    #[test]
    fn test_identical_seeds_visit_identical_states() {
        let counter = Arc::new(std::sync::Mutex::new(0));
        let config = compose(&two_state_decl(counter), &[]).expect("compose");
        let stop = CountdownLatch::new(1);
        let store = crate::sim::SimStore::builder().build();

        let trace_for = |seed: u64| {
            let mut executor = FsmExecutor::new(&config, &stop);
            let mut cx = test_context(seed);
            executor.run(&mut cx, &store).expect("run").state_trace
        };

        assert_eq!(trace_for(42), trace_for(42));
        // A different seed should diverge for a 20-step two-state walk.
        assert_ne!(trace_for(42), trace_for(43));
    }

    #[test]
    fn test_error_latch_stops_the_loop() {
        let counter = Arc::new(std::sync::Mutex::new(0));
        let config = compose(&two_state_decl(Arc::clone(&counter)), &[]).expect("compose");
        let stop = CountdownLatch::new(1);
        stop.count_down();
        let store = crate::sim::SimStore::builder().build();

        let mut executor = FsmExecutor::new(&config, &stop);
        let mut cx = test_context(7);
        let summary = executor.run(&mut cx, &store).expect("run");

        assert_eq!(summary.steps, 0);
        assert!(summary.stopped_early);
        assert_eq!(*counter.lock().expect("lock poisoned"), 0);
    }

    #[test]
    fn test_failing_state_terminates_without_resume() {
        let counter = Arc::new(std::sync::Mutex::new(0));
        let failing: StateFn =
            Arc::new(|_cx, _store| Err(HarnessError::Assertion("expected failure".into())));
        let decl = WorkloadDecl::new("failing")
            .state("boom", failing)
            .state("after", counting_state(Arc::clone(&counter)))
            .transitions("boom", vec![Transition::new("after", 1.0)])
            .start_state("boom")
            .iterations(5)
            .thread_count(1);
        let config = compose(&decl, &[]).expect("compose");
        let stop = CountdownLatch::new(1);
        let store = crate::sim::SimStore::builder().build();

        let mut executor = FsmExecutor::new(&config, &stop);
        let mut cx = test_context(7);
        let err = executor.run(&mut cx, &store).expect_err("must fail");

        assert!(matches!(err, HarnessError::State { ref state, .. } if state == "boom"));
        assert_eq!(executor.state(), ExecutorState::Failed);
        // The follow-up state never ran.
        assert_eq!(*counter.lock().expect("lock poisoned"), 0);
    }
}
