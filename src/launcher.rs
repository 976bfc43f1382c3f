//! Run orchestration: compose, spawn, join, tear down.
//!
//! The launcher owns the run lifecycle. It executes the base setup hook once,
//! composes the workload, hands each worker an immutable spec with a disjoint
//! id partition and a derived RNG seed, spawns one OS thread per worker, and
//! joins them all before running teardown. Teardown always runs, whatever
//! terminal states the workers reached.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::bootstrap::SessionBootstrap;
use crate::config::{compose, WorkloadConfig, WorkloadDecl, WorkloadOverlay};
use crate::context::{ClusterDescriptor, OwnedPartition, SessionOptions, WorkerSpec};
use crate::error::HarnessError;
use crate::fsm::FsmExecutor;
use crate::latch::CountdownLatch;
use crate::outcome::{ErrorAggregator, Outcome, RunReport};
use crate::store::Connector;

/// Default documents owned by each worker.
const DEFAULT_DOCS_PER_THREAD: u64 = 100;

/// Orchestrates one workload run against a cluster.
pub struct Launcher {
    connector: Arc<dyn Connector>,
    cluster: ClusterDescriptor,
    db_name: String,
    coll_name: String,
    base_seed: u64,
    docs_per_thread: u64,
    session_options: Option<SessionOptions>,
}

impl Launcher {
    /// Creates a launcher for the given cluster.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, cluster: ClusterDescriptor) -> Self {
        Self {
            connector,
            cluster,
            db_name: "fsmdb".to_string(),
            coll_name: "fsmcoll".to_string(),
            base_seed: 0,
            docs_per_thread: DEFAULT_DOCS_PER_THREAD,
            session_options: Some(SessionOptions::default()),
        }
    }

    /// Sets the target namespace.
    #[must_use]
    pub fn namespace(mut self, db: impl Into<String>, coll: impl Into<String>) -> Self {
        self.db_name = db.into();
        self.coll_name = coll.into();
        self
    }

    /// Sets the base seed; worker `tid` draws from `base_seed + tid`.
    #[must_use]
    pub const fn base_seed(mut self, seed: u64) -> Self {
        self.base_seed = seed;
        self
    }

    /// Sets the owned-id count per worker.
    #[must_use]
    pub const fn docs_per_thread(mut self, docs: u64) -> Self {
        self.docs_per_thread = docs;
        self
    }

    /// Sets session options for all workers; `None` runs session-less.
    #[must_use]
    pub fn session_options(mut self, options: Option<SessionOptions>) -> Self {
        self.session_options = options;
        self
    }

    /// Runs one composed workload to completion.
    ///
    /// # Errors
    ///
    /// Returns an error for setup, composition, or teardown failures. Worker
    /// failures do not surface here; they are in the report.
    pub fn run(
        &self,
        base: &WorkloadDecl,
        overlays: &[WorkloadOverlay],
    ) -> crate::Result<RunReport> {
        let Some(admin_host) = self.cluster.hosts.first() else {
            return Err(HarnessError::Assertion("cluster has no hosts".into()));
        };
        let admin = self
            .connector
            .connect(admin_host)
            .map_err(HarnessError::Store)?;

        // Setup runs against a mutable copy of the base data, so that values
        // it computes are frozen into the merge below.
        let mut decl = base.clone();
        if let Some(setup) = &decl.setup {
            setup(&mut decl.data, admin.as_ref(), &self.cluster)?;
        }
        let config = compose(&decl, overlays)?;

        let span = tracing::info_span!("run", workload = %config.name);
        let _guard = span.enter();
        tracing::info!(
            threads = config.thread_count(),
            iterations = config.iterations(),
            seed = self.base_seed,
            "launching workload"
        );

        let specs = self.build_specs(&config, admin.as_ref())?;
        let report = self.run_workers(&config, specs);

        // Teardown is unconditional; skipping it on failure would leak the
        // collection into the next run.
        if let Some(teardown) = &decl.teardown {
            let mut data = config.data.clone();
            teardown(&mut data, admin.as_ref(), &self.cluster)?;
        }
        Ok(report)
    }

    /// Builds one immutable spec per worker and checks partition disjointness.
    fn build_specs(
        &self,
        config: &WorkloadConfig,
        admin: &dyn crate::store::DocumentStore,
    ) -> crate::Result<Vec<WorkerSpec>> {
        // The initial cluster time crosses the spawn boundary serialized; the
        // bootstrap hydrates it back into its typed form.
        let raw_time = serde_json::to_string(&admin.cluster_time())
            .map_err(|err| HarnessError::Assertion(format!("cluster time encode: {err}")))?;
        let session_options = self.session_options.clone().map(|mut options| {
            options.raw_cluster_time = Some(raw_time);
            options
        });

        let thread_count = config.thread_count();
        let specs: Vec<WorkerSpec> = (0..thread_count)
            .map(|tid| WorkerSpec {
                tid,
                host: self.cluster.hosts[tid as usize % self.cluster.hosts.len()].clone(),
                db_name: self.db_name.clone(),
                coll_name: self.coll_name.clone(),
                cluster: self.cluster.clone(),
                session_options: session_options.clone(),
                rng_seed: self.base_seed + u64::from(tid),
                partition: OwnedPartition::new(tid, thread_count, self.docs_per_thread),
            })
            .collect();

        for (i, a) in specs.iter().enumerate() {
            for b in specs.iter().skip(i + 1) {
                if !a.partition.is_disjoint(&b.partition) {
                    return Err(HarnessError::Assertion(format!(
                        "partitions of workers {} and {} overlap",
                        a.tid, b.tid
                    )));
                }
            }
        }
        Ok(specs)
    }

    /// Spawns, runs, and joins all workers.
    fn run_workers(&self, config: &WorkloadConfig, specs: Vec<WorkerSpec>) -> RunReport {
        let aggregator = ErrorAggregator::new();
        let stop_latch = aggregator.stop_latch();
        let start_latch = Arc::new(CountdownLatch::new(u64::from(config.thread_count())));

        let mut handles = Vec::with_capacity(specs.len());
        for spec in specs {
            let connector = Arc::clone(&self.connector);
            let config = config.clone();
            let worker_aggregator = aggregator.clone();
            let worker_start = Arc::clone(&start_latch);
            let worker_stop = Arc::clone(&stop_latch);
            let tid = spec.tid;

            let spawned = std::thread::Builder::new()
                .name(format!("worker-{tid}"))
                .spawn(move || {
                    // A panicking state function must trip the stop latch
                    // right here, not when the launcher eventually joins
                    // this thread.
                    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        run_worker(&spec, connector.as_ref(), &config, &worker_start, &worker_stop)
                    }))
                    .unwrap_or_else(|payload| Outcome::panicked(tid, render_panic(&*payload)));
                    worker_aggregator.record(outcome);
                });
            match spawned {
                Ok(handle) => handles.push((tid, handle)),
                Err(err) => {
                    // An unspawned worker still owes the barrier its arrival,
                    // and its failure stops the rest of the run.
                    start_latch.count_down();
                    aggregator.record(Outcome::failure(
                        tid,
                        &HarnessError::Assertion(format!("spawning worker {tid}: {err}")),
                    ));
                }
            }
        }

        // Worker panics are caught and recorded in-thread; this only catches
        // a panic that escaped the recording itself.
        for (tid, handle) in handles {
            if let Err(payload) = handle.join() {
                aggregator.record(Outcome::panicked(tid, render_panic(&*payload)));
            }
        }

        aggregator.into_report()
    }
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("db_name", &self.db_name)
            .field("coll_name", &self.coll_name)
            .field("base_seed", &self.base_seed)
            .field("docs_per_thread", &self.docs_per_thread)
            .finish_non_exhaustive()
    }
}

/// One worker's whole life: bootstrap, state loop, outcome.
fn run_worker(
    spec: &WorkerSpec,
    connector: &dyn Connector,
    config: &WorkloadConfig,
    start_latch: &CountdownLatch,
    stop_latch: &CountdownLatch,
) -> Outcome {
    let (store, mut cx) = match SessionBootstrap::new(spec, connector, start_latch).run() {
        Ok(ready) => ready,
        Err(err) => return Outcome::failure(spec.tid, &err),
    };

    // Each worker gets its own copy of the merged workload data.
    cx.scratch
        .extend(config.data.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut executor = FsmExecutor::new(config, stop_latch);
    match executor.run(&mut cx, store.as_ref()) {
        Ok(summary) => {
            // The loop may end in a write state with expectations still
            // queued; they must be verified before the worker reports
            // success. Workloads that never used the oracle are left alone.
            if cx.oracle.pending_len() > 0 {
                if let Err(err) = cx.oracle.check(store.as_ref(), &cx.coll_name) {
                    return Outcome::failure(spec.tid, &err);
                }
            }
            Outcome::success(spec.tid, summary)
        }
        Err(err) => Outcome::failure(spec.tid, &err),
    }
}

/// Renders a panic payload into a displayable string.
fn render_panic(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(ToString::to_string))
        .unwrap_or_else(|| "opaque panic payload".to_string())
}
