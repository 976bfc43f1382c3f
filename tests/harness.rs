//! End-to-end runs of the workload harness against the simulated cluster.
//!
//! These tests verify the properties the harness is built around:
//! - Full-run determinism from a base seed
//! - Partition disjointness under concurrent multi-writes
//! - Change-stream verification in both oracle modes
//! - Cooperative stop on the first worker failure
//! - Overlay precedence during workload composition

#![allow(clippy::too_many_lines)] // Complex tests with many verification steps
#![allow(clippy::cast_possible_truncation)] // Bounded by test parameters

use std::collections::BTreeMap;
use std::sync::Arc;

use fsm_workload::sim::{FaultPlan, SimStore};
use fsm_workload::{
    compose, migrate, CountdownLatch, Document, FsmExecutor, FsmSummary, HarnessError, Launcher,
    OperationType, OwnedPartition, RunReport, SessionBootstrap, StateFn, StepdownConfig,
    Transition, WorkerSpec, WorkloadDecl, WorkloadOverlay,
};

// ============================================================================
// Helpers
// ============================================================================

const DB: &str = "testdb";
const COLL: &str = "harness";

fn launcher_for(store: &SimStore) -> Launcher {
    Launcher::new(Arc::new(store.clone()), store.descriptor())
        .namespace(DB, COLL)
        .docs_per_thread(10)
}

/// Summaries keyed by tid; outcome order follows completion order, which is
/// scheduling-dependent.
fn summaries_by_tid(report: &RunReport) -> BTreeMap<u32, FsmSummary> {
    report
        .outcomes()
        .iter()
        .filter_map(|o| Some((o.tid, o.summary.clone()?)))
        .collect()
}

/// A workload where every worker stamps its tid into its own documents.
fn stamping_workload(threads: u32, iterations: u64) -> WorkloadDecl {
    let stamp: StateFn = Arc::new(|cx, store| {
        let docs: Vec<Document> = cx
            .partition
            .ids()
            .map(|id| Document {
                id,
                value: i64::from(cx.tid),
                payload: bytes::Bytes::from(format!("owner-{}", cx.tid)),
            })
            .collect();
        store.insert_many(&cx.coll_name, &docs)?;
        Ok(())
    });

    WorkloadDecl::new("stamping")
        .state("stamp", stamp)
        .transitions("stamp", vec![Transition::new("stamp", 1.0)])
        .start_state("stamp")
        .iterations(iterations)
        .thread_count(threads)
}

// ============================================================================
// Determinism
// ============================================================================

#[test]
fn full_run_is_reproducible_from_the_base_seed() {
    let run = |base_seed: u64| {
        let store = SimStore::builder().seed(1).build();
        let report = launcher_for(&store)
            .base_seed(base_seed)
            .run(&migrate::workload(), &[])
            .expect("run");
        assert!(report.is_ok());
        let traces: BTreeMap<u32, Vec<String>> = summaries_by_tid(&report)
            .into_iter()
            .map(|(tid, s)| (tid, s.state_trace))
            .collect();
        (traces, store.collection_snapshot(COLL))
    };

    let (traces_a, docs_a) = run(99);
    let (traces_b, docs_b) = run(99);
    assert_eq!(traces_a, traces_b, "same seed must replay the same states");
    assert_eq!(docs_a, docs_b, "same seed must leave the same documents");

    let (traces_c, _) = run(100);
    assert_ne!(traces_c, traces_a, "a different seed should diverge");
}

// ============================================================================
// Partition safety
// ============================================================================

#[test]
fn concurrent_writers_never_touch_foreign_documents() {
    let store = SimStore::builder().build();
    let report = launcher_for(&store)
        .run(&stamping_workload(8, 50), &[])
        .expect("run");
    assert!(report.is_ok());

    let docs = store.collection_snapshot(COLL);
    assert_eq!(docs.len(), 80);
    for (id, doc) in docs {
        let owner = id / 10;
        assert_eq!(
            doc.value,
            i64::try_from(owner).expect("small id"),
            "document {id} was written by a worker that does not own it"
        );
    }
}

// ============================================================================
// Oracle modes
// ============================================================================

#[test]
fn exactly_once_run_with_faults_stays_clean() {
    let store = SimStore::builder()
        .seed(6)
        .faults(FaultPlan {
            transient_error_rate: 0.1,
            post_apply_error_rate: 0.2,
            exactly_once: true,
            ..FaultPlan::default()
        })
        .build();
    let mut cluster = store.descriptor();
    cluster.stepdown = Some(StepdownConfig::default());

    let report = Launcher::new(Arc::new(store.clone()), cluster)
        .namespace(DB, COLL)
        .docs_per_thread(10)
        .base_seed(6)
        .run(&migrate::workload(), &[])
        .expect("run");
    assert!(
        report.is_ok(),
        "failures: {:?}",
        report.failures().collect::<Vec<_>>()
    );
}

#[test]
fn best_effort_mode_tolerates_retried_deletes() {
    // Deletes apply, the acknowledgement is lost, and the idempotent retry
    // re-issues them. Dedup-only verification must not flag that.
    let store = SimStore::builder()
        .seed(6)
        .faults(FaultPlan {
            post_apply_error_rate: 0.5,
            exactly_once: false,
            ..FaultPlan::default()
        })
        .build();

    let report = launcher_for(&store)
        .base_seed(6)
        .run(&migrate::workload(), &[])
        .expect("run");
    assert!(
        report.is_ok(),
        "failures: {:?}",
        report.failures().collect::<Vec<_>>()
    );
}

#[test]
fn best_effort_mode_still_catches_duplicate_delivery() {
    let store = SimStore::builder()
        .seed(6)
        .faults(FaultPlan {
            duplicate_event_rate: 0.5,
            exactly_once: false,
            ..FaultPlan::default()
        })
        .build();

    let report = launcher_for(&store)
        .base_seed(6)
        .run(&migrate::workload(), &[])
        .expect("run");
    assert!(!report.is_ok(), "duplicate delivery went unnoticed");
}

// ============================================================================
// Exactly-once liveness
// ============================================================================

/// Drives a single worker by hand through the migration workload and inspects
/// its oracle after the loop plus the final drain.
#[test]
fn a_finished_worker_has_no_unverified_expectations() {
    let store = SimStore::builder().seed(2).build();
    let start = CountdownLatch::new(1);
    let spec = WorkerSpec {
        tid: 0,
        host: "sim://local".to_string(),
        db_name: DB.to_string(),
        coll_name: COLL.to_string(),
        cluster: store.descriptor(),
        session_options: None,
        rng_seed: 7,
        partition: OwnedPartition::new(0, 5, 10),
    };
    let (handle, mut cx) = SessionBootstrap::new(&spec, &store, &start)
        .run()
        .expect("bootstrap");

    let overlay = WorkloadOverlay {
        iterations: Some(50),
        thread_count: Some(5),
        ..WorkloadOverlay::default()
    };
    let config = compose(&migrate::workload(), &[overlay]).expect("compose");
    let stop = CountdownLatch::new(1);
    FsmExecutor::new(&config, &stop)
        .run(&mut cx, handle.as_ref())
        .expect("run");

    // The loop can end in a write state with expectations still queued; the
    // final drain must verify every one of them.
    cx.oracle.check(handle.as_ref(), COLL).expect("final drain");
    assert_eq!(cx.oracle.pending_len(), 0, "expected events never verified");
}

/// An expectation queued by the last step has no later check state to verify
/// it; the launcher must still refuse to call the run clean.
#[test]
fn unmet_expectations_fail_the_run_without_a_check_state() {
    let phantom: StateFn = Arc::new(|cx, _store| {
        cx.oracle
            .expect(OperationType::Update, cx.partition.start(), Some(1));
        Ok(())
    });
    let decl = WorkloadDecl::new("phantom")
        .state("expect", phantom)
        .transitions("expect", Vec::new())
        .start_state("expect")
        .iterations(1)
        .thread_count(1);

    let store = SimStore::builder().build();
    let report = launcher_for(&store).run(&decl, &[]).expect("run");
    assert!(!report.is_ok(), "an unverified expectation went unnoticed");
}

// ============================================================================
// Cooperative stop
// ============================================================================

#[test]
fn first_failure_stops_every_worker_at_a_step_boundary() {
    let fail_worker_zero: StateFn = Arc::new(|cx, _store| {
        if cx.tid == 0 {
            Err(HarnessError::Assertion("worker zero trips".into()))
        } else {
            Ok(())
        }
    });

    let overlay = WorkloadOverlay {
        states: BTreeMap::from([("init".to_string(), fail_worker_zero)]),
        iterations: Some(100_000),
        thread_count: Some(4),
        ..WorkloadOverlay::default()
    };

    let store = SimStore::builder().build();
    let report = launcher_for(&store)
        .run(&migrate::workload(), &[overlay])
        .expect("run");

    assert!(!report.is_ok());
    let failed: Vec<u32> = report.failures().map(|o| o.tid).collect();
    assert_eq!(failed, vec![0]);
    for (tid, summary) in summaries_by_tid(&report) {
        if tid != 0 {
            assert!(summary.stopped_early, "worker {tid} ignored the stop");
            assert!(summary.steps < 100_000);
        }
    }
}

/// A panic is recorded the moment the worker thread unwinds, so peers stop at
/// their next step boundary instead of running out their budgets first.
#[test]
fn a_panicking_worker_stops_its_peers_promptly() {
    let panic_last_worker: StateFn = Arc::new(|cx, _store| {
        assert!(cx.tid != 3, "worker three blew up");
        Ok(())
    });

    let overlay = WorkloadOverlay {
        states: BTreeMap::from([("init".to_string(), panic_last_worker)]),
        iterations: Some(100_000),
        thread_count: Some(4),
        ..WorkloadOverlay::default()
    };

    let store = SimStore::builder().build();
    let report = launcher_for(&store)
        .run(&migrate::workload(), &[overlay])
        .expect("run");

    assert!(!report.is_ok());
    let failed: Vec<u32> = report.failures().map(|o| o.tid).collect();
    assert_eq!(failed, vec![3]);
    let payload = report
        .failures()
        .next()
        .and_then(|o| o.panic.clone())
        .expect("panic payload recorded");
    assert!(payload.contains("worker three blew up"));
    for (tid, summary) in summaries_by_tid(&report) {
        if tid != 3 {
            assert!(summary.stopped_early, "worker {tid} ignored the stop");
            assert!(summary.steps < 100_000);
        }
    }
}

// ============================================================================
// Composition precedence
// ============================================================================

#[test]
fn later_overlays_win_and_base_keys_survive() {
    let seen: Arc<std::sync::Mutex<BTreeMap<u32, (i64, i64)>>> =
        Arc::new(std::sync::Mutex::new(BTreeMap::new()));

    let read_scratch: StateFn = {
        let seen = Arc::clone(&seen);
        Arc::new(move |cx, _store| {
            let get = |key: &str| {
                cx.scratch
                    .get(key)
                    .and_then(serde_json::Value::as_i64)
                    .unwrap_or(-1)
            };
            seen.lock()
                .expect("lock poisoned")
                .insert(cx.tid, (get("shared"), get("base_only")));
            Ok(())
        })
    };

    let base = WorkloadDecl::new("precedence")
        .state("read", read_scratch)
        .transitions("read", Vec::new())
        .start_state("read")
        .iterations(100)
        .thread_count(5)
        .data_value("shared", serde_json::Value::from(1))
        .data_value("base_only", serde_json::Value::from(7));

    let first = WorkloadOverlay {
        data: BTreeMap::from([("shared".to_string(), serde_json::Value::from(2))]),
        iterations: Some(30),
        ..WorkloadOverlay::default()
    };
    let second = WorkloadOverlay {
        data: BTreeMap::from([("shared".to_string(), serde_json::Value::from(3))]),
        iterations: Some(1),
        thread_count: Some(3),
        ..WorkloadOverlay::default()
    };

    let store = SimStore::builder().build();
    let report = launcher_for(&store)
        .run(&base, &[first, second])
        .expect("run");
    assert!(report.is_ok());

    // The last overlay's budgets won.
    assert_eq!(report.outcomes().len(), 3);
    assert_eq!(report.total_steps(), 3);

    // The last overlay's data won, and base-only keys were preserved.
    let seen = seen.lock().expect("lock poisoned");
    assert_eq!(seen.len(), 3);
    for (shared, base_only) in seen.values() {
        assert_eq!(*shared, 3);
        assert_eq!(*base_only, 7);
    }
}
