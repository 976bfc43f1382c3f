//! Chunk migration workload with change-stream verification.
//!
//! Every worker repeatedly multi-updates and multi-deletes documents inside
//! its own partition while chunks move between shards, then checks the
//! change stream against its queued expectations. All writes go through the
//! retry stack; every write the worker issues is registered with its oracle
//! before the check state drains the stream.
//!
//! The worker tracks which of its ids are live in its scratch map, so each
//! write targets exactly the documents that exist and the expected event set
//! is known before the command is sent.

use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use serde_json::Value;

use crate::config::{HookFn, StateFn, Transition, WorkloadDecl};
use crate::context::ExecutionContext;
use crate::error::HarnessError;
use crate::retry::Idempotency;
use crate::store::{Document, DocumentId, OperationType};

/// Scratch key: one past the highest live id in the worker's partition.
const LIVE_UPTO: &str = "live_upto";
/// Scratch key: shard count, inserted by the setup hook.
const SHARDS: &str = "shards";

/// Default iteration budget per worker.
pub const DEFAULT_ITERATIONS: u64 = 100;
/// Default worker count.
pub const DEFAULT_THREADS: u32 = 5;

/// Builds the migration workload declaration.
#[must_use]
pub fn workload() -> WorkloadDecl {
    let setup: HookFn = Arc::new(|data, _store, cluster| {
        data.insert(SHARDS.to_string(), Value::from(cluster.shard_count));
        Ok(())
    });

    WorkloadDecl::new("migrate")
        .state("init", init_state())
        .state("multi_update", multi_update_state())
        .state("multi_delete", multi_delete_state())
        .state("move_chunk", move_chunk_state())
        .state("check_consistency", check_state())
        .transitions(
            "init",
            vec![
                Transition::new("multi_update", 0.4),
                Transition::new("multi_delete", 0.2),
                Transition::new("move_chunk", 0.2),
                Transition::new("check_consistency", 0.2),
            ],
        )
        .transitions(
            "multi_update",
            vec![
                Transition::new("multi_update", 0.25),
                Transition::new("multi_delete", 0.2),
                Transition::new("move_chunk", 0.25),
                Transition::new("check_consistency", 0.3),
            ],
        )
        .transitions(
            "multi_delete",
            vec![
                Transition::new("init", 0.5),
                Transition::new("move_chunk", 0.2),
                Transition::new("check_consistency", 0.3),
            ],
        )
        .transitions(
            "move_chunk",
            vec![
                Transition::new("multi_update", 0.4),
                Transition::new("multi_delete", 0.2),
                Transition::new("check_consistency", 0.4),
            ],
        )
        .transitions(
            "check_consistency",
            vec![
                Transition::new("init", 0.3),
                Transition::new("multi_update", 0.5),
                Transition::new("move_chunk", 0.2),
            ],
        )
        .start_state("init")
        .iterations(DEFAULT_ITERATIONS)
        .thread_count(DEFAULT_THREADS)
        .setup(setup)
}

/// Reads the live-id upper bound from scratch; before the first init nothing
/// is live.
fn live_upto(cx: &ExecutionContext) -> DocumentId {
    cx.scratch
        .get(LIVE_UPTO)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| cx.partition.start())
}

fn set_live_upto(cx: &mut ExecutionContext, upto: DocumentId) {
    cx.scratch.insert(LIVE_UPTO.to_string(), Value::from(upto));
}

/// Payloads embed the insert value, so every incarnation of a document is
/// distinguishable by content. Without this, deleting and re-inserting the
/// same id would produce byte-identical delete events across cycles.
fn payload_for(id: DocumentId, value: i64) -> Bytes {
    Bytes::from(format!("doc-{id}-{value}"))
}

/// Re-inserts every dead id in the partition, restoring the full range.
fn init_state() -> StateFn {
    Arc::new(|cx, store| {
        let upto = live_upto(cx);
        let end = cx.partition.end();
        if upto >= end {
            return Ok(());
        }

        // Values are drawn from a wide range so two distinct writes never
        // share a content fingerprint by coincidence.
        let value = cx.rng.gen_range(0..i64::MAX);
        let docs: Vec<Document> = (upto..end)
            .map(|id| Document {
                id,
                value,
                payload: payload_for(id, value),
            })
            .collect();

        for doc in &docs {
            cx.oracle
                .expect(OperationType::Insert, doc.id, Some(doc.value));
        }
        if let Some(session) = &mut cx.session {
            session.next_txn_number();
        }
        cx.retry
            .run(Idempotency::Idempotent, || {
                store.insert_many(&cx.coll_name, &docs)
            })
            .map_err(HarnessError::Store)?;

        set_live_upto(cx, end);
        tracing::debug!(tid = cx.tid, inserted = docs.len(), "partition restored");
        Ok(())
    })
}

/// Updates every live document in the partition to a fresh value.
fn multi_update_state() -> StateFn {
    Arc::new(|cx, store| {
        let upto = live_upto(cx);
        let ids: Vec<DocumentId> = (cx.partition.start()..upto).collect();
        if ids.is_empty() {
            return Ok(());
        }

        let value = cx.rng.gen_range(0..i64::MAX);
        for &id in &ids {
            cx.oracle.expect(OperationType::Update, id, Some(value));
        }
        // Retryable write: the session's txn number is the client-assigned
        // identity that makes the repeat safe.
        let idempotency = if let Some(session) = &mut cx.session {
            session.next_txn_number();
            Idempotency::Idempotent
        } else {
            Idempotency::NonIdempotent
        };
        cx.retry
            .run(idempotency, || store.multi_update(&cx.coll_name, &ids, value))
            .map_err(HarnessError::Store)?;
        Ok(())
    })
}

/// Deletes a random suffix of the live range.
fn multi_delete_state() -> StateFn {
    Arc::new(|cx, store| {
        let upto = live_upto(cx);
        let start = cx.partition.start();
        if upto <= start {
            return Ok(());
        }

        let cut = cx.rng.gen_range(start..upto);
        let ids: Vec<DocumentId> = (cut..upto).collect();
        for &id in &ids {
            cx.oracle.expect(OperationType::Delete, id, None);
        }
        if let Some(session) = &mut cx.session {
            session.next_txn_number();
        }
        cx.retry
            .run(Idempotency::Idempotent, || {
                store.multi_delete(&cx.coll_name, &ids)
            })
            .map_err(HarnessError::Store)?;

        set_live_upto(cx, cut);
        Ok(())
    })
}

/// Moves the partition's chunk to a random shard.
fn move_chunk_state() -> StateFn {
    Arc::new(|cx, store| {
        let shards = cx
            .scratch
            .get(SHARDS)
            .and_then(Value::as_u64)
            .unwrap_or(2)
            .max(1);
        #[allow(clippy::cast_possible_truncation)] // shard counts are small.
        let to_shard = cx.rng.gen_range(0..shards) as u32;
        let range = cx.partition.range();

        // Re-running a finished migration to the same target is a no-op.
        cx.retry
            .run(Idempotency::Idempotent, || {
                store.move_chunk(&cx.coll_name, range, to_shard)
            })
            .map_err(HarnessError::Store)?;
        tracing::debug!(tid = cx.tid, to_shard, "chunk moved");
        Ok(())
    })
}

/// Drains the change stream and matches it against queued expectations.
fn check_state() -> StateFn {
    Arc::new(|cx, store| {
        cx.oracle.check(store, &cx.coll_name)?;
        if let Some(session) = &mut cx.session {
            session.advance_cluster_time(store.cluster_time());
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::Launcher;
    use crate::sim::SimStore;

    #[test]
    fn test_exactly_once_run_is_clean() {
        let store = SimStore::builder().seed(4).build();
        let launcher = Launcher::new(Arc::new(store.clone()), store.descriptor())
            .namespace("test", "migrate")
            .docs_per_thread(8)
            .base_seed(21);

        let report = launcher.run(&workload(), &[]).expect("run");
        assert!(
            report.is_ok(),
            "failures: {:?}",
            report.failures().collect::<Vec<_>>()
        );
        assert!(store.migrations() > 0, "no chunk ever moved");
    }

    #[test]
    fn test_transient_errors_are_absorbed_by_the_stack() {
        let store = SimStore::builder()
            .seed(4)
            .transient_error_rate(0.2)
            .build();
        // Injected errors include stepdowns; the stepdown layer must be in
        // the stack for the run to survive them.
        let mut cluster = store.descriptor();
        cluster.stepdown = Some(crate::context::StepdownConfig::default());
        let launcher = Launcher::new(Arc::new(store.clone()), cluster)
            .namespace("test", "migrate")
            .docs_per_thread(8)
            .base_seed(21);

        let report = launcher.run(&workload(), &[]).expect("run");
        assert!(
            report.is_ok(),
            "failures: {:?}",
            report.failures().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_duplicate_delivery_is_flagged_in_best_effort_mode() {
        let store = SimStore::builder()
            .seed(4)
            .exactly_once(false)
            .duplicate_event_rate(1.0)
            .build();
        let launcher = Launcher::new(Arc::new(store.clone()), store.descriptor())
            .namespace("test", "migrate")
            .docs_per_thread(8)
            .base_seed(21);

        let report = launcher.run(&workload(), &[]).expect("run");
        assert!(!report.is_ok(), "duplicate delivery went unnoticed");
        let failure = report.failures().next().expect("a failing worker");
        let rendered = failure.error.as_deref().unwrap_or_default();
        assert!(
            rendered.contains("duplicate"),
            "unexpected failure: {rendered}"
        );
    }
}
