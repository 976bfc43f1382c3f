//! Deterministic in-memory store for harness testing.
//!
//! Implements the [`DocumentStore`] collaborator against shared in-process
//! state, with seeded fault injection: transient command errors, post-apply
//! network errors on deletes, and (when the cluster does not promise
//! exactly-once multi-writes) duplicate change-event delivery during chunk
//! migration. All injection draws from one seeded RNG, so a run is fully
//! reproducible from its seed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::context::ClusterDescriptor;
use crate::store::{
    ChangeCursor, ChangeEvent, ChunkRange, ClusterTime, Connector, Document, DocumentId,
    DocumentStore, OperationType, ResumePoint, ResumeToken, StoreError,
};

/// Fault-injection plan for a simulated run.
#[derive(Debug, Clone)]
pub struct FaultPlan {
    /// Probability that a mutating command fails with a transient error
    /// before applying (safe to retry blindly).
    pub transient_error_rate: f64,
    /// Probability that a multi-delete applies fully and then reports a
    /// network error with a possible side effect (retry must be idempotent).
    pub post_apply_error_rate: f64,
    /// Probability that a multi-write event is delivered twice while a chunk
    /// migration has occurred. Only effective when `exactly_once` is false;
    /// models the engine bug the best-effort oracle exists to catch.
    pub duplicate_event_rate: f64,
    /// Whether the simulated cluster applies multi-writes exactly once.
    pub exactly_once: bool,
}

impl Default for FaultPlan {
    fn default() -> Self {
        Self {
            transient_error_rate: 0.0,
            post_apply_error_rate: 0.0,
            duplicate_event_rate: 0.0,
            exactly_once: true,
        }
    }
}

/// One entry of the global ordered change log.
#[derive(Debug, Clone)]
struct LoggedEvent {
    coll: String,
    time: ClusterTime,
    doc_id: DocumentId,
    operation: OperationType,
    value: Option<i64>,
    payload: Option<bytes::Bytes>,
}

#[derive(Debug)]
struct StoreState {
    collections: BTreeMap<String, BTreeMap<DocumentId, Document>>,
    /// Per-collection chunk ownership: range start -> (range, shard).
    chunks: BTreeMap<String, BTreeMap<DocumentId, (ChunkRange, u32)>>,
    log: Vec<LoggedEvent>,
    clock: ClusterTime,
    migrations: u64,
    rng: ChaCha8Rng,
}

impl StoreState {
    fn tick(&mut self) -> ClusterTime {
        self.clock.increment += 1;
        self.clock
    }

    fn append_event(
        &mut self,
        coll: &str,
        doc_id: DocumentId,
        operation: OperationType,
        value: Option<i64>,
        payload: Option<bytes::Bytes>,
    ) {
        let time = self.tick();
        self.log.push(LoggedEvent {
            coll: coll.to_string(),
            time,
            doc_id,
            operation,
            value,
            payload,
        });
    }
}

/// Builder for a [`SimStore`].
#[derive(Debug)]
pub struct SimStoreBuilder {
    seed: u64,
    faults: FaultPlan,
    shard_count: u32,
}

impl SimStoreBuilder {
    /// Sets the fault-injection seed.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the full fault plan.
    #[must_use]
    pub fn faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    /// Sets the pre-apply transient error rate.
    #[must_use]
    pub const fn transient_error_rate(mut self, rate: f64) -> Self {
        self.faults.transient_error_rate = rate;
        self
    }

    /// Sets the duplicate event delivery rate.
    #[must_use]
    pub const fn duplicate_event_rate(mut self, rate: f64) -> Self {
        self.faults.duplicate_event_rate = rate;
        self
    }

    /// Sets whether multi-writes apply exactly once.
    #[must_use]
    pub const fn exactly_once(mut self, exactly_once: bool) -> Self {
        self.faults.exactly_once = exactly_once;
        self
    }

    /// Sets the shard count chunks are spread over.
    #[must_use]
    pub const fn shard_count(mut self, shards: u32) -> Self {
        self.shard_count = shards;
        self
    }

    /// Builds the store.
    #[must_use]
    pub fn build(self) -> SimStore {
        SimStore {
            inner: Arc::new(Inner {
                state: Mutex::new(StoreState {
                    collections: BTreeMap::new(),
                    chunks: BTreeMap::new(),
                    log: Vec::new(),
                    clock: ClusterTime::new(1, 0),
                    migrations: 0,
                    rng: ChaCha8Rng::seed_from_u64(self.seed),
                }),
                faults: self.faults,
                shard_count: self.shard_count,
            }),
        }
    }
}

impl Default for SimStoreBuilder {
    fn default() -> Self {
        Self {
            seed: 0,
            faults: FaultPlan::default(),
            shard_count: 2,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<StoreState>,
    faults: FaultPlan,
    shard_count: u32,
}

/// Shared in-memory store; cloning yields another handle to the same state.
#[derive(Debug, Clone)]
pub struct SimStore {
    inner: Arc<Inner>,
}

impl SimStore {
    /// Creates a builder with no faults.
    #[must_use]
    pub fn builder() -> SimStoreBuilder {
        SimStoreBuilder::default()
    }

    /// Returns a cluster descriptor matching this store's configuration.
    #[must_use]
    pub fn descriptor(&self) -> ClusterDescriptor {
        ClusterDescriptor {
            hosts: vec!["sim://local".to_string()],
            replica_set: Some("sim".to_string()),
            sharded: true,
            shard_count: self.inner.shard_count,
            stepdown: None,
            exactly_once_multi_writes: self.inner.faults.exactly_once,
        }
    }

    /// Returns a snapshot of a collection's documents.
    #[must_use]
    pub fn collection_snapshot(&self, coll: &str) -> BTreeMap<DocumentId, Document> {
        let state = self.inner.state.lock().expect("lock poisoned");
        state.collections.get(coll).cloned().unwrap_or_default()
    }

    /// Returns the number of chunk migrations performed so far.
    #[must_use]
    pub fn migrations(&self) -> u64 {
        self.inner.state.lock().expect("lock poisoned").migrations
    }

    /// Returns the total number of change events logged.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.inner.state.lock().expect("lock poisoned").log.len()
    }

    /// Draws a pre-apply transient error according to the fault plan.
    fn maybe_transient(&self, state: &mut StoreState) -> Result<(), StoreError> {
        let rate = self.inner.faults.transient_error_rate;
        if rate <= 0.0 || state.rng.gen::<f64>() >= rate {
            return Ok(());
        }
        // Rotate deterministically through the transient classes.
        let err = match state.rng.gen_range(0..4u8) {
            0 => StoreError::Network {
                message: "connection reset before dispatch".into(),
                side_effect_possible: false,
            },
            1 => StoreError::NotPrimary("injected stepdown".into()),
            2 => StoreError::BackgroundOperationInProgress("injected index build".into()),
            _ => StoreError::DropPending("injected drop".into()),
        };
        Err(err)
    }

    fn should_duplicate(&self, state: &mut StoreState) -> bool {
        let rate = self.inner.faults.duplicate_event_rate;
        !self.inner.faults.exactly_once
            && state.migrations > 0
            && rate > 0.0
            && state.rng.gen::<f64>() < rate
    }
}

impl DocumentStore for SimStore {
    fn insert_many(&self, coll: &str, docs: &[Document]) -> Result<(), StoreError> {
        let mut state = self.inner.state.lock().expect("lock poisoned");
        self.maybe_transient(&mut state)?;

        for doc in docs {
            state
                .collections
                .entry(coll.to_string())
                .or_default()
                .insert(doc.id, doc.clone());
            state.append_event(
                coll,
                doc.id,
                OperationType::Insert,
                Some(doc.value),
                Some(doc.payload.clone()),
            );
        }
        Ok(())
    }

    fn multi_update(&self, coll: &str, ids: &[DocumentId], value: i64) -> Result<u64, StoreError> {
        let mut state = self.inner.state.lock().expect("lock poisoned");
        self.maybe_transient(&mut state)?;

        let mut modified = 0u64;
        for &id in ids {
            let Some(doc) = state
                .collections
                .get_mut(coll)
                .and_then(|docs| docs.get_mut(&id))
            else {
                continue;
            };
            doc.value = value;
            let payload = doc.payload.clone();
            state.append_event(coll, id, OperationType::Update, Some(value), Some(payload.clone()));
            if self.should_duplicate(&mut state) {
                // Double application during migration: same content, new
                // position in the stream.
                state.append_event(coll, id, OperationType::Update, Some(value), Some(payload));
            }
            modified += 1;
        }
        Ok(modified)
    }

    fn multi_delete(&self, coll: &str, ids: &[DocumentId]) -> Result<u64, StoreError> {
        let mut state = self.inner.state.lock().expect("lock poisoned");
        self.maybe_transient(&mut state)?;

        let mut removed = 0u64;
        for &id in ids {
            let Some(doc) = state
                .collections
                .get_mut(coll)
                .and_then(|docs| docs.remove(&id))
            else {
                continue;
            };
            state.append_event(
                coll,
                id,
                OperationType::Delete,
                None,
                Some(doc.payload.clone()),
            );
            removed += 1;
        }

        // The delete applied; the acknowledgement may still be lost.
        let rate = self.inner.faults.post_apply_error_rate;
        if removed > 0 && rate > 0.0 && state.rng.gen::<f64>() < rate {
            return Err(StoreError::Network {
                message: "connection reset after apply".into(),
                side_effect_possible: true,
            });
        }
        Ok(removed)
    }

    fn move_chunk(&self, coll: &str, range: ChunkRange, to_shard: u32) -> Result<(), StoreError> {
        if range.min >= range.max {
            return Err(StoreError::Command(format!(
                "empty chunk range [{}, {})",
                range.min, range.max
            )));
        }
        if to_shard >= self.inner.shard_count {
            return Err(StoreError::Command(format!(
                "shard {to_shard} does not exist"
            )));
        }

        let mut state = self.inner.state.lock().expect("lock poisoned");
        self.maybe_transient(&mut state)?;

        state
            .chunks
            .entry(coll.to_string())
            .or_default()
            .insert(range.min, (range, to_shard));
        state.migrations += 1;
        state.tick();
        Ok(())
    }

    fn open_change_stream(
        &self,
        coll: &str,
        from: ResumePoint,
    ) -> Result<Box<dyn ChangeCursor>, StoreError> {
        let pos = {
            let state = self.inner.state.lock().expect("lock poisoned");
            match from {
                ResumePoint::Token(token) => {
                    let next = token.0 as usize + 1;
                    if next > state.log.len() {
                        return Err(StoreError::CursorClosed(format!(
                            "resume token {} past the log tail",
                            token.0
                        )));
                    }
                    next
                }
                ResumePoint::StartTime(time) => state
                    .log
                    .iter()
                    .position(|event| event.time > time)
                    .unwrap_or(state.log.len()),
            }
        };

        Ok(Box::new(SimCursor {
            inner: Arc::clone(&self.inner),
            coll: coll.to_string(),
            pos,
            last_token: None,
        }))
    }

    fn cluster_time(&self) -> ClusterTime {
        self.inner.state.lock().expect("lock poisoned").clock
    }
}

impl Connector for SimStore {
    fn connect(&self, _host: &str) -> Result<Box<dyn DocumentStore>, StoreError> {
        Ok(Box::new(self.clone()))
    }
}

/// Cursor over the shared change log, filtered to one collection.
struct SimCursor {
    inner: Arc<Inner>,
    coll: String,
    pos: usize,
    last_token: Option<ResumeToken>,
}

impl ChangeCursor for SimCursor {
    fn try_next(&mut self) -> Result<Option<ChangeEvent>, StoreError> {
        let state = self.inner.state.lock().expect("lock poisoned");
        while self.pos < state.log.len() {
            let index = self.pos;
            self.pos += 1;
            let logged = &state.log[index];
            if logged.coll != self.coll {
                continue;
            }
            let token = ResumeToken(index as u64);
            self.last_token = Some(token);
            return Ok(Some(ChangeEvent {
                doc_id: logged.doc_id,
                operation: logged.operation,
                value: logged.value,
                payload: logged.payload.clone(),
                token,
            }));
        }
        Ok(None)
    }

    fn resume_token(&self) -> Option<ResumeToken> {
        self.last_token
    }
}
