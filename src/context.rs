//! Per-worker specifications and execution state.
//!
//! A `WorkerSpec` is created once by the launcher before spawn and owned
//! exclusively by its worker. The `ExecutionContext` is the mutable state bag
//! threaded through every state-function call; it is never shared between
//! workers.

use std::collections::BTreeMap;

use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::oracle::ConsistencyOracle;
use crate::retry::RetryStack;
use crate::store::{ChunkRange, ClusterTime, DocumentId};

/// Stepdown-injection configuration for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepdownConfig {
    /// Interval between induced stepdowns, in milliseconds.
    pub interval_ms: u64,
    /// Attempt budget for the stepdown-aware retry layer.
    pub max_retry_attempts: u32,
}

impl Default for StepdownConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            max_retry_attempts: 10,
        }
    }
}

/// Read-only topology description of the cluster under test.
///
/// Constructed once before spawn and treated as read-mostly: workers read
/// routing information from it concurrently but never mutate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    /// Host list for routing.
    pub hosts: Vec<String>,
    /// Replica-set name, when connections should use replica-set routing.
    pub replica_set: Option<String>,
    /// Whether the collection is sharded (chunk migration available).
    pub sharded: bool,
    /// Number of shards to spread chunks over.
    pub shard_count: u32,
    /// Stepdown injection, when configured for this run.
    pub stepdown: Option<StepdownConfig>,
    /// Whether the cluster guarantees exactly-once application of
    /// multi-document writes under concurrent chunk migration. When false the
    /// oracle falls back to duplicate detection only.
    pub exactly_once_multi_writes: bool,
}

impl Default for ClusterDescriptor {
    fn default() -> Self {
        Self {
            hosts: vec!["localhost:27017".to_string()],
            replica_set: None,
            sharded: true,
            shard_count: 2,
            stepdown: None,
            exactly_once_multi_writes: true,
        }
    }
}

/// Options for opening a logical session.
///
/// `raw_cluster_time` crosses the thread boundary as a serialized scalar; the
/// bootstrap deserializes it into a typed [`ClusterTime`] and clears the raw
/// field so downstream code advances the clock through an explicit call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Serialized initial cluster time, if one was captured before spawn.
    pub raw_cluster_time: Option<String>,
    /// Whether reads should be causally consistent within the session.
    pub causal_consistency: bool,
}

/// A per-worker logical session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Client-assigned session id.
    pub lsid: u64,
    /// Highest cluster time observed by this session.
    cluster_time: Option<ClusterTime>,
    /// Monotonic transaction number for retryable writes.
    txn_number: u64,
    /// Whether causal consistency was requested.
    pub causal_consistency: bool,
}

impl Session {
    /// Opens a session with the given id and hydrated cluster time.
    #[must_use]
    pub const fn new(lsid: u64, cluster_time: Option<ClusterTime>, causal: bool) -> Self {
        Self {
            lsid,
            cluster_time,
            txn_number: 0,
            causal_consistency: causal,
        }
    }

    /// Returns the session's current cluster time.
    #[must_use]
    pub const fn cluster_time(&self) -> Option<ClusterTime> {
        self.cluster_time
    }

    /// Advances the session clock; older times are ignored.
    pub fn advance_cluster_time(&mut self, time: ClusterTime) {
        if self.cluster_time.is_none_or(|current| time > current) {
            self.cluster_time = Some(time);
        }
    }

    /// Returns the next transaction number for a retryable write.
    pub fn next_txn_number(&mut self) -> u64 {
        self.txn_number += 1;
        self.txn_number
    }
}

/// The disjoint subset of document ids a worker owns.
///
/// Partitioning, not locking, is the concurrency-safety mechanism: for any
/// two workers `i != j` the partitions are disjoint for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnedPartition {
    /// Owning worker's thread id.
    pub tid: u32,
    /// Total worker count the id space is striped over.
    pub thread_count: u32,
    /// Documents owned per worker.
    pub docs_per_thread: u64,
}

impl OwnedPartition {
    /// Creates the partition for one worker.
    #[must_use]
    pub const fn new(tid: u32, thread_count: u32, docs_per_thread: u64) -> Self {
        Self {
            tid,
            thread_count,
            docs_per_thread,
        }
    }

    /// First owned id (inclusive).
    #[must_use]
    pub const fn start(&self) -> DocumentId {
        self.tid as u64 * self.docs_per_thread
    }

    /// One past the last owned id.
    #[must_use]
    pub const fn end(&self) -> DocumentId {
        self.start() + self.docs_per_thread
    }

    /// Iterates the owned ids.
    pub fn ids(&self) -> impl Iterator<Item = DocumentId> {
        self.start()..self.end()
    }

    /// Returns true if the id belongs to this partition.
    #[must_use]
    pub const fn contains(&self, id: DocumentId) -> bool {
        id >= self.start() && id < self.end()
    }

    /// Returns the partition as a contiguous chunk range.
    #[must_use]
    pub const fn range(&self) -> ChunkRange {
        ChunkRange::new(self.start(), self.end())
    }

    /// Returns true if the two partitions share no ids.
    #[must_use]
    pub const fn is_disjoint(&self, other: &Self) -> bool {
        self.end() <= other.start() || other.end() <= self.start()
    }
}

/// Immutable per-worker specification, created once before spawn.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Unique worker thread id.
    pub tid: u32,
    /// Host this worker connects to.
    pub host: String,
    /// Target database name.
    pub db_name: String,
    /// Target collection name.
    pub coll_name: String,
    /// Cluster topology, read-only.
    pub cluster: ClusterDescriptor,
    /// Session options; `None` means a session-less handle.
    pub session_options: Option<SessionOptions>,
    /// Seed for this worker's RNG stream (base seed + tid).
    pub rng_seed: u64,
    /// This worker's owned-id partition.
    pub partition: OwnedPartition,
}

/// Mutable per-worker state threaded through every state-function call.
///
/// Exclusively owned and mutated by its worker; requires no locking by
/// construction.
pub struct ExecutionContext {
    /// Worker thread id.
    pub tid: u32,
    /// Target database name.
    pub db_name: String,
    /// Target collection name.
    pub coll_name: String,
    /// Owned-id partition.
    pub partition: OwnedPartition,
    /// Logical session, when one was opened.
    pub session: Option<Session>,
    /// Seeded RNG stream; every probabilistic choice draws from it.
    pub rng: ChaCha8Rng,
    /// Installed operation interceptors.
    pub retry: RetryStack,
    /// Change-event bookkeeping for this worker.
    pub oracle: ConsistencyOracle,
    /// Scratch values workload states share across steps.
    pub scratch: BTreeMap<String, serde_json::Value>,
    /// Per-worker logging span, parameterized by `tid`.
    pub span: tracing::Span,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("tid", &self.tid)
            .field("coll_name", &self.coll_name)
            .field("partition", &self.partition)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partitions_are_disjoint() {
        let parts: Vec<_> = (0..4).map(|tid| OwnedPartition::new(tid, 4, 100)).collect();
        for (i, a) in parts.iter().enumerate() {
            for (j, b) in parts.iter().enumerate() {
                if i == j {
                    assert!(!a.is_disjoint(b));
                } else {
                    assert!(a.is_disjoint(b), "partitions {i} and {j} overlap");
                }
            }
        }
    }

    #[test]
    fn test_partition_bounds() {
        let part = OwnedPartition::new(3, 5, 100);
        assert_eq!(part.start(), 300);
        assert_eq!(part.end(), 400);
        assert!(part.contains(300));
        assert!(part.contains(399));
        assert!(!part.contains(400));
        assert_eq!(part.ids().count(), 100);
    }

    #[test]
    fn test_session_clock_only_advances() {
        let mut session = Session::new(1, None, false);
        session.advance_cluster_time(ClusterTime::new(10, 1));
        session.advance_cluster_time(ClusterTime::new(9, 7));
        assert_eq!(session.cluster_time(), Some(ClusterTime::new(10, 1)));
        session.advance_cluster_time(ClusterTime::new(10, 2));
        assert_eq!(session.cluster_time(), Some(ClusterTime::new(10, 2)));
    }

    #[test]
    fn test_txn_numbers_are_monotonic() {
        let mut session = Session::new(1, None, false);
        assert_eq!(session.next_txn_number(), 1);
        assert_eq!(session.next_txn_number(), 2);
    }
}
