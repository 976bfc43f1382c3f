//! Store collaborator interface.
//!
//! The harness never implements the database engine; it issues commands
//! through the [`DocumentStore`] trait and consumes an ordered, resumable
//! change-notification stream through [`ChangeCursor`]. The exact wire format
//! is out of scope: implementations return either a success payload or a
//! typed [`StoreError`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a single document.
pub type DocumentId = u64;

/// A document in the store: an id, an integer value, and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Document identifier.
    pub id: DocumentId,
    /// Current value, overwritten by multi-updates.
    pub value: i64,
    /// Opaque payload body.
    pub payload: Bytes,
}

/// The kind of data modification an operation or change event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperationType {
    /// Document insertion.
    Insert,
    /// Multi-document update.
    Update,
    /// Multi-document delete.
    Delete,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Logical cluster timestamp.
///
/// Ordered lexicographically by `(seconds, increment)`. Serializable so it
/// can cross a worker boundary as data rather than as embedded live state.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ClusterTime {
    /// Wall-clock seconds component.
    pub seconds: u64,
    /// Ordering increment within the same second.
    pub increment: u32,
}

impl ClusterTime {
    /// Creates a cluster time from its components.
    #[must_use]
    pub const fn new(seconds: u64, increment: u32) -> Self {
        Self { seconds, increment }
    }
}

/// Opaque position token for resuming a change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResumeToken(pub u64);

/// Where to open a change stream from.
#[derive(Debug, Clone, Copy)]
pub enum ResumePoint {
    /// Resume after a previously observed token.
    Token(ResumeToken),
    /// Start at a logical time saved before the workload began.
    StartTime(ClusterTime),
}

/// A single change-notification event.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Affected document.
    pub doc_id: DocumentId,
    /// What happened to the document.
    pub operation: OperationType,
    /// Resulting value (`None` for deletes).
    pub value: Option<i64>,
    /// Payload body; for deletes, the deleted document's payload when the
    /// store provides it.
    pub payload: Option<Bytes>,
    /// Token positioning this event in the stream.
    pub token: ResumeToken,
}

impl ChangeEvent {
    /// CRC-64 fingerprint of the event body, used by the best-effort oracle
    /// to distinguish distinct writes from duplicate delivery of one write.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        use crc::{Crc, CRC_64_ECMA_182};

        const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

        let mut digest = CRC64.digest();
        digest.update(&self.doc_id.to_be_bytes());
        digest.update(&[match self.operation {
            OperationType::Insert => 0,
            OperationType::Update => 1,
            OperationType::Delete => 2,
        }]);
        if let Some(value) = self.value {
            digest.update(&value.to_be_bytes());
        }
        if let Some(payload) = &self.payload {
            digest.update(payload);
        }
        digest.finalize()
    }
}

/// A contiguous key range of a sharded collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// Inclusive lower bound.
    pub min: DocumentId,
    /// Exclusive upper bound.
    pub max: DocumentId,
}

impl ChunkRange {
    /// Creates a chunk range `[min, max)`.
    #[must_use]
    pub const fn new(min: DocumentId, max: DocumentId) -> Self {
        Self { min, max }
    }

    /// Returns true if the range contains the given id.
    #[must_use]
    pub const fn contains(&self, id: DocumentId) -> bool {
        id >= self.min && id < self.max
    }
}

/// Errors returned by store operations.
///
/// The transient classes are exactly the ones the retry stack knows how to
/// recover from; everything else propagates to the state function.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Network failure talking to the store.
    #[error("network error: {message} (side effect possible: {side_effect_possible})")]
    Network {
        /// Description of the failure.
        message: String,
        /// True when the command may already have been applied, which makes a
        /// blind retry unsafe for non-idempotent operations.
        side_effect_possible: bool,
    },

    /// The routed node is not (or no longer) the primary.
    #[error("not primary: {0}")]
    NotPrimary(String),

    /// A conflicting background operation is still in progress.
    #[error("background operation in progress: {0}")]
    BackgroundOperationInProgress(String),

    /// The target database is replicating a drop and cannot accept writes yet.
    #[error("database drop pending: {0}")]
    DropPending(String),

    /// Legacy hashed-shard-key routing rejected the command.
    #[error("hashed shard key: {0}")]
    HashedShardKey(String),

    /// The command itself failed; never retried.
    #[error("command failed: {0}")]
    Command(String),

    /// The change-stream cursor was invalidated and must be reopened.
    #[error("cursor closed: {0}")]
    CursorClosed(String),
}

impl StoreError {
    /// Returns true if this error belongs to a transient class that a retry
    /// layer may recover from.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::NotPrimary(_)
                | Self::BackgroundOperationInProgress(_)
                | Self::DropPending(_)
                | Self::HashedShardKey(_)
        )
    }

    /// Returns true if the failed call may already have taken effect.
    #[must_use]
    pub const fn side_effect_possible(&self) -> bool {
        matches!(
            self,
            Self::Network {
                side_effect_possible: true,
                ..
            }
        )
    }
}

/// A resumable, ordered change-notification cursor.
pub trait ChangeCursor {
    /// Returns the next currently available event, or `None` when the stream
    /// is drained up to its current tail.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor was invalidated.
    fn try_next(&mut self) -> Result<Option<ChangeEvent>, StoreError>;

    /// Returns the token of the last event returned, if any.
    fn resume_token(&self) -> Option<ResumeToken>;
}

/// Command surface of the system under test.
///
/// One handle per worker; handles must not share mutable state with each
/// other beyond what the store itself synchronizes.
pub trait DocumentStore: Send + std::fmt::Debug {
    /// Inserts the given documents into a collection.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on failure; transient classes are retryable.
    fn insert_many(&self, coll: &str, docs: &[Document]) -> Result<(), StoreError>;

    /// Updates every listed document to the given value in one multi-write.
    ///
    /// Returns the number of documents modified. During an active chunk
    /// migration the store may apply the write more than once per document;
    /// callers must not assume exactly-once effects unless the cluster
    /// promises them.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on failure; transient classes are retryable.
    fn multi_update(&self, coll: &str, ids: &[DocumentId], value: i64) -> Result<u64, StoreError>;

    /// Deletes every listed document in one multi-write.
    ///
    /// Returns the number of documents removed. Same exactly-once caveat as
    /// [`multi_update`](Self::multi_update).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on failure; transient classes are retryable.
    fn multi_delete(&self, coll: &str, ids: &[DocumentId]) -> Result<u64, StoreError>;

    /// Migrates a chunk of the collection to another shard.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on failure; transient classes are retryable.
    fn move_chunk(&self, coll: &str, range: ChunkRange, to_shard: u32) -> Result<(), StoreError>;

    /// Opens a change stream over the collection from the given position.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the stream cannot be opened.
    fn open_change_stream(
        &self,
        coll: &str,
        from: ResumePoint,
    ) -> Result<Box<dyn ChangeCursor>, StoreError>;

    /// Returns the store's current logical cluster time.
    fn cluster_time(&self) -> ClusterTime;
}

/// Produces one [`DocumentStore`] handle per worker.
pub trait Connector: Send + Sync {
    /// Opens a connection for the given host.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the connection cannot be established.
    fn connect(&self, host: &str) -> Result<Box<dyn DocumentStore>, StoreError>;
}
