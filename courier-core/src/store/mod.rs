//! Storage seams for the outbox and the inbox.
//!
//! The processors are generic over these traits. [`postgres`] is the
//! production backend; [`memory`] keeps the same claim and transaction
//! semantics in process and backs the test suite.

pub mod memory;
pub mod postgres;

pub use memory::{MemoryInboxStore, MemoryInboxTransaction, MemoryOutboxStore, MemoryOutboxTransaction};
pub use postgres::{PgInboxStore, PgInboxTransaction, PgOutboxChunk, PgOutboxStore};

use crate::entities::{DeadLetterReason, DeadLetterRecord, FailureKind, InboxRecord, OutboxRecord};
use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Outcome of a failed attempt, as recorded on the outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub error: String,
    pub kind: FailureKind,
}

impl AttemptFailure {
    pub fn new(error: impl std::fmt::Display, kind: FailureKind) -> Self {
        Self {
            error: error.to_string(),
            kind,
        }
    }
}

/// A module's outbox table.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    type Chunk: OutboxChunk;

    /// Open a transaction and claim up to `limit` pending records, oldest
    /// first. Records claimed by another open chunk and ids in `exclude` are
    /// skipped.
    async fn claim_chunk(&self, limit: usize, exclude: &[Uuid]) -> Result<Self::Chunk, StoreError>;

    async fn count_pending(&self) -> Result<i64, StoreError>;

    async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetterRecord>, StoreError>;

    /// Move a dead letter back to the outbox with `retry_count = 0`.
    async fn requeue_dead_letter(&self, id: Uuid, max_retries: i32) -> Result<bool, StoreError>;
}

/// A claimed set of outbox records and the transaction holding their locks.
///
/// Dropping a chunk without calling [`commit`](OutboxChunk::commit) rolls
/// back every change made through it and releases the claims.
#[async_trait]
pub trait OutboxChunk: Send {
    fn records(&self) -> &[OutboxRecord];

    /// Delete the record (published, or dropped by policy).
    async fn remove(&mut self, id: Uuid) -> Result<(), StoreError>;

    /// Keep the record, increment `retry_count` and store the failure.
    async fn retain_for_retry(&mut self, id: Uuid, failure: &AttemptFailure) -> Result<(), StoreError>;

    /// Delete the record from the outbox and write it to the dead-letter table.
    async fn dead_letter(
        &mut self,
        record: &OutboxRecord,
        reason: DeadLetterReason,
        failure: &AttemptFailure,
    ) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
}

/// A module's inbox table.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Unit of work shared by the inbox insert and the handler's own writes.
    type Tx: InboxTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn purge_received_before(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError>;
}

/// Dropping the transaction without committing rolls it back.
#[async_trait]
pub trait InboxTransaction: Send {
    /// Record the message id. Returns `false` if it was already recorded.
    async fn try_insert(&mut self, record: &InboxRecord) -> Result<bool, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
}
