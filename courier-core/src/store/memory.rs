//! In-process stores.
//!
//! They keep the observable semantics of the Postgres backend: outbox claims
//! skip records held by another open chunk, chunk and inbox changes become
//! visible only on commit, and dropping an uncommitted unit of work discards
//! it. Inbox transactions are serialized, which gives the same answer a
//! unique key gives for concurrent inserts of one id.

use super::{AttemptFailure, InboxStore, InboxTransaction, OutboxChunk, OutboxStore, StoreError};
use crate::entities::{DeadLetterReason, DeadLetterRecord, InboxRecord, OutboxRecord};
use async_trait::async_trait;
use courier_sdk::IntegrationEvent;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::OffsetDateTime;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

#[derive(Default)]
struct OutboxState {
    /// Pending records in insertion order.
    records: Vec<OutboxRecord>,
    claimed: HashSet<Uuid>,
    dead_letters: Vec<DeadLetterRecord>,
}

#[derive(Clone, Default)]
pub struct MemoryOutboxStore {
    state: Arc<Mutex<OutboxState>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a business transaction that can enqueue records.
    pub fn begin(&self) -> MemoryOutboxTransaction {
        MemoryOutboxTransaction {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
        }
    }

    /// Enqueue and commit in one step.
    pub fn enqueue_committed<E: IntegrationEvent>(
        &self,
        event: &E,
        max_retries: i32,
    ) -> Result<OutboxRecord, StoreError> {
        let mut tx = self.begin();
        let record = tx.enqueue(event, max_retries)?;
        tx.commit();
        Ok(record)
    }

    pub fn records(&self) -> Vec<OutboxRecord> {
        lock(&self.state).records.clone()
    }

    pub fn get(&self, id: Uuid) -> Option<OutboxRecord> {
        lock(&self.state).records.iter().find(|r| r.id == id).cloned()
    }

    pub fn dead_letter_records(&self) -> Vec<DeadLetterRecord> {
        lock(&self.state).dead_letters.clone()
    }
}

/// A business transaction's view of the outbox.
pub struct MemoryOutboxTransaction {
    state: Arc<Mutex<OutboxState>>,
    staged: Vec<OutboxRecord>,
}

impl MemoryOutboxTransaction {
    pub fn enqueue<E: IntegrationEvent>(
        &mut self,
        event: &E,
        max_retries: i32,
    ) -> Result<OutboxRecord, StoreError> {
        let record = OutboxRecord::from_event(event, max_retries)?;
        self.staged.push(record.clone());
        Ok(record)
    }

    pub fn enqueue_record(&mut self, record: OutboxRecord) {
        self.staged.push(record);
    }

    pub fn commit(self) {
        let mut state = lock(&self.state);
        state.records.extend(self.staged);
    }
}

enum ChunkOp {
    Remove(Uuid),
    Retry(Uuid, AttemptFailure),
    DeadLetter(DeadLetterRecord),
}

pub struct MemoryOutboxChunk {
    state: Arc<Mutex<OutboxState>>,
    records: Vec<OutboxRecord>,
    ops: Vec<ChunkOp>,
}

impl Drop for MemoryOutboxChunk {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        for record in &self.records {
            state.claimed.remove(&record.id);
        }
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    type Chunk = MemoryOutboxChunk;

    async fn claim_chunk(&self, limit: usize, exclude: &[Uuid]) -> Result<MemoryOutboxChunk, StoreError> {
        let mut state = lock(&self.state);
        let mut sorted: Vec<&OutboxRecord> = state
            .records
            .iter()
            .filter(|r| !state.claimed.contains(&r.id) && !exclude.contains(&r.id))
            .collect();
        sorted.sort_by_key(|r| (r.occurred_on, r.id));
        let records: Vec<OutboxRecord> = sorted.into_iter().take(limit).cloned().collect();
        for record in &records {
            state.claimed.insert(record.id);
        }
        drop(state);
        Ok(MemoryOutboxChunk {
            state: Arc::clone(&self.state),
            records,
            ops: Vec::new(),
        })
    }

    async fn count_pending(&self) -> Result<i64, StoreError> {
        Ok(lock(&self.state).records.len() as i64)
    }

    async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetterRecord>, StoreError> {
        let state = lock(&self.state);
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(state.dead_letters.iter().rev().take(limit).cloned().collect())
    }

    async fn requeue_dead_letter(&self, id: Uuid, max_retries: i32) -> Result<bool, StoreError> {
        let mut state = lock(&self.state);
        let Some(position) = state.dead_letters.iter().position(|d| d.id == id) else {
            return Ok(false);
        };
        let dead = state.dead_letters.remove(position);
        state.records.push(dead.to_outbox(max_retries));
        Ok(true)
    }
}

#[async_trait]
impl OutboxChunk for MemoryOutboxChunk {
    fn records(&self) -> &[OutboxRecord] {
        &self.records
    }

    async fn remove(&mut self, id: Uuid) -> Result<(), StoreError> {
        self.ops.push(ChunkOp::Remove(id));
        Ok(())
    }

    async fn retain_for_retry(&mut self, id: Uuid, failure: &AttemptFailure) -> Result<(), StoreError> {
        self.ops.push(ChunkOp::Retry(id, failure.clone()));
        Ok(())
    }

    async fn dead_letter(
        &mut self,
        record: &OutboxRecord,
        reason: DeadLetterReason,
        failure: &AttemptFailure,
    ) -> Result<(), StoreError> {
        self.ops.push(ChunkOp::DeadLetter(DeadLetterRecord::from_outbox(
            record,
            reason,
            &failure.error,
            failure.kind,
            OffsetDateTime::now_utc(),
        )));
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        let ops = std::mem::take(&mut self.ops);
        let mut state = lock(&self.state);
        for op in ops {
            match op {
                ChunkOp::Remove(id) => state.records.retain(|r| r.id != id),
                ChunkOp::Retry(id, failure) => {
                    if let Some(record) = state.records.iter_mut().find(|r| r.id == id) {
                        record.retry_count += 1;
                        record.last_error = Some(failure.error);
                        record.is_infrastructure_failure = failure.kind.is_retryable();
                    }
                }
                ChunkOp::DeadLetter(dead) => {
                    state.records.retain(|r| r.id != dead.id);
                    if !state.dead_letters.iter().any(|d| d.id == dead.id) {
                        state.dead_letters.push(dead);
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemoryInboxStore {
    rows: Arc<Mutex<BTreeMap<String, InboxRecord>>>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<InboxRecord> {
        lock(&self.rows).values().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.rows).contains_key(id)
    }

    /// Insert a committed row directly, bypassing the gate.
    pub fn seed(&self, record: InboxRecord) {
        lock(&self.rows).insert(record.id.clone(), record);
    }
}

pub struct MemoryInboxTransaction {
    rows: Arc<Mutex<BTreeMap<String, InboxRecord>>>,
    staged: Vec<InboxRecord>,
    _serialized: OwnedMutexGuard<()>,
}

impl MemoryInboxTransaction {
    /// Records staged by this transaction, not yet committed.
    pub fn staged(&self) -> &[InboxRecord] {
        &self.staged
    }
}

#[async_trait]
impl InboxStore for MemoryInboxStore {
    type Tx = MemoryInboxTransaction;

    async fn begin(&self) -> Result<MemoryInboxTransaction, StoreError> {
        let guard = Arc::clone(&self.write_lock).lock_owned().await;
        Ok(MemoryInboxTransaction {
            rows: Arc::clone(&self.rows),
            staged: Vec::new(),
            _serialized: guard,
        })
    }

    async fn purge_received_before(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError> {
        let mut rows = lock(&self.rows);
        let before = rows.len();
        rows.retain(|_, record| record.received_at >= cutoff);
        Ok((before - rows.len()) as u64)
    }
}

#[async_trait]
impl InboxTransaction for MemoryInboxTransaction {
    async fn try_insert(&mut self, record: &InboxRecord) -> Result<bool, StoreError> {
        let exists = lock(&self.rows).contains_key(&record.id)
            || self.staged.iter().any(|r| r.id == record.id);
        if exists {
            return Ok(false);
        }
        self.staged.push(record.clone());
        Ok(true)
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut rows = lock(&self.rows);
        for record in self.staged {
            rows.insert(record.id.clone(), record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_sdk::events::RequestSubmitted;

    fn submitted(n: u32) -> RequestSubmitted {
        RequestSubmitted {
            request_id: Uuid::now_v7(),
            request_number: format!("REQ-{n:04}"),
        }
    }

    #[test]
    fn test_enqueue_visible_only_after_commit() {
        let store = MemoryOutboxStore::new();
        let mut tx = store.begin();
        let record = tx.enqueue(&submitted(1), 3).unwrap();
        assert!(store.get(record.id).is_none());
        tx.commit();
        assert!(store.get(record.id).is_some());
    }

    #[test]
    fn test_rolled_back_enqueue_leaves_no_record() {
        let store = MemoryOutboxStore::new();
        let mut tx = store.begin();
        tx.enqueue(&submitted(1), 3).unwrap();
        drop(tx);
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_chunks_skip_claimed_records() {
        let store = MemoryOutboxStore::new();
        for n in 0..3 {
            store.enqueue_committed(&submitted(n), 3).unwrap();
        }
        let first = store.claim_chunk(2, &[]).await.unwrap();
        let second = store.claim_chunk(2, &[]).await.unwrap();
        assert_eq!(first.records().len(), 2);
        assert_eq!(second.records().len(), 1);
        let first_ids: Vec<Uuid> = first.records().iter().map(|r| r.id).collect();
        assert!(!first_ids.contains(&second.records()[0].id));
    }

    #[tokio::test]
    async fn test_dropped_chunk_releases_claims_and_discards_changes() {
        let store = MemoryOutboxStore::new();
        let record = store.enqueue_committed(&submitted(1), 3).unwrap();
        {
            let mut chunk = store.claim_chunk(10, &[]).await.unwrap();
            chunk.remove(record.id).await.unwrap();
        }
        assert!(store.get(record.id).is_some());
        let chunk = store.claim_chunk(10, &[]).await.unwrap();
        assert_eq!(chunk.records().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_respects_exclusions() {
        let store = MemoryOutboxStore::new();
        let record = store.enqueue_committed(&submitted(1), 3).unwrap();
        let chunk = store.claim_chunk(10, &[record.id]).await.unwrap();
        assert!(chunk.records().is_empty());
    }

    #[tokio::test]
    async fn test_requeue_dead_letter_resets_retry_budget() {
        let store = MemoryOutboxStore::new();
        let record = store.enqueue_committed(&submitted(1), 3).unwrap();
        let mut chunk = store.claim_chunk(10, &[]).await.unwrap();
        let failure = AttemptFailure::new("unknown event type", crate::entities::FailureKind::Application);
        chunk
            .dead_letter(&record, DeadLetterReason::Unprocessable, &failure)
            .await
            .unwrap();
        chunk.commit().await.unwrap();
        assert!(store.records().is_empty());
        assert_eq!(store.dead_letters(10).await.unwrap().len(), 1);

        assert!(store.requeue_dead_letter(record.id, 3).await.unwrap());
        assert!(!store.requeue_dead_letter(record.id, 3).await.unwrap());
        let requeued = store.get(record.id).unwrap();
        assert_eq!(requeued.retry_count, 0);
        assert!(store.dead_letter_records().is_empty());
    }

    #[tokio::test]
    async fn test_inbox_insert_is_discarded_without_commit() {
        let store = MemoryInboxStore::new();
        let record = InboxRecord {
            id: "m-1".to_string(),
            event_type: "RequestSubmitted".to_string(),
            payload: serde_json::json!({}),
            occurred_on: OffsetDateTime::now_utc(),
            received_at: OffsetDateTime::now_utc(),
        };
        {
            let mut tx = store.begin().await.unwrap();
            assert!(tx.try_insert(&record).await.unwrap());
            assert!(!tx.try_insert(&record).await.unwrap());
        }
        assert!(!store.contains("m-1"));

        let mut tx = store.begin().await.unwrap();
        assert!(tx.try_insert(&record).await.unwrap());
        tx.commit().await.unwrap();
        assert!(store.contains("m-1"));

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.try_insert(&record).await.unwrap());
    }
}
