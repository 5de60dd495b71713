//! PostgreSQL-backed stores.
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so any number of publishers (adaptive
//! loop, cron job, other instances) can run against the same outbox table and
//! each pending row is held by exactly one of them at a time.

use super::{AttemptFailure, InboxStore, InboxTransaction, OutboxChunk, OutboxStore, StoreError};
use crate::entities::inbox::PurgeInboxReceivedBefore;
use crate::entities::outbox::{CountPendingOutbox, ListDeadLetters, RequeueDeadLetter};
use crate::entities::{DeadLetterReason, DeadLetterRecord, InboxRecord, ModuleSchema, OutboxRecord};
use crate::framework::DatabaseProcessor;
use async_trait::async_trait;
use kanau::processor::Processor;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct PgOutboxStore {
    db: DatabaseProcessor,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool, schema: ModuleSchema) -> Self {
        Self {
            db: DatabaseProcessor::new(pool, schema),
        }
    }

    pub fn schema(&self) -> &ModuleSchema {
        &self.db.schema
    }
}

pub struct PgOutboxChunk {
    tx: Transaction<'static, Postgres>,
    schema: ModuleSchema,
    records: Vec<OutboxRecord>,
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    type Chunk = PgOutboxChunk;

    async fn claim_chunk(&self, limit: usize, exclude: &[Uuid]) -> Result<PgOutboxChunk, StoreError> {
        let mut tx = self.db.pool.begin().await?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = OutboxRecord::claim_tx(&mut tx, &self.db.schema, limit, exclude).await?;
        Ok(PgOutboxChunk {
            tx,
            schema: self.db.schema.clone(),
            records,
        })
    }

    async fn count_pending(&self) -> Result<i64, StoreError> {
        Ok(self.db.process(CountPendingOutbox).await?)
    }

    async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetterRecord>, StoreError> {
        Ok(self.db.process(ListDeadLetters { limit }).await?)
    }

    async fn requeue_dead_letter(&self, id: Uuid, max_retries: i32) -> Result<bool, StoreError> {
        Ok(self.db.process(RequeueDeadLetter { id, max_retries }).await?)
    }
}

#[async_trait]
impl OutboxChunk for PgOutboxChunk {
    fn records(&self) -> &[OutboxRecord] {
        &self.records
    }

    async fn remove(&mut self, id: Uuid) -> Result<(), StoreError> {
        let affected = OutboxRecord::delete_tx(&mut self.tx, &self.schema, id).await?;
        if affected == 0 {
            warn!(module = %self.schema, %id, "Claimed outbox record vanished before delete");
        }
        Ok(())
    }

    async fn retain_for_retry(&mut self, id: Uuid, failure: &AttemptFailure) -> Result<(), StoreError> {
        OutboxRecord::record_failure_tx(&mut self.tx, &self.schema, id, &failure.error, failure.kind)
            .await?;
        Ok(())
    }

    async fn dead_letter(
        &mut self,
        record: &OutboxRecord,
        reason: DeadLetterReason,
        failure: &AttemptFailure,
    ) -> Result<(), StoreError> {
        let dead = DeadLetterRecord::from_outbox(
            record,
            reason,
            &failure.error,
            failure.kind,
            OffsetDateTime::now_utc(),
        );
        dead.insert_tx(&mut self.tx, &self.schema).await?;
        OutboxRecord::delete_tx(&mut self.tx, &self.schema, record.id).await?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgInboxStore {
    db: DatabaseProcessor,
}

impl PgInboxStore {
    pub fn new(pool: PgPool, schema: ModuleSchema) -> Self {
        Self {
            db: DatabaseProcessor::new(pool, schema),
        }
    }
}

/// The inbox transaction handed to Postgres-backed handlers.
///
/// Handlers perform their domain writes through [`connection`](Self::connection)
/// so that they commit or roll back together with the inbox row.
pub struct PgInboxTransaction {
    tx: Transaction<'static, Postgres>,
    schema: ModuleSchema,
}

impl PgInboxTransaction {
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    pub fn schema(&self) -> &ModuleSchema {
        &self.schema
    }
}

#[async_trait]
impl InboxStore for PgInboxStore {
    type Tx = PgInboxTransaction;

    async fn begin(&self) -> Result<PgInboxTransaction, StoreError> {
        Ok(PgInboxTransaction {
            tx: self.db.pool.begin().await?,
            schema: self.db.schema.clone(),
        })
    }

    async fn purge_received_before(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError> {
        Ok(self.db.process(PurgeInboxReceivedBefore { cutoff }).await?)
    }
}

#[async_trait]
impl InboxTransaction for PgInboxTransaction {
    async fn try_insert(&mut self, record: &InboxRecord) -> Result<bool, StoreError> {
        Ok(record.try_insert_tx(&mut self.tx, &self.schema).await?)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
