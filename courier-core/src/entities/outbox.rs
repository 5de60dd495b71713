//! Outbox and dead-letter rows.
//!
//! An outbox row exists iff the business transaction that raised the event
//! committed and the event has not been confirmed delivered yet. Rows are only
//! ever inserted on the caller's open transaction (see [`OutboxWriter`]).

use crate::entities::{FailureKind, ModuleSchema};
use crate::framework::DatabaseProcessor;
use crate::store::StoreError;
use courier_sdk::{EventEnvelope, IntegrationEvent};
use kanau::processor::Processor;
use sqlx::PgConnection;
use time::OffsetDateTime;
use uuid::Uuid;

pub const DEFAULT_MAX_RETRIES: i32 = 3;

const OUTBOX_COLUMNS: &str = "id, event_type, payload, occurred_on, retry_count, max_retries, \
    last_error, is_infrastructure_failure";

const DEAD_LETTER_COLUMNS: &str = "id, event_type, payload, occurred_on, retry_count, last_error, \
    is_infrastructure_failure, reason, dead_lettered_at";

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub event_type: String,
    /// The serialized event fields, without the envelope.
    pub payload: serde_json::Value,
    pub occurred_on: OffsetDateTime,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub is_infrastructure_failure: bool,
}

impl OutboxRecord {
    pub fn from_event<E: IntegrationEvent>(
        event: &E,
        max_retries: i32,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::pending(
            Uuid::now_v7(),
            E::EVENT_TYPE,
            serde_json::to_value(event)?,
            OffsetDateTime::now_utc(),
            max_retries,
        ))
    }

    /// Build a record that keeps the envelope's id and timestamp.
    pub fn from_envelope<E: IntegrationEvent>(
        envelope: &EventEnvelope<E>,
        max_retries: i32,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::pending(
            envelope.event_id,
            &envelope.event_type,
            serde_json::to_value(&envelope.event)?,
            envelope.occurred_on,
            max_retries,
        ))
    }

    pub fn pending(
        id: Uuid,
        event_type: &str,
        payload: serde_json::Value,
        occurred_on: OffsetDateTime,
        max_retries: i32,
    ) -> Self {
        Self {
            id,
            event_type: event_type.to_string(),
            payload,
            occurred_on,
            retry_count: 0,
            max_retries,
            last_error: None,
            is_infrastructure_failure: false,
        }
    }

    /// Whether another failed attempt must remove the record instead of retrying it.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub fn last_failure_kind(&self) -> Option<FailureKind> {
        self.last_error.as_ref().map(|_| {
            if self.is_infrastructure_failure {
                FailureKind::Infrastructure
            } else {
                FailureKind::Application
            }
        })
    }

    #[tracing::instrument(skip_all, err, name = "SQL:InsertOutboxRecord")]
    pub async fn insert_tx(
        &self,
        conn: &mut PgConnection,
        schema: &ModuleSchema,
    ) -> Result<(), sqlx::Error> {
        let sql = format!(
            "INSERT INTO {} ({OUTBOX_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            schema.outbox_table()
        );
        sqlx::query(&sql)
            .bind(self.id)
            .bind(&self.event_type)
            .bind(&self.payload)
            .bind(self.occurred_on)
            .bind(self.retry_count)
            .bind(self.max_retries)
            .bind(&self.last_error)
            .bind(self.is_infrastructure_failure)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Lock up to `limit` pending rows for this transaction, skipping rows
    /// locked by other workers and rows in `exclude`.
    #[tracing::instrument(skip_all, err, name = "SQL:ClaimOutboxRecords")]
    pub async fn claim_tx(
        conn: &mut PgConnection,
        schema: &ModuleSchema,
        limit: i64,
        exclude: &[Uuid],
    ) -> Result<Vec<OutboxRecord>, sqlx::Error> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM {} \
             WHERE NOT (id = ANY($1)) \
             ORDER BY occurred_on, id \
             LIMIT $2 \
             FOR UPDATE SKIP LOCKED",
            schema.outbox_table()
        );
        sqlx::query_as::<_, OutboxRecord>(&sql)
            .bind(exclude)
            .bind(limit)
            .fetch_all(conn)
            .await
    }

    #[tracing::instrument(skip_all, err, name = "SQL:DeleteOutboxRecord")]
    pub async fn delete_tx(
        conn: &mut PgConnection,
        schema: &ModuleSchema,
        id: Uuid,
    ) -> Result<u64, sqlx::Error> {
        let sql = format!("DELETE FROM {} WHERE id = $1", schema.outbox_table());
        let result = sqlx::query(&sql).bind(id).execute(conn).await?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip_all, err, name = "SQL:RecordOutboxFailure")]
    pub async fn record_failure_tx(
        conn: &mut PgConnection,
        schema: &ModuleSchema,
        id: Uuid,
        last_error: &str,
        kind: FailureKind,
    ) -> Result<u64, sqlx::Error> {
        let sql = format!(
            "UPDATE {} \
             SET retry_count = retry_count + 1, last_error = $2, is_infrastructure_failure = $3 \
             WHERE id = $1",
            schema.outbox_table()
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(last_error)
            .bind(kind == FailureKind::Infrastructure)
            .execute(conn)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Why a record left the outbox without being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadLetterReason {
    /// Infrastructure failures exhausted `max_retries`.
    Exhausted,
    /// The record can never be published (unknown type, malformed payload,
    /// broker rejected it).
    Unprocessable,
}

impl DeadLetterReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeadLetterReason::Exhausted => "exhausted",
            DeadLetterReason::Unprocessable => "unprocessable",
        }
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown dead letter reason: {0}")]
pub struct UnknownDeadLetterReason(String);

impl TryFrom<String> for DeadLetterReason {
    type Error = UnknownDeadLetterReason;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "exhausted" => Ok(DeadLetterReason::Exhausted),
            "unprocessable" => Ok(DeadLetterReason::Unprocessable),
            _ => Err(UnknownDeadLetterReason(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub occurred_on: OffsetDateTime,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub is_infrastructure_failure: bool,
    #[sqlx(try_from = "String")]
    pub reason: DeadLetterReason,
    pub dead_lettered_at: OffsetDateTime,
}

impl DeadLetterRecord {
    pub fn from_outbox(
        record: &OutboxRecord,
        reason: DeadLetterReason,
        last_error: &str,
        kind: FailureKind,
        dead_lettered_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: record.id,
            event_type: record.event_type.clone(),
            payload: record.payload.clone(),
            occurred_on: record.occurred_on,
            retry_count: record.retry_count,
            last_error: Some(last_error.to_string()),
            is_infrastructure_failure: kind == FailureKind::Infrastructure,
            reason,
            dead_lettered_at,
        }
    }

    /// A fresh outbox record for the same event, with the retry budget reset.
    pub fn to_outbox(&self, max_retries: i32) -> OutboxRecord {
        OutboxRecord::pending(
            self.id,
            &self.event_type,
            self.payload.clone(),
            self.occurred_on,
            max_retries,
        )
    }

    #[tracing::instrument(skip_all, err, name = "SQL:InsertDeadLetter")]
    pub async fn insert_tx(
        &self,
        conn: &mut PgConnection,
        schema: &ModuleSchema,
    ) -> Result<(), sqlx::Error> {
        let sql = format!(
            "INSERT INTO {} ({DEAD_LETTER_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO NOTHING",
            schema.dead_letter_table()
        );
        sqlx::query(&sql)
            .bind(self.id)
            .bind(&self.event_type)
            .bind(&self.payload)
            .bind(self.occurred_on)
            .bind(self.retry_count)
            .bind(&self.last_error)
            .bind(self.is_infrastructure_failure)
            .bind(self.reason.as_str())
            .bind(self.dead_lettered_at)
            .execute(conn)
            .await?;
        Ok(())
    }
}

/// Collaborator-facing enqueue entry point for one module.
///
/// Always called with the connection of the business transaction that raised
/// the event; there is no "publish now" path.
#[derive(Debug, Clone)]
pub struct OutboxWriter {
    schema: ModuleSchema,
    max_retries: i32,
}

impl OutboxWriter {
    pub fn new(schema: ModuleSchema, max_retries: i32) -> Self {
        Self {
            schema,
            max_retries,
        }
    }

    pub async fn enqueue<E: IntegrationEvent>(
        &self,
        conn: &mut PgConnection,
        event: &E,
    ) -> Result<OutboxRecord, StoreError> {
        let record = OutboxRecord::from_event(event, self.max_retries)?;
        record.insert_tx(conn, &self.schema).await?;
        Ok(record)
    }

    pub async fn enqueue_envelope<E: IntegrationEvent>(
        &self,
        conn: &mut PgConnection,
        envelope: &EventEnvelope<E>,
    ) -> Result<OutboxRecord, StoreError> {
        let record = OutboxRecord::from_envelope(envelope, self.max_retries)?;
        record.insert_tx(conn, &self.schema).await?;
        Ok(record)
    }
}

#[derive(Debug, Clone)]
/// Number of records still waiting for publication.
pub struct CountPendingOutbox;

impl Processor<CountPendingOutbox> for DatabaseProcessor {
    type Output = i64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:CountPendingOutbox")]
    async fn process(&self, _query: CountPendingOutbox) -> Result<i64, sqlx::Error> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.schema.outbox_table());
        sqlx::query_scalar::<_, i64>(&sql).fetch_one(&self.pool).await
    }
}

#[derive(Debug, Clone)]
/// Most recent dead letters first.
pub struct ListDeadLetters {
    pub limit: i64,
}

impl Processor<ListDeadLetters> for DatabaseProcessor {
    type Output = Vec<DeadLetterRecord>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListDeadLetters")]
    async fn process(&self, query: ListDeadLetters) -> Result<Vec<DeadLetterRecord>, sqlx::Error> {
        let sql = format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM {} ORDER BY dead_lettered_at DESC LIMIT $1",
            self.schema.dead_letter_table()
        );
        sqlx::query_as::<_, DeadLetterRecord>(&sql)
            .bind(query.limit)
            .fetch_all(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
/// Move a dead letter back into the outbox with a fresh retry budget.
///
/// Returns `false` when no dead letter with that id exists.
pub struct RequeueDeadLetter {
    pub id: Uuid,
    pub max_retries: i32,
}

impl Processor<RequeueDeadLetter> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:RequeueDeadLetter")]
    async fn process(&self, cmd: RequeueDeadLetter) -> Result<bool, sqlx::Error> {
        let sql = format!(
            "WITH moved AS ( \
                DELETE FROM {dead_letters} WHERE id = $1 \
                RETURNING id, event_type, payload, occurred_on \
             ) \
             INSERT INTO {outbox} (id, event_type, payload, occurred_on, retry_count, max_retries) \
             SELECT id, event_type, payload, occurred_on, 0, $2 FROM moved",
            dead_letters = self.schema.dead_letter_table(),
            outbox = self.schema.outbox_table(),
        );
        let result = sqlx::query(&sql)
            .bind(cmd.id)
            .bind(cmd.max_retries)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_sdk::events::DocumentUploaded;

    fn uploaded() -> DocumentUploaded {
        DocumentUploaded {
            document_id: Uuid::nil(),
            request_id: Uuid::nil(),
            file_name: "deed.pdf".to_string(),
        }
    }

    #[test]
    fn test_from_event_starts_with_fresh_retry_state() {
        let record = OutboxRecord::from_event(&uploaded(), DEFAULT_MAX_RETRIES).unwrap();
        assert_eq!(record.event_type, "DocumentUploaded");
        assert_eq!(record.payload["file_name"], "deed.pdf");
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.max_retries, 3);
        assert_eq!(record.last_error, None);
        assert!(!record.is_infrastructure_failure);
        assert_eq!(record.last_failure_kind(), None);
    }

    #[test]
    fn test_from_envelope_keeps_identity() {
        let envelope = EventEnvelope::new(uploaded());
        let record = OutboxRecord::from_envelope(&envelope, 5).unwrap();
        assert_eq!(record.id, envelope.event_id);
        assert_eq!(record.occurred_on, envelope.occurred_on);
        assert_eq!(record.max_retries, 5);
    }

    #[test]
    fn test_retries_exhausted_boundary() {
        let mut record = OutboxRecord::from_event(&uploaded(), 3).unwrap();
        record.retry_count = 2;
        assert!(!record.retries_exhausted());
        record.retry_count = 3;
        assert!(record.retries_exhausted());
    }

    #[test]
    fn test_dead_letter_round_trips_to_outbox() {
        let mut record = OutboxRecord::from_event(&uploaded(), 3).unwrap();
        record.retry_count = 3;
        let dead = DeadLetterRecord::from_outbox(
            &record,
            DeadLetterReason::Exhausted,
            "connection reset",
            FailureKind::Infrastructure,
            OffsetDateTime::now_utc(),
        );
        assert_eq!(dead.retry_count, 3);
        assert!(dead.is_infrastructure_failure);

        let requeued = dead.to_outbox(3);
        assert_eq!(requeued.id, record.id);
        assert_eq!(requeued.retry_count, 0);
        assert_eq!(requeued.payload, record.payload);
    }

    #[test]
    fn test_dead_letter_reason_parsing() {
        assert_eq!(
            DeadLetterReason::try_from("exhausted".to_string()).unwrap(),
            DeadLetterReason::Exhausted
        );
        assert_eq!(
            DeadLetterReason::try_from(DeadLetterReason::Unprocessable.to_string()).unwrap(),
            DeadLetterReason::Unprocessable
        );
        assert!(DeadLetterReason::try_from("lost".to_string()).is_err());
    }
}
