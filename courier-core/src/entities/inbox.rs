//! Inbox rows: ids of broker messages this module has already accepted.

use crate::entities::ModuleSchema;
use crate::framework::DatabaseProcessor;
use courier_sdk::TransportMessage;
use kanau::processor::Processor;
use sqlx::PgConnection;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct InboxRecord {
    /// Broker message id; the deduplication key.
    pub id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub occurred_on: OffsetDateTime,
    pub received_at: OffsetDateTime,
}

impl InboxRecord {
    /// Build the row recorded for `message`, or `None` when the message has
    /// no id to deduplicate on.
    pub fn received(message: &TransportMessage, received_at: OffsetDateTime) -> Option<Self> {
        let id = message.message_id.clone()?;
        Some(Self {
            id,
            event_type: message.event_type.clone(),
            payload: message.body.clone(),
            occurred_on: message.occurred_on,
            received_at,
        })
    }

    /// Insert the row unless one with the same id exists.
    ///
    /// Returns `false` for a duplicate. A concurrent insert of the same id
    /// blocks on the primary key until the other transaction finishes.
    #[tracing::instrument(skip_all, err, name = "SQL:InsertInboxRecord")]
    pub async fn try_insert_tx(
        &self,
        conn: &mut PgConnection,
        schema: &ModuleSchema,
    ) -> Result<bool, sqlx::Error> {
        let sql = format!(
            "INSERT INTO {} (id, event_type, payload, occurred_on, received_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO NOTHING",
            schema.inbox_table()
        );
        let result = sqlx::query(&sql)
            .bind(&self.id)
            .bind(&self.event_type)
            .bind(&self.payload)
            .bind(self.occurred_on)
            .bind(self.received_at)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, Clone)]
/// Delete inbox rows received strictly before `cutoff`.
pub struct PurgeInboxReceivedBefore {
    pub cutoff: OffsetDateTime,
}

impl Processor<PurgeInboxReceivedBefore> for DatabaseProcessor {
    type Output = u64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:PurgeInboxReceivedBefore")]
    async fn process(&self, cmd: PurgeInboxReceivedBefore) -> Result<u64, sqlx::Error> {
        let sql = format!(
            "DELETE FROM {} WHERE received_at < $1",
            self.schema.inbox_table()
        );
        let result = sqlx::query(&sql)
            .bind(cmd.cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
