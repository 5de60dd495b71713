//! Operator subcommands: inspect the outbox and recover dead letters.

use clap::Subcommand;
use courier_core::entities::DeadLetterRecord;
use courier_core::store::{OutboxStore, StoreError};
use uuid::Uuid;

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the number of pending outbox records per module
    Pending,

    /// List the newest dead letters of a module
    DeadLetters {
        #[arg(short, long)]
        module: String,

        #[arg(short, long, default_value_t = 20)]
        limit: i64,
    },

    /// Move a dead letter back to the module's outbox
    Requeue {
        #[arg(short, long)]
        module: String,

        /// Outbox record id of the dead letter
        id: Uuid,
    },
}

pub async fn pending_line<S: OutboxStore>(module: &str, store: &S) -> Result<String, StoreError> {
    let pending = store.count_pending().await?;
    Ok(format!("{module}\t{pending}"))
}

fn dead_letter_line(record: &DeadLetterRecord) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}",
        record.id,
        record.event_type,
        record.reason,
        record.retry_count,
        record.dead_lettered_at,
        record.last_error.as_deref().unwrap_or("-")
    )
}

pub async fn dead_letter_lines<S: OutboxStore>(
    store: &S,
    limit: i64,
) -> Result<Vec<String>, StoreError> {
    let records = store.dead_letters(limit).await?;
    Ok(records.iter().map(dead_letter_line).collect())
}

/// Returns `false` when no dead letter with `id` exists.
pub async fn requeue<S: OutboxStore>(
    store: &S,
    id: Uuid,
    max_retries: i32,
) -> Result<bool, StoreError> {
    let requeued = store.requeue_dead_letter(id, max_retries).await?;
    if requeued {
        tracing::info!(message_id = %id, "Dead letter requeued");
    } else {
        tracing::warn!(message_id = %id, "No dead letter with this id");
    }
    Ok(requeued)
}
