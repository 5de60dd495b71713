//! OutboxPublisher processor.
//!
//! The OutboxPublisher is responsible for:
//! - Claiming pending outbox records chunk by chunk
//! - Resolving each record through the [`EventCatalog`] and publishing it
//! - Deleting published records
//! - Routing failures: application failures to the dead-letter table,
//!   infrastructure failures back to the outbox until their retries run out
//! - Committing after every chunk
//!
//! A run never attempts the same record twice and stops after
//! `max_records_per_run` attempts, so it returns even while producers keep
//! enqueueing. The next attempt of a retained record happens on the next run,
//! which is where the poll interval provides the backoff.

use crate::broker::MessageBroker;
use crate::config::{ConfigStore, ExhaustedPolicy, PublisherSettings, RelaySettings};
use crate::entities::{DeadLetterReason, FailureKind, OutboxRecord};
use crate::registry::EventCatalog;
use crate::store::{AttemptFailure, OutboxChunk, OutboxStore, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PublishError {
    /// Outbox store failure. The current chunk was rolled back; earlier
    /// chunks of the run stay committed.
    #[error("outbox store error: {0}")]
    Store(#[from] StoreError),
}

/// What one run did with the records it claimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub dropped: usize,
}

impl PublishReport {
    /// Records attempted during the run.
    pub fn total(&self) -> usize {
        self.published + self.retried + self.dead_lettered + self.dropped
    }
}

pub struct OutboxPublisher<S, B> {
    module: String,
    store: S,
    broker: B,
    catalog: Arc<EventCatalog>,
    settings: ConfigStore<RelaySettings>,
}

impl<S, B> OutboxPublisher<S, B>
where
    S: OutboxStore,
    B: MessageBroker,
{
    pub fn new(
        module: impl Into<String>,
        store: S,
        broker: B,
        catalog: Arc<EventCatalog>,
        settings: ConfigStore<RelaySettings>,
    ) -> Self {
        Self {
            module: module.into(),
            store,
            broker,
            catalog,
            settings,
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Publish everything currently pending. Returns the number of records
    /// attempted.
    pub async fn publish_pending(&self) -> Result<usize, PublishError> {
        Ok(self.run_once().await?.total())
    }

    pub async fn run_once(&self) -> Result<PublishReport, PublishError> {
        let settings = self.settings.read().await.publisher.clone();
        // Only records kept for retry stay in the table; the rest are gone.
        let mut retained: Vec<Uuid> = Vec::new();
        let mut report = PublishReport::default();

        loop {
            let remaining = settings.max_records_per_run.saturating_sub(report.total());
            if remaining == 0 {
                debug!(module = %self.module, "Run limit reached, leaving the rest for the next cycle");
                break;
            }
            let limit = settings.chunk_size.min(remaining);
            let mut chunk = self.store.claim_chunk(limit, &retained).await?;
            if chunk.records().is_empty() {
                break;
            }
            let records = chunk.records().to_vec();
            debug!(module = %self.module, count = records.len(), "Claimed outbox chunk");

            for record in &records {
                match self.publish_record(record).await {
                    Ok(()) => {
                        chunk.remove(record.id).await?;
                        report.published += 1;
                        debug!(
                            module = %self.module,
                            message_id = %record.id,
                            event_type = %record.event_type,
                            "Published outbox record"
                        );
                    }
                    Err(failure) => {
                        let retried = report.retried;
                        self.route_failure(&mut chunk, record, failure, &settings, &mut report)
                            .await?;
                        if report.retried > retried {
                            retained.push(record.id);
                        }
                    }
                }
            }

            chunk.commit().await?;
        }

        if report.total() > 0 {
            info!(
                module = %self.module,
                published = report.published,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                dropped = report.dropped,
                "Outbox publish run finished"
            );
        }
        Ok(report)
    }

    async fn publish_record(&self, record: &OutboxRecord) -> Result<(), AttemptFailure> {
        let message = self
            .catalog
            .resolve(record)
            .map_err(|e| AttemptFailure::new(&e, e.kind()))?;
        self.broker
            .publish(&message)
            .await
            .map_err(|e| AttemptFailure::new(&e, e.kind()))
    }

    async fn route_failure(
        &self,
        chunk: &mut S::Chunk,
        record: &OutboxRecord,
        failure: AttemptFailure,
        settings: &PublisherSettings,
        report: &mut PublishReport,
    ) -> Result<(), StoreError> {
        if failure.kind == FailureKind::Application {
            warn!(
                module = %self.module,
                message_id = %record.id,
                event_type = %record.event_type,
                error = %failure.error,
                "Unprocessable outbox record, moving to dead letters"
            );
            chunk
                .dead_letter(record, DeadLetterReason::Unprocessable, &failure)
                .await?;
            report.dead_lettered += 1;
            return Ok(());
        }

        if !record.retries_exhausted() {
            warn!(
                module = %self.module,
                message_id = %record.id,
                retry_count = record.retry_count + 1,
                max_retries = record.max_retries,
                error = %failure.error,
                "Publish failed, will retry"
            );
            chunk.retain_for_retry(record.id, &failure).await?;
            report.retried += 1;
            return Ok(());
        }

        match settings.exhausted_policy {
            ExhaustedPolicy::DeadLetter => {
                error!(
                    module = %self.module,
                    message_id = %record.id,
                    retry_count = record.retry_count,
                    error = %failure.error,
                    "Publish retries exhausted, moving to dead letters"
                );
                chunk
                    .dead_letter(record, DeadLetterReason::Exhausted, &failure)
                    .await?;
                report.dead_lettered += 1;
            }
            ExhaustedPolicy::Drop => {
                error!(
                    module = %self.module,
                    message_id = %record.id,
                    event_type = %record.event_type,
                    retry_count = record.retry_count,
                    error = %failure.error,
                    "Publish retries exhausted, dropping event"
                );
                chunk.remove(record.id).await?;
                report.dropped += 1;
            }
        }
        Ok(())
    }
}
