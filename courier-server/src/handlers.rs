//! Event handlers hosted by the relay, one registration list per module.
//!
//! Each module only subscribes to the events it reacts to. A module with an
//! empty registry still gets its outbox published but runs no consumer.

use async_trait::async_trait;
use courier_core::config::ModuleConfig;
use courier_core::entities::OutboxWriter;
use courier_core::registry::{DuplicateHandler, EventHandler, HandlerError, HandlerRegistry};
use courier_core::store::PgInboxTransaction;
use courier_sdk::EventEnvelope;
use courier_sdk::events::{AppraisalCreated, AssignmentCompleted, RequestSubmitted};
use uuid::Uuid;

pub type ModuleRegistry = HandlerRegistry<PgInboxTransaction>;

/// Build the handler list for `module`.
pub fn registry_for(
    module: &ModuleConfig,
    max_retries: i32,
) -> Result<ModuleRegistry, DuplicateHandler> {
    let mut registry = ModuleRegistry::new();
    match module.name.as_str() {
        "appraisal" => {
            registry.register(OpenAppraisal {
                writer: OutboxWriter::new(module.schema.clone(), max_retries),
            })?;
        }
        "request" => {
            registry
                .register(TrackAppraisalCreated)?
                .register(TrackAssignmentCompleted)?;
        }
        _ => {}
    }
    Ok(registry)
}

fn appraisal_number(request_number: &str) -> String {
    format!("APR-{request_number}")
}

/// Opens an appraisal for every submitted request and announces it.
///
/// `AppraisalCreated` goes through the appraisal module's own outbox inside
/// the inbox transaction, so it is published only if this delivery commits.
pub struct OpenAppraisal {
    writer: OutboxWriter,
}

#[async_trait]
impl EventHandler<PgInboxTransaction> for OpenAppraisal {
    type Event = RequestSubmitted;

    async fn handle(
        &self,
        envelope: EventEnvelope<RequestSubmitted>,
        tx: &mut PgInboxTransaction,
    ) -> Result<(), HandlerError> {
        let request = envelope.event;
        if request.request_number.trim().is_empty() {
            return Err(HandlerError::permanent(format!(
                "request {} has no request number",
                request.request_id
            )));
        }

        let created = AppraisalCreated {
            appraisal_id: Uuid::now_v7(),
            request_id: request.request_id,
            appraisal_number: appraisal_number(&request.request_number),
        };
        let record = self.writer.enqueue(tx.connection(), &created).await?;
        tracing::info!(
            request_id = %request.request_id,
            appraisal_id = %created.appraisal_id,
            outbox_id = %record.id,
            "Opened appraisal for submitted request"
        );
        Ok(())
    }
}

pub struct TrackAppraisalCreated;

#[async_trait]
impl EventHandler<PgInboxTransaction> for TrackAppraisalCreated {
    type Event = AppraisalCreated;

    async fn handle(
        &self,
        envelope: EventEnvelope<AppraisalCreated>,
        _tx: &mut PgInboxTransaction,
    ) -> Result<(), HandlerError> {
        tracing::info!(
            request_id = %envelope.event.request_id,
            appraisal_number = %envelope.event.appraisal_number,
            "Request moved to appraisal"
        );
        Ok(())
    }
}

pub struct TrackAssignmentCompleted;

#[async_trait]
impl EventHandler<PgInboxTransaction> for TrackAssignmentCompleted {
    type Event = AssignmentCompleted;

    async fn handle(
        &self,
        envelope: EventEnvelope<AssignmentCompleted>,
        _tx: &mut PgInboxTransaction,
    ) -> Result<(), HandlerError> {
        tracing::info!(
            appraisal_id = %envelope.event.appraisal_id,
            completed_by = %envelope.event.completed_by,
            "Assignment completed"
        );
        Ok(())
    }
}
