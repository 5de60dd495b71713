//! DedupGate processor.
//!
//! Every registered handler runs behind the gate. For each message it:
//! - Skips event types the module has no handler for (nothing recorded)
//! - Opens an inbox transaction and inserts the message id; a conflict
//!   means the message was already accepted, so the handler is not run
//! - Runs the handler on the same transaction and commits only if it
//!   succeeds, so the inbox row and the handler's writes land together
//!
//! Messages without an id cannot be deduplicated; they are passed straight
//! to the handler and logged at `warn`.

use crate::entities::InboxRecord;
use crate::registry::{DispatchError, HandlerRegistry};
use crate::store::{InboxStore, InboxTransaction};
use courier_sdk::TransportMessage;
use std::fmt;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, warn};

/// What the gate did with a message. The consumer maps it to a broker action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Handler ran and its transaction committed.
    Processed,
    /// Message id already recorded; handler skipped.
    Duplicate,
    /// This module has no handler for the event type.
    Unhandled,
    /// Nothing was committed; a redelivery may succeed.
    Retryable(String),
    /// Nothing was committed; a redelivery would fail the same way.
    Permanent(String),
}

impl GateOutcome {
    /// Whether the broker should consider the message done.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            GateOutcome::Processed | GateOutcome::Duplicate | GateOutcome::Unhandled
        )
    }
}

impl fmt::Display for GateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateOutcome::Processed => f.write_str("processed"),
            GateOutcome::Duplicate => f.write_str("duplicate"),
            GateOutcome::Unhandled => f.write_str("unhandled"),
            GateOutcome::Retryable(reason) => write!(f, "retryable: {reason}"),
            GateOutcome::Permanent(reason) => write!(f, "permanent: {reason}"),
        }
    }
}

pub struct DedupGate<S: InboxStore> {
    module: String,
    store: S,
    handlers: Arc<HandlerRegistry<S::Tx>>,
}

impl<S> DedupGate<S>
where
    S: InboxStore,
    S::Tx: 'static,
{
    pub fn new(module: impl Into<String>, store: S, handlers: Arc<HandlerRegistry<S::Tx>>) -> Self {
        Self {
            module: module.into(),
            store,
            handlers,
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn handlers(&self) -> &HandlerRegistry<S::Tx> {
        &self.handlers
    }

    pub async fn consume(&self, message: &TransportMessage) -> GateOutcome {
        if !self.handlers.handles(&message.event_type) {
            debug!(module = %self.module, event_type = %message.event_type, "No handler registered, skipping");
            return GateOutcome::Unhandled;
        }

        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(e) => return GateOutcome::Retryable(e.to_string()),
        };

        match InboxRecord::received(message, OffsetDateTime::now_utc()) {
            Some(record) => match tx.try_insert(&record).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(module = %self.module, message_id = %record.id, "Duplicate message, skipping handler");
                    return GateOutcome::Duplicate;
                }
                Err(e) => return GateOutcome::Retryable(e.to_string()),
            },
            None => {
                warn!(
                    module = %self.module,
                    event_type = %message.event_type,
                    "Message has no id, handling without deduplication"
                );
            }
        }

        match self.handlers.dispatch(message, &mut tx).await {
            Ok(()) => {}
            Err(DispatchError::Unhandled(_)) => return GateOutcome::Unhandled,
            Err(DispatchError::Decode(e)) => return GateOutcome::Permanent(e.to_string()),
            Err(DispatchError::Handler(e)) => {
                return if e.kind().is_retryable() {
                    GateOutcome::Retryable(e.to_string())
                } else {
                    GateOutcome::Permanent(e.to_string())
                };
            }
        }

        match tx.commit().await {
            Ok(()) => GateOutcome::Processed,
            Err(e) => GateOutcome::Retryable(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{EventHandler, HandlerError};
    use crate::store::{MemoryInboxStore, MemoryInboxTransaction};
    use async_trait::async_trait;
    use courier_sdk::EventEnvelope;
    use courier_sdk::events::{AssignmentCompleted, DocumentUploaded};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    /// Counts invocations; fails according to `completed_by`.
    #[derive(Clone, Default)]
    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler<MemoryInboxTransaction> for CountingHandler {
        type Event = AssignmentCompleted;

        async fn handle(
            &self,
            envelope: EventEnvelope<AssignmentCompleted>,
            _tx: &mut MemoryInboxTransaction,
        ) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            match envelope.event.completed_by.as_str() {
                "flaky" => Err(HandlerError::retryable("lock timeout")),
                "broken" => Err(HandlerError::permanent("assignment unknown")),
                _ => Ok(()),
            }
        }
    }

    fn gate(store: &MemoryInboxStore, handler: CountingHandler) -> DedupGate<MemoryInboxStore> {
        let mut registry = HandlerRegistry::new();
        registry.register(handler).unwrap();
        DedupGate::new("appraisals", store.clone(), Arc::new(registry))
    }

    fn completed(by: &str) -> TransportMessage {
        let envelope = EventEnvelope::new(AssignmentCompleted {
            assignment_id: Uuid::now_v7(),
            appraisal_id: Uuid::now_v7(),
            completed_by: by.to_string(),
        });
        TransportMessage::from_envelope(&envelope).unwrap()
    }

    #[tokio::test]
    async fn test_second_delivery_is_duplicate() {
        let store = MemoryInboxStore::new();
        let handler = CountingHandler::default();
        let gate = gate(&store, handler.clone());
        let message = completed("alice");

        assert_eq!(gate.consume(&message).await, GateOutcome::Processed);
        assert_eq!(gate.consume(&message).await, GateOutcome::Duplicate);

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(store.contains(message.message_id.as_deref().unwrap()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_deliveries_run_handler_once() {
        let store = MemoryInboxStore::new();
        let handler = CountingHandler::default();
        let gate = Arc::new(gate(&store, handler.clone()));
        let mut message = completed("bob");
        message.message_id = Some("G".to_string());

        let first = tokio::spawn({
            let gate = Arc::clone(&gate);
            let message = message.clone();
            async move { gate.consume(&message).await }
        });
        let second = tokio::spawn({
            let gate = Arc::clone(&gate);
            let message = message.clone();
            async move { gate.consume(&message).await }
        });
        let mut outcomes = vec![first.await.unwrap(), second.await.unwrap()];
        outcomes.sort_by_key(|o| o.to_string());

        assert_eq!(outcomes, vec![GateOutcome::Duplicate, GateOutcome::Processed]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_handler_rolls_back_inbox_row() {
        let store = MemoryInboxStore::new();
        let handler = CountingHandler::default();
        let gate = gate(&store, handler.clone());
        let message = completed("flaky");

        assert!(matches!(gate.consume(&message).await, GateOutcome::Retryable(_)));
        assert!(store.records().is_empty());

        // The redelivery runs the handler again.
        assert!(matches!(gate.consume(&message).await, GateOutcome::Retryable(_)));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_handler_error() {
        let store = MemoryInboxStore::new();
        let gate = gate(&store, CountingHandler::default());

        let outcome = gate.consume(&completed("broken")).await;
        assert_eq!(outcome, GateOutcome::Permanent("assignment unknown".to_string()));
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_unhandled_event_type_is_not_recorded() {
        let store = MemoryInboxStore::new();
        let handler = CountingHandler::default();
        let gate = gate(&store, handler.clone());
        let envelope = EventEnvelope::new(DocumentUploaded {
            document_id: Uuid::now_v7(),
            request_id: Uuid::now_v7(),
            file_name: "survey.pdf".to_string(),
        });
        let message = TransportMessage::from_envelope(&envelope).unwrap();

        assert_eq!(gate.consume(&message).await, GateOutcome::Unhandled);
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_message_without_id_skips_dedup() {
        let store = MemoryInboxStore::new();
        let handler = CountingHandler::default();
        let gate = gate(&store, handler.clone());
        let mut message = completed("carol");
        message.message_id = None;

        assert_eq!(gate.consume(&message).await, GateOutcome::Processed);
        assert_eq!(gate.consume(&message).await, GateOutcome::Processed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_body_is_permanent() {
        let store = MemoryInboxStore::new();
        let handler = CountingHandler::default();
        let gate = gate(&store, handler.clone());
        let mut message = completed("dave");
        message.body = serde_json::json!({"unexpected": true});

        assert!(matches!(gate.consume(&message).await, GateOutcome::Permanent(_)));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert!(store.records().is_empty());
    }
}
