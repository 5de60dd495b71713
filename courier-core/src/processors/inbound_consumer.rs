//! InboundConsumer processor.
//!
//! Reads a module's deliveries from its [`MessageSource`], passes each one
//! through the module's [`DedupGate`] and settles it with the broker:
//!
//! | outcome | broker action |
//! |---|---|
//! | `Processed`, `Duplicate`, `Unhandled` | ack |
//! | `Retryable` | leave pending, reclaimed after the idle timeout |
//! | `Retryable` on delivery `max_deliveries` | copy to the dead-letter stream, then ack |
//! | `Permanent` | copy to the dead-letter stream, then ack |
//!
//! Deliveries are handled one at a time. A failed read backs off for a
//! second and reconnects.

use super::dedup_gate::{DedupGate, GateOutcome};
use crate::broker::{BrokerError, Delivery, MessageSource};
use crate::store::InboxStore;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

pub struct InboundConsumer<Src, S: InboxStore> {
    source: Src,
    gate: DedupGate<S>,
    max_deliveries: u64,
}

impl<Src, S> InboundConsumer<Src, S>
where
    Src: MessageSource,
    S: InboxStore,
    S::Tx: 'static,
{
    pub fn new(source: Src, gate: DedupGate<S>, max_deliveries: u64) -> Self {
        Self {
            source,
            gate,
            max_deliveries,
        }
    }

    /// Run one delivery through the gate and settle it with the broker.
    pub async fn handle_delivery(&mut self, delivery: &Delivery) -> Result<GateOutcome, ConsumerError> {
        let outcome = self.gate.consume(&delivery.message).await;
        let module = self.gate.module();
        match &outcome {
            GateOutcome::Processed | GateOutcome::Duplicate | GateOutcome::Unhandled => {
                self.source.ack(delivery).await?;
                debug!(
                    module = %module,
                    delivery_id = %delivery.delivery_id,
                    outcome = %outcome,
                    redelivery = delivery.is_redelivery(),
                    "Delivery settled"
                );
            }
            GateOutcome::Retryable(reason) if delivery.delivery_count >= self.max_deliveries => {
                error!(
                    module = %module,
                    delivery_id = %delivery.delivery_id,
                    event_type = %delivery.message.event_type,
                    delivery_count = delivery.delivery_count,
                    error = %reason,
                    "Delivery attempts exhausted, dead-lettering"
                );
                let reason = format!("gave up after {} deliveries: {reason}", delivery.delivery_count);
                self.source.dead_letter(delivery, &reason).await?;
            }
            GateOutcome::Retryable(reason) => {
                warn!(
                    module = %module,
                    delivery_id = %delivery.delivery_id,
                    event_type = %delivery.message.event_type,
                    delivery_count = delivery.delivery_count,
                    error = %reason,
                    "Delivery failed, leaving it pending for redelivery"
                );
            }
            GateOutcome::Permanent(reason) => {
                error!(
                    module = %module,
                    delivery_id = %delivery.delivery_id,
                    event_type = %delivery.message.event_type,
                    error = %reason,
                    "Delivery cannot be processed, dead-lettering"
                );
                self.source.dead_letter(delivery, reason).await?;
            }
        }
        Ok(outcome)
    }

    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let module = self.gate.module().to_string();
        info!(
            module = %module,
            event_types = ?self.gate.handlers().event_types(),
            "InboundConsumer started"
        );

        loop {
            if *shutdown_rx.borrow() {
                info!(module = %module, "InboundConsumer received shutdown signal");
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(module = %module, "InboundConsumer received shutdown signal");
                        break;
                    }
                }

                batch = self.source.next_batch() => match batch {
                    Ok(deliveries) => {
                        for delivery in &deliveries {
                            if let Err(e) = self.handle_delivery(delivery).await {
                                error!(
                                    module = %module,
                                    delivery_id = %delivery.delivery_id,
                                    error = %e,
                                    "Failed to settle delivery"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        error!(module = %module, error = %e, "Failed to read from broker");
                        tokio::select! {
                            biased;
                            changed = shutdown_rx.changed() => {
                                if changed.is_err() || *shutdown_rx.borrow() {
                                    info!(module = %module, "InboundConsumer received shutdown signal");
                                    break;
                                }
                            }
                            _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                        }
                        if let Err(e) = self.source.reconnect().await {
                            warn!(module = %module, error = %e, "Broker reconnect failed");
                        }
                    }
                },
            }
        }

        info!(module = %module, "InboundConsumer shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, MessageBroker, memory_source};
    use crate::registry::{EventHandler, HandlerError, HandlerRegistry};
    use crate::store::{MemoryInboxStore, MemoryInboxTransaction};
    use async_trait::async_trait;
    use courier_sdk::events::{AppraisalCreated, RequestSubmitted};
    use courier_sdk::{EventEnvelope, TransportMessage};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Clone, Default)]
    struct OpenAppraisal {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler<MemoryInboxTransaction> for OpenAppraisal {
        type Event = RequestSubmitted;

        async fn handle(
            &self,
            envelope: EventEnvelope<RequestSubmitted>,
            _tx: &mut MemoryInboxTransaction,
        ) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match envelope.event.request_number.as_str() {
                "RETRY" => Err(HandlerError::retryable("appraisal table locked")),
                "REJECT" => Err(HandlerError::permanent("request already closed")),
                _ => Ok(()),
            }
        }
    }

    fn submitted(request_number: &str) -> TransportMessage {
        let envelope = EventEnvelope::new(RequestSubmitted {
            request_id: Uuid::now_v7(),
            request_number: request_number.to_string(),
        });
        TransportMessage::from_envelope(&envelope).unwrap()
    }

    fn gate(store: &MemoryInboxStore, handler: OpenAppraisal) -> DedupGate<MemoryInboxStore> {
        let mut registry = HandlerRegistry::new();
        registry.register(handler).unwrap();
        DedupGate::new("appraisals", store.clone(), Arc::new(registry))
    }

    fn delivery(id: &str, message: TransportMessage) -> Delivery {
        Delivery {
            delivery_id: id.to_string(),
            message,
            delivery_count: 1,
        }
    }

    #[tokio::test]
    async fn test_outcomes_map_to_broker_actions() {
        let store = MemoryInboxStore::new();
        let (handle, source) = memory_source();
        let mut consumer = InboundConsumer::new(source, gate(&store, OpenAppraisal::default()), 5);

        let ok = delivery("1-0", submitted("REQ-1"));
        let retry = delivery("2-0", submitted("RETRY"));
        let reject = delivery("3-0", submitted("REJECT"));
        let envelope = EventEnvelope::new(AppraisalCreated {
            appraisal_id: Uuid::now_v7(),
            request_id: Uuid::now_v7(),
            appraisal_number: "APR-1".to_string(),
        });
        let other = delivery("4-0", TransportMessage::from_envelope(&envelope).unwrap());

        assert_eq!(consumer.handle_delivery(&ok).await.unwrap(), GateOutcome::Processed);
        assert!(matches!(
            consumer.handle_delivery(&retry).await.unwrap(),
            GateOutcome::Retryable(_)
        ));
        assert!(matches!(
            consumer.handle_delivery(&reject).await.unwrap(),
            GateOutcome::Permanent(_)
        ));
        assert_eq!(consumer.handle_delivery(&other).await.unwrap(), GateOutcome::Unhandled);

        assert_eq!(handle.acked(), vec!["1-0", "3-0", "4-0"]);
        let dead = handle.dead_lettered();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0, "3-0");
        assert!(dead[0].1.contains("request already closed"));
    }

    #[tokio::test]
    async fn test_redelivered_duplicate_is_acked_without_rerun() {
        let store = MemoryInboxStore::new();
        let handler = OpenAppraisal::default();
        let (handle, source) = memory_source();
        let mut consumer = InboundConsumer::new(source, gate(&store, handler.clone()), 5);
        let first = delivery("1-0", submitted("REQ-7"));
        let mut again = first.clone();
        again.delivery_id = "9-0".to_string();
        again.delivery_count = 2;

        consumer.handle_delivery(&first).await.unwrap();
        assert_eq!(consumer.handle_delivery(&again).await.unwrap(), GateOutcome::Duplicate);

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.acked(), vec!["1-0", "9-0"]);
    }

    #[tokio::test]
    async fn test_run_consumes_published_messages_until_shutdown() {
        let store = MemoryInboxStore::new();
        let handler = OpenAppraisal::default();
        let broker = MemoryBroker::new();
        let (handle, source) = broker.subscribe();
        let consumer = InboundConsumer::new(source, gate(&store, handler.clone()), 5);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(consumer.run(shutdown_rx));

        let message = submitted("REQ-9");
        broker.publish(&message).await.unwrap();
        broker.publish(&message).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while handle.acked().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.records().len(), 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_retryable_delivery_dead_lettered_after_max_deliveries() {
        let store = MemoryInboxStore::new();
        let handler = OpenAppraisal::default();
        let (handle, source) = memory_source();
        let mut consumer = InboundConsumer::new(source, gate(&store, handler.clone()), 3);

        let mut pending = delivery("1-0", submitted("RETRY"));
        for attempt in 1..=3 {
            pending.delivery_count = attempt;
            assert!(matches!(
                consumer.handle_delivery(&pending).await.unwrap(),
                GateOutcome::Retryable(_)
            ));
            if attempt < 3 {
                assert!(handle.acked().is_empty());
            }
        }

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(handle.acked(), vec!["1-0"]);
        let dead = handle.dead_lettered();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].1.contains("gave up after 3 deliveries"));
        assert!(dead[0].1.contains("appraisal table locked"));
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_memory_redelivery_counts_attempts() {
        let (handle, mut source) = memory_source();
        handle.deliver(submitted("REQ-2"));
        let first = source.next_batch().await.unwrap().remove(0);
        assert_eq!(first.delivery_count, 1);
        assert!(!first.is_redelivery());

        handle.redeliver(first);
        let second = source.next_batch().await.unwrap().remove(0);
        assert_eq!(second.delivery_count, 2);
        assert!(second.is_redelivery());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_read_backoff_stops_consumer() {
        let store = MemoryInboxStore::new();
        let (handle, source) = memory_source();
        // Closing the channel makes every read fail.
        drop(handle);
        let consumer = InboundConsumer::new(source, gate(&store, OpenAppraisal::default()), 5);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(consumer.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(30), task)
            .await
            .unwrap()
            .unwrap();
    }
}
