//! PollScheduler processor.
//!
//! Drives one module's [`OutboxPublisher`] in a loop: publish, sleep, repeat.
//! The sleep follows [`AdaptiveInterval`]; intervals are re-read from the
//! [`ConfigStore`] every cycle so a reload applies to the next sleep.
//! Shutdown is only observed between cycles, never in the middle of a chunk.

use super::outbox_publisher::OutboxPublisher;
use crate::broker::MessageBroker;
use crate::config::{ConfigStore, RelaySettings};
use crate::store::OutboxStore;
use crate::utils::poll_interval::AdaptiveInterval;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub struct PollScheduler<S, B> {
    publisher: Arc<OutboxPublisher<S, B>>,
    settings: ConfigStore<RelaySettings>,
}

impl<S, B> PollScheduler<S, B>
where
    S: OutboxStore,
    B: MessageBroker,
{
    pub fn new(publisher: Arc<OutboxPublisher<S, B>>, settings: ConfigStore<RelaySettings>) -> Self {
        Self {
            publisher,
            settings,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let module = self.publisher.module().to_string();
        info!(module = %module, "PollScheduler started");

        let mut interval = AdaptiveInterval::new();
        while !*shutdown_rx.borrow() {
            let processed = match self.publisher.publish_pending().await {
                Ok(processed) => processed,
                Err(e) => {
                    error!(module = %module, error = %e, "Outbox publish cycle failed");
                    0
                }
            };

            let poll = self.settings.read().await.poll.clone();
            let previous = interval.state();
            let sleep = interval.observe(processed, &poll);
            if interval.state() != previous {
                debug!(module = %module, state = ?interval.state(), "Poll state changed");
            }

            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(module = %module, "PollScheduler received shutdown signal");
                        break;
                    }
                }

                _ = tokio::time::sleep(sleep) => {}
            }
        }

        info!(module = %module, "PollScheduler shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::registry::EventCatalog;
    use crate::store::MemoryOutboxStore;
    use courier_sdk::events::RequestSubmitted;
    use std::time::Duration;
    use uuid::Uuid;

    fn submitted() -> RequestSubmitted {
        RequestSubmitted {
            request_id: Uuid::now_v7(),
            request_number: "REQ-0001".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_enqueued_records_and_stops_on_shutdown() {
        let store = MemoryOutboxStore::new();
        let broker = MemoryBroker::new();
        let settings = ConfigStore::new(RelaySettings::default());
        let publisher = Arc::new(OutboxPublisher::new(
            "requests",
            store.clone(),
            broker.clone(),
            Arc::new(EventCatalog::new().with::<RequestSubmitted>()),
            settings.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        store.enqueue_committed(&submitted(), 3).unwrap();
        let handle = tokio::spawn(PollScheduler::new(publisher, settings).run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(broker.published().len(), 1);

        // Picked up on a later cycle, after the fast interval.
        store.enqueue_committed(&submitted(), 3).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(broker.published().len(), 2);
        assert!(store.records().is_empty());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
