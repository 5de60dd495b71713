//! CronPublishJob processor.
//!
//! Runs the same publish pass as the [`PollScheduler`](super::PollScheduler)
//! but on a fixed cron schedule. The expression is re-read after every run
//! and on every settings reload, so a new schedule replaces the pending
//! sleep right away; an invalid replacement is ignored and the previous
//! schedule kept.

use super::outbox_publisher::OutboxPublisher;
use crate::broker::MessageBroker;
use crate::config::{ConfigStore, ConfigWatcher, RelaySettings};
use crate::store::OutboxStore;
use crate::utils::cron_schedule::{CronSchedule, ScheduleError};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub struct CronPublishJob<S, B> {
    publisher: Arc<OutboxPublisher<S, B>>,
    settings: ConfigStore<RelaySettings>,
    reloads: ConfigWatcher,
    schedule: CronSchedule,
}

impl<S, B> CronPublishJob<S, B>
where
    S: OutboxStore,
    B: MessageBroker,
{
    pub async fn new(
        publisher: Arc<OutboxPublisher<S, B>>,
        settings: ConfigStore<RelaySettings>,
    ) -> Result<Self, ScheduleError> {
        let expr = settings.read().await.publisher.cron.clone().unwrap_or_default();
        let schedule = CronSchedule::parse(&expr)?;
        let reloads = settings.subscribe();
        Ok(Self {
            publisher,
            settings,
            reloads,
            schedule,
        })
    }

    pub fn schedule(&self) -> &CronSchedule {
        &self.schedule
    }

    /// Pick up a changed expression from the settings.
    async fn refresh_schedule(&mut self) {
        let Some(expr) = self.settings.read().await.publisher.cron.clone() else {
            return;
        };
        if expr == self.schedule.expression() {
            return;
        }
        match CronSchedule::parse(&expr) {
            Ok(schedule) => {
                info!(module = %self.publisher.module(), schedule = %expr, "Publish schedule updated");
                self.schedule = schedule;
            }
            Err(e) => {
                warn!(module = %self.publisher.module(), error = %e, "Ignoring invalid publish schedule");
            }
        }
    }

    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let module = self.publisher.module().to_string();
        info!(module = %module, schedule = %self.schedule.expression(), "CronPublishJob started");

        loop {
            let delay = match self.schedule.delay_from(Utc::now()) {
                Ok(delay) => delay,
                Err(e) => {
                    error!(module = %module, error = %e, "CronPublishJob has nothing left to run");
                    break;
                }
            };

            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(module = %module, "CronPublishJob received shutdown signal");
                        break;
                    }
                }

                _ = tokio::time::sleep(delay) => {
                    match self.publisher.publish_pending().await {
                        Ok(processed) => info!(module = %module, processed, "Scheduled publish run finished"),
                        Err(e) => error!(module = %module, error = %e, "Scheduled publish run failed"),
                    }
                    self.refresh_schedule().await;
                }

                Ok(()) = self.reloads.changed() => {
                    self.refresh_schedule().await;
                }
            }
        }

        info!(module = %module, "CronPublishJob shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::PublisherMode;
    use crate::registry::EventCatalog;
    use crate::store::MemoryOutboxStore;
    use courier_sdk::events::RequestSubmitted;
    use std::time::Duration;
    use uuid::Uuid;

    fn publisher(
        settings: &ConfigStore<RelaySettings>,
    ) -> Arc<OutboxPublisher<MemoryOutboxStore, MemoryBroker>> {
        Arc::new(OutboxPublisher::new(
            "appraisals",
            MemoryOutboxStore::new(),
            MemoryBroker::new(),
            Arc::new(EventCatalog::new()),
            settings.clone(),
        ))
    }

    fn cron_settings(expr: &str) -> RelaySettings {
        let mut settings = RelaySettings::default();
        settings.publisher.mode = PublisherMode::Cron;
        settings.publisher.cron = Some(expr.to_string());
        settings
    }

    #[tokio::test]
    async fn test_new_requires_valid_expression() {
        let settings = ConfigStore::new(cron_settings("whenever"));
        assert!(CronPublishJob::new(publisher(&settings), settings.clone()).await.is_err());

        let settings = ConfigStore::new(RelaySettings::default());
        assert!(CronPublishJob::new(publisher(&settings), settings.clone()).await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_keeps_previous_schedule_on_invalid_update() {
        let settings = ConfigStore::new(cron_settings("0 */5 * * * *"));
        let mut job = CronPublishJob::new(publisher(&settings), settings.clone())
            .await
            .unwrap();

        settings.update(cron_settings("0 0 * * * *")).await;
        job.refresh_schedule().await;
        assert_eq!(job.schedule().expression(), "0 0 * * * *");

        settings.update(cron_settings("nope")).await;
        job.refresh_schedule().await;
        assert_eq!(job.schedule().expression(), "0 0 * * * *");
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let settings = ConfigStore::new(cron_settings("0 0 3 * * *"));
        let job = CronPublishJob::new(publisher(&settings), settings.clone())
            .await
            .unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(job.run(shutdown_rx));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_reload_replaces_pending_sleep() {
        let settings = ConfigStore::new(cron_settings("0 0 3 1 1 *"));
        let publisher = publisher(&settings);
        let job = CronPublishJob::new(publisher.clone(), settings.clone())
            .await
            .unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(job.run(shutdown_rx));

        let event = RequestSubmitted {
            request_id: Uuid::now_v7(),
            request_number: "REQ-3".to_string(),
        };
        publisher.store().enqueue_committed(&event, 3).unwrap();
        settings.update(cron_settings("* * * * * *")).await;

        // The empty catalog dead-letters the record once a run happens.
        tokio::time::timeout(Duration::from_secs(5), async {
            while !publisher.store().records().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(publisher.store().dead_letter_records().len(), 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
