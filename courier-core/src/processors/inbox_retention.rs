//! InboxRetentionJob processor.
//!
//! Deletes inbox rows older than the retention window on a cron schedule
//! (daily at 03:00 UTC by default). The window must stay longer than the
//! broker's redelivery horizon, otherwise a late redelivery is no longer
//! recognised as a duplicate. A settings reload recomputes the next run.

use crate::config::{ConfigStore, ConfigWatcher, RelaySettings};
use crate::store::{InboxStore, StoreError};
use crate::utils::cron_schedule::{CronSchedule, ScheduleError};
use chrono::Utc;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("inbox store error: {0}")]
    Store(#[from] StoreError),

    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),
}

pub struct InboxRetentionJob<S> {
    module: String,
    store: S,
    settings: ConfigStore<RelaySettings>,
    reloads: ConfigWatcher,
}

impl<S: InboxStore> InboxRetentionJob<S> {
    pub fn new(module: impl Into<String>, store: S, settings: ConfigStore<RelaySettings>) -> Self {
        let reloads = settings.subscribe();
        Self {
            module: module.into(),
            store,
            settings,
            reloads,
        }
    }

    /// Purge rows received before `now - retention_days`.
    ///
    /// Returns `None` without touching the store when cleanup is disabled.
    pub async fn purge_once(&self, now: OffsetDateTime) -> Result<Option<u64>, RetentionError> {
        let inbox = self.settings.read().await.inbox.clone();
        if !inbox.cleanup_enabled {
            debug!(module = %self.module, "Inbox cleanup disabled, skipping");
            return Ok(None);
        }
        let cutoff = now - time::Duration::days(i64::from(inbox.retention_days));
        let purged = self.store.purge_received_before(cutoff).await?;
        info!(module = %self.module, purged, %cutoff, "Purged expired inbox records");
        Ok(Some(purged))
    }

    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(module = %self.module, "InboxRetentionJob started");

        loop {
            let expr = self.settings.read().await.inbox.cleanup_schedule.clone();
            let delay = match CronSchedule::parse(&expr).and_then(|s| s.delay_from(Utc::now())) {
                Ok(delay) => delay,
                Err(e) => {
                    error!(module = %self.module, error = %e, "Invalid inbox cleanup schedule, stopping");
                    break;
                }
            };

            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(module = %self.module, "InboxRetentionJob received shutdown signal");
                        break;
                    }
                }

                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = self.purge_once(OffsetDateTime::now_utc()).await {
                        error!(module = %self.module, error = %e, "Inbox cleanup failed");
                    }
                }

                Ok(()) = self.reloads.changed() => {
                    debug!(module = %self.module, "Settings reloaded, rescheduling inbox cleanup");
                }
            }
        }

        info!(module = %self.module, "InboxRetentionJob shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::InboxRecord;
    use crate::store::MemoryInboxStore;
    use std::time::Duration;
    use time::macros::datetime;

    fn row(id: &str, received_at: OffsetDateTime) -> InboxRecord {
        InboxRecord {
            id: id.to_string(),
            event_type: "RequestSubmitted".to_string(),
            payload: serde_json::json!({}),
            occurred_on: received_at,
            received_at,
        }
    }

    #[tokio::test]
    async fn test_purges_only_rows_older_than_window() {
        let store = MemoryInboxStore::new();
        let now = datetime!(2026-03-10 03:00:00 UTC);
        store.seed(row("old", now - time::Duration::days(8)));
        store.seed(row("edge", now - time::Duration::days(7)));
        store.seed(row("fresh", now - time::Duration::hours(1)));
        let job = InboxRetentionJob::new(
            "documents",
            store.clone(),
            ConfigStore::new(RelaySettings::default()),
        );

        assert_eq!(job.purge_once(now).await.unwrap(), Some(1));
        assert!(!store.contains("old"));
        assert!(store.contains("edge"));
        assert!(store.contains("fresh"));
    }

    #[tokio::test]
    async fn test_disabled_cleanup_skips() {
        let store = MemoryInboxStore::new();
        let now = datetime!(2026-03-10 03:00:00 UTC);
        store.seed(row("old", now - time::Duration::days(30)));
        let mut settings = RelaySettings::default();
        settings.inbox.cleanup_enabled = false;
        let job = InboxRetentionJob::new("documents", store.clone(), ConfigStore::new(settings));

        assert_eq!(job.purge_once(now).await.unwrap(), None);
        assert!(store.contains("old"));
    }

    #[tokio::test]
    async fn test_retention_window_follows_settings() {
        let store = MemoryInboxStore::new();
        let now = datetime!(2026-03-10 03:00:00 UTC);
        store.seed(row("two-days", now - time::Duration::days(2)));
        let settings = ConfigStore::new(RelaySettings::default());
        let job = InboxRetentionJob::new("documents", store.clone(), settings.clone());

        assert_eq!(job.purge_once(now).await.unwrap(), Some(0));

        let mut shorter = RelaySettings::default();
        shorter.inbox.retention_days = 1;
        settings.update(shorter).await;
        assert_eq!(job.purge_once(now).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let job = InboxRetentionJob::new(
            "documents",
            MemoryInboxStore::new(),
            ConfigStore::new(RelaySettings::default()),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(job.run(shutdown_rx));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_reload_reschedules_pending_cleanup() {
        let store = MemoryInboxStore::new();
        store.seed(row("stale", OffsetDateTime::now_utc() - time::Duration::days(30)));
        let mut settings = RelaySettings::default();
        settings.inbox.cleanup_schedule = "0 0 3 1 1 *".to_string();
        let settings = ConfigStore::new(settings);
        let job = InboxRetentionJob::new("documents", store.clone(), settings.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(job.run(shutdown_rx));

        let mut every_second = RelaySettings::default();
        every_second.inbox.cleanup_schedule = "* * * * * *".to_string();
        settings.update(every_second).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.contains("stale") {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
