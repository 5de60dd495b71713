//! Runtime settings for the relay workers.
//!
//! These are the validated values the processors read. Parsing the TOML file
//! and the environment is the server crate's job; it builds a
//! [`RelaySettings`] and publishes it through a [`ConfigStore`] so a reload
//! reaches every worker without a restart.

mod config_store;

pub use config_store::{ConfigStore, ConfigWatcher};

use crate::entities::ModuleSchema;
use crate::utils::cron_schedule::{CronSchedule, ScheduleError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_FAST_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_SLOW_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_IDLE_CYCLES_BEFORE_SLOW: u32 = 10;
pub const DEFAULT_CHUNK_SIZE: usize = 20;
pub const DEFAULT_MAX_RECORDS_PER_RUN: usize = 500;
pub const DEFAULT_MAX_DELIVERIES: u64 = 5;
pub const DEFAULT_RETENTION_DAYS: u32 = 7;
pub const DEFAULT_CLEANUP_SCHEDULE: &str = "0 0 3 * * *";

/// Everything a worker may re-read between cycles.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RelaySettings {
    pub poll: PollSettings,
    pub publisher: PublisherSettings,
    pub inbox: InboxSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    /// Sleep between cycles while the outbox is busy.
    pub fast_interval: Duration,
    /// Sleep between cycles while the outbox is idle.
    pub slow_interval: Duration,
    /// Consecutive empty cycles before falling back to `slow_interval`.
    pub idle_cycles_before_slow: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            fast_interval: DEFAULT_FAST_INTERVAL,
            slow_interval: DEFAULT_SLOW_INTERVAL,
            idle_cycles_before_slow: DEFAULT_IDLE_CYCLES_BEFORE_SLOW,
        }
    }
}

/// What happens to a record whose infrastructure retries are used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustedPolicy {
    /// Move it to the dead-letter table.
    #[default]
    DeadLetter,
    /// Delete it. The event is lost; logged at `error`.
    Drop,
}

/// Which entry points drive the outbox publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublisherMode {
    #[default]
    Adaptive,
    Cron,
    Both,
}

impl PublisherMode {
    pub fn runs_adaptive(self) -> bool {
        matches!(self, PublisherMode::Adaptive | PublisherMode::Both)
    }

    pub fn runs_cron(self) -> bool {
        matches!(self, PublisherMode::Cron | PublisherMode::Both)
    }
}

impl fmt::Display for PublisherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PublisherMode::Adaptive => "adaptive",
            PublisherMode::Cron => "cron",
            PublisherMode::Both => "both",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherSettings {
    pub chunk_size: usize,
    /// Upper bound on records attempted by one publish run. Whatever is left
    /// waits for the next cycle.
    pub max_records_per_run: usize,
    /// `MaxRetries` stamped on newly enqueued records and on requeued dead letters.
    pub max_retries: i32,
    pub exhausted_policy: ExhaustedPolicy,
    pub mode: PublisherMode,
    /// Required when `mode` runs the cron job.
    pub cron: Option<String>,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_records_per_run: DEFAULT_MAX_RECORDS_PER_RUN,
            max_retries: crate::entities::outbox::DEFAULT_MAX_RETRIES,
            exhausted_policy: ExhaustedPolicy::default(),
            mode: PublisherMode::default(),
            cron: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxSettings {
    pub retention_days: u32,
    pub cleanup_enabled: bool,
    /// Six-field cron expression (seconds first).
    pub cleanup_schedule: String,
}

impl Default for InboxSettings {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_RETENTION_DAYS,
            cleanup_enabled: true,
            cleanup_schedule: DEFAULT_CLEANUP_SCHEDULE.to_string(),
        }
    }
}

/// Redis Streams connection and stream layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub redis_url: String,
    pub stream: String,
    pub dead_letter_stream: String,
    /// Max entries per XREADGROUP / XPENDING call.
    pub read_count: usize,
    pub block_ms: u64,
    /// Pending entries idle for longer than this are reclaimed.
    pub claim_idle_ms: u64,
    /// A delivery still retryable on its last allowed attempt is
    /// dead-lettered instead of left pending.
    pub max_deliveries: u64,
    pub publish_timeout_ms: u64,
    /// Approximate MAXLEN applied on publish. `None` keeps everything.
    pub max_stream_len: Option<usize>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            stream: "courier:events".to_string(),
            dead_letter_stream: "courier:events:dead".to_string(),
            read_count: 16,
            block_ms: 5_000,
            claim_idle_ms: 60_000,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            publish_timeout_ms: 5_000,
            max_stream_len: Some(100_000),
        }
    }
}

/// A module taking part in the relay: its name (also its consumer group)
/// and the schema holding its outbox and inbox tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleConfig {
    pub name: String,
    pub schema: ModuleSchema,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("poll fast interval ({fast:?}) exceeds slow interval ({slow:?})")]
    IntervalOrder { fast: Duration, slow: Duration },

    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),

    #[error("publisher mode '{0}' requires a cron expression")]
    MissingCron(PublisherMode),

    #[error("invalid schedule for {field}: {source}")]
    Schedule {
        field: &'static str,
        #[source]
        source: ScheduleError,
    },
}

impl RelaySettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        let poll = &self.poll;
        if poll.fast_interval.is_zero() {
            return Err(SettingsError::NotPositive("poll.fast_interval"));
        }
        if poll.fast_interval > poll.slow_interval {
            return Err(SettingsError::IntervalOrder {
                fast: poll.fast_interval,
                slow: poll.slow_interval,
            });
        }
        if poll.idle_cycles_before_slow == 0 {
            return Err(SettingsError::NotPositive("poll.idle_cycles_before_slow"));
        }
        if self.publisher.chunk_size == 0 {
            return Err(SettingsError::NotPositive("outbox.chunk_size"));
        }
        if self.publisher.max_records_per_run == 0 {
            return Err(SettingsError::NotPositive("outbox.max_records_per_run"));
        }
        if self.publisher.max_retries <= 0 {
            return Err(SettingsError::NotPositive("outbox.max_retries"));
        }
        if self.publisher.mode.runs_cron() {
            let Some(expr) = &self.publisher.cron else {
                return Err(SettingsError::MissingCron(self.publisher.mode));
            };
            CronSchedule::parse(expr).map_err(|source| SettingsError::Schedule {
                field: "outbox.cron",
                source,
            })?;
        }
        if self.inbox.retention_days == 0 {
            return Err(SettingsError::NotPositive("inbox.retention_days"));
        }
        CronSchedule::parse(&self.inbox.cleanup_schedule).map_err(|source| {
            SettingsError::Schedule {
                field: "inbox.cleanup_schedule",
                source,
            }
        })?;
        Ok(())
    }
}
