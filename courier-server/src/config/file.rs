//! TOML file configuration structures.
//!
//! These structs map directly to the `courier.toml` file format. Every
//! tunable has a serde default, so a file listing only `[[modules]]` is valid.

use courier_core::config::{
    self as core_config, BrokerSettings, ExhaustedPolicy, PublisherMode,
};
use courier_core::entities::ModuleSchema;
use serde::{Deserialize, Serialize};

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub inbox: InboxConfig,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

/// Redis Streams section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Overridden by the `REDIS_URL` environment variable when set.
    pub redis_url: String,
    pub stream: String,
    pub dead_letter_stream: String,
    pub read_count: usize,
    pub block_ms: u64,
    pub claim_idle_ms: u64,
    /// Deliveries of a still-failing message before it is dead-lettered.
    pub max_deliveries: u64,
    pub publish_timeout_ms: u64,
    /// Approximate stream length cap; `0` disables trimming.
    pub max_stream_len: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let defaults = BrokerSettings::default();
        Self {
            redis_url: defaults.redis_url,
            stream: defaults.stream,
            dead_letter_stream: defaults.dead_letter_stream,
            read_count: defaults.read_count,
            block_ms: defaults.block_ms,
            claim_idle_ms: defaults.claim_idle_ms,
            max_deliveries: defaults.max_deliveries,
            publish_timeout_ms: defaults.publish_timeout_ms,
            max_stream_len: defaults.max_stream_len.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedPolicyConfig {
    #[default]
    DeadLetter,
    Drop,
}

impl From<ExhaustedPolicyConfig> for ExhaustedPolicy {
    fn from(value: ExhaustedPolicyConfig) -> Self {
        match value {
            ExhaustedPolicyConfig::DeadLetter => ExhaustedPolicy::DeadLetter,
            ExhaustedPolicyConfig::Drop => ExhaustedPolicy::Drop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PublisherModeConfig {
    #[default]
    Adaptive,
    Cron,
    Both,
}

impl From<PublisherModeConfig> for PublisherMode {
    fn from(value: PublisherModeConfig) -> Self {
        match value {
            PublisherModeConfig::Adaptive => PublisherMode::Adaptive,
            PublisherModeConfig::Cron => PublisherMode::Cron,
            PublisherModeConfig::Both => PublisherMode::Both,
        }
    }
}

/// Outbox publisher section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub fast_interval_secs: u64,
    pub slow_interval_secs: u64,
    pub idle_cycles_before_slow: u32,
    pub chunk_size: usize,
    pub max_records_per_run: usize,
    pub max_retries: i32,
    pub exhausted_policy: ExhaustedPolicyConfig,
    pub mode: PublisherModeConfig,
    /// Required when `mode` is `cron` or `both`.
    pub cron: Option<String>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            fast_interval_secs: core_config::DEFAULT_FAST_INTERVAL.as_secs(),
            slow_interval_secs: core_config::DEFAULT_SLOW_INTERVAL.as_secs(),
            idle_cycles_before_slow: core_config::DEFAULT_IDLE_CYCLES_BEFORE_SLOW,
            chunk_size: core_config::DEFAULT_CHUNK_SIZE,
            max_records_per_run: core_config::DEFAULT_MAX_RECORDS_PER_RUN,
            max_retries: courier_core::entities::outbox::DEFAULT_MAX_RETRIES,
            exhausted_policy: ExhaustedPolicyConfig::default(),
            mode: PublisherModeConfig::default(),
            cron: None,
        }
    }
}

/// Inbox retention section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxConfig {
    pub retention_days: u32,
    pub cleanup_enabled: bool,
    pub cleanup_schedule: String,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            retention_days: core_config::DEFAULT_RETENTION_DAYS,
            cleanup_enabled: true,
            cleanup_schedule: core_config::DEFAULT_CLEANUP_SCHEDULE.to_string(),
        }
    }
}

/// A module hosted by this relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Module name, also used as its consumer group.
    pub name: String,
    /// Schema holding the module's tables. Defaults to `name`.
    #[serde(default)]
    pub schema: Option<ModuleSchema>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_parsing() {
        let toml_str = r#"
[broker]
redis_url = "redis://cache:6379/2"
stream = "valuation:events"
claim_idle_ms = 30000
max_deliveries = 8
max_stream_len = 0

[outbox]
fast_interval_secs = 2
slow_interval_secs = 20
chunk_size = 50
max_records_per_run = 200
exhausted_policy = "drop"
mode = "both"
cron = "0 */5 * * * *"

[inbox]
retention_days = 14
cleanup_enabled = false

[[modules]]
name = "appraisal"

[[modules]]
name = "request"
schema = "request_v2"
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.broker.redis_url, "redis://cache:6379/2");
        assert_eq!(config.broker.stream, "valuation:events");
        assert_eq!(config.broker.dead_letter_stream, "courier:events:dead");
        assert_eq!(config.broker.claim_idle_ms, 30_000);
        assert_eq!(config.broker.max_deliveries, 8);
        assert_eq!(config.broker.max_stream_len, 0);
        assert_eq!(config.outbox.chunk_size, 50);
        assert_eq!(config.outbox.max_records_per_run, 200);
        assert_eq!(config.outbox.exhausted_policy, ExhaustedPolicyConfig::Drop);
        assert_eq!(config.outbox.mode, PublisherModeConfig::Both);
        assert_eq!(config.outbox.max_retries, 3);
        assert_eq!(config.inbox.retention_days, 14);
        assert!(!config.inbox.cleanup_enabled);
        assert_eq!(config.inbox.cleanup_schedule, "0 0 3 * * *");
        assert_eq!(config.modules.len(), 2);
        assert!(config.modules[0].schema.is_none());
        assert_eq!(config.modules[1].schema.as_ref().unwrap().as_str(), "request_v2");
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let config: FileConfig = toml::from_str("[[modules]]\nname = \"document\"\n").unwrap();
        assert_eq!(config.outbox.fast_interval_secs, 1);
        assert_eq!(config.outbox.slow_interval_secs, 10);
        assert_eq!(config.outbox.idle_cycles_before_slow, 10);
        assert_eq!(config.outbox.mode, PublisherModeConfig::Adaptive);
        assert_eq!(config.outbox.max_records_per_run, 500);
        assert_eq!(config.broker.max_deliveries, 5);
        assert_eq!(config.inbox.retention_days, 7);
        assert!(config.inbox.cleanup_enabled);
        assert_eq!(config.broker.stream, "courier:events");
    }

    #[test]
    fn test_invalid_schema_rejected_at_parse() {
        let result: Result<FileConfig, _> =
            toml::from_str("[[modules]]\nname = \"x\"\nschema = \"Bad-Schema\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let result: Result<FileConfig, _> = toml::from_str("[outbox]\nexhausted_policy = \"ignore\"\n");
        assert!(result.is_err());
    }
}
