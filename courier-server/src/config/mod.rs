//! Configuration module for courier-server.
//!
//! Loads the TOML file, applies environment overrides and turns the result
//! into the validated settings the relay workers run with.

pub mod file;

use crate::config::file::FileConfig;
use courier_core::config::{
    BrokerSettings, InboxSettings, ModuleConfig, PollSettings, PublisherSettings, RelaySettings,
};
use courier_core::entities::ModuleSchema;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("DATABASE_URL environment variable not set")]
    MissingDatabaseUrl,
}

/// Everything the server needs from the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedConfig {
    pub broker: BrokerSettings,
    pub relay: RelaySettings,
    pub modules: Vec<ModuleConfig>,
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: PathBuf,
}

impl ConfigLoader {
    pub fn new(config_path: impl AsRef<Path>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Read the file, apply `REDIS_URL` and validate.
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let content = std::fs::read_to_string(&self.config_path)?;
        let file_config: FileConfig = toml::from_str(&content)?;
        build_loaded_config(file_config, std::env::var("REDIS_URL").ok())
    }

    /// Reload the configuration (used during SIGHUP).
    pub fn reload(&self) -> Result<LoadedConfig, ConfigError> {
        self.load()
    }
}

fn build_loaded_config(
    file_config: FileConfig,
    redis_url_override: Option<String>,
) -> Result<LoadedConfig, ConfigError> {
    let modules = convert_modules(file_config.modules)?;

    let outbox = file_config.outbox;
    let relay = RelaySettings {
        poll: PollSettings {
            fast_interval: Duration::from_secs(outbox.fast_interval_secs),
            slow_interval: Duration::from_secs(outbox.slow_interval_secs),
            idle_cycles_before_slow: outbox.idle_cycles_before_slow,
        },
        publisher: PublisherSettings {
            chunk_size: outbox.chunk_size,
            max_records_per_run: outbox.max_records_per_run,
            max_retries: outbox.max_retries,
            exhausted_policy: outbox.exhausted_policy.into(),
            mode: outbox.mode.into(),
            cron: outbox.cron,
        },
        inbox: InboxSettings {
            retention_days: file_config.inbox.retention_days,
            cleanup_enabled: file_config.inbox.cleanup_enabled,
            cleanup_schedule: file_config.inbox.cleanup_schedule,
        },
    };
    relay
        .validate()
        .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

    let broker = file_config.broker;
    if broker.read_count == 0 {
        return Err(ConfigError::ValidationError(
            "broker.read_count must be greater than zero".to_string(),
        ));
    }
    if broker.max_deliveries == 0 {
        return Err(ConfigError::ValidationError(
            "broker.max_deliveries must be greater than zero".to_string(),
        ));
    }
    let broker = BrokerSettings {
        redis_url: redis_url_override.unwrap_or(broker.redis_url),
        stream: broker.stream,
        dead_letter_stream: broker.dead_letter_stream,
        read_count: broker.read_count,
        block_ms: broker.block_ms,
        claim_idle_ms: broker.claim_idle_ms,
        max_deliveries: broker.max_deliveries,
        publish_timeout_ms: broker.publish_timeout_ms,
        max_stream_len: (broker.max_stream_len > 0).then_some(broker.max_stream_len),
    };
    if broker.stream == broker.dead_letter_stream {
        return Err(ConfigError::ValidationError(
            "broker.stream and broker.dead_letter_stream must differ".to_string(),
        ));
    }

    Ok(LoadedConfig {
        broker,
        relay,
        modules,
    })
}

fn convert_modules(modules: Vec<file::ModuleConfig>) -> Result<Vec<ModuleConfig>, ConfigError> {
    if modules.is_empty() {
        return Err(ConfigError::ValidationError(
            "at least one [[modules]] entry is required".to_string(),
        ));
    }

    let mut names = HashSet::new();
    let mut schemas = HashSet::new();
    let mut converted = Vec::with_capacity(modules.len());
    for module in modules {
        if !names.insert(module.name.clone()) {
            return Err(ConfigError::ValidationError(format!(
                "module {} is listed twice",
                module.name
            )));
        }
        let schema = match module.schema {
            Some(schema) => schema,
            None => ModuleSchema::new(module.name.clone()).map_err(|e| {
                ConfigError::ValidationError(format!(
                    "module {} needs an explicit schema: {e}",
                    module.name
                ))
            })?,
        };
        if !schemas.insert(schema.clone()) {
            return Err(ConfigError::ValidationError(format!(
                "schema {schema} is used by more than one module"
            )));
        }
        converted.push(ModuleConfig {
            name: module.name,
            schema,
        });
    }
    Ok(converted)
}

/// Get the database URL from the environment.
pub fn get_database_url() -> Result<String, ConfigError> {
    std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)
}
