//! Courier relay server
//!
//! Publishes every hosted module's outbox to Redis Streams and feeds each
//! module's handlers through its inbox.

mod config;
mod handlers;
mod ops;
mod shutdown;
mod state;
mod workers;

use anyhow::{Context, bail};
use clap::Parser;
use config::{ConfigLoader, LoadedConfig, get_database_url};
use courier_core::broker::RedisBroker;
use courier_core::config::{ConfigStore, ModuleConfig};
use courier_core::entities::schema::InstallModuleSchema;
use courier_core::framework::DatabaseProcessor;
use kanau::processor::Processor;
use ops::Command;
use shutdown::{shutdown_signal, spawn_config_reload_handler};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use state::RelayState;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Courier - transactional outbox/inbox relay over Redis Streams
#[derive(Parser, Debug)]
#[command(name = "courier-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./courier.toml")]
    config: PathBuf,

    /// Install the module schemas on startup
    #[arg(long, default_value = "false")]
    migrate: bool,

    /// Run one publish pass and one retention pass per module, then exit
    #[arg(long, default_value = "false")]
    once: bool,

    /// Emit logs as JSON lines
    #[arg(long, default_value = "false")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    tracing::info!("Starting courier-server v{}", env!("CARGO_PKG_VERSION"));

    let config_loader = Arc::new(ConfigLoader::new(&args.config));
    let loaded_config = config_loader.load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;
    tracing::info!(
        "Configuration loaded from {:?} ({} modules)",
        config_loader.path(),
        loaded_config.modules.len()
    );

    let database_url = get_database_url().map_err(|e| {
        tracing::error!("DATABASE_URL environment variable not set");
        e
    })?;

    tracing::info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            e
        })?;
    tracing::info!("Database connection established");

    if args.migrate {
        install_schemas(&db_pool, &loaded_config.modules).await?;
    }

    let result = match args.command.clone() {
        Some(command) => run_command(command, &db_pool, &loaded_config).await,
        None => run_relay(&args, config_loader, &db_pool, loaded_config).await,
    };

    tracing::info!("Closing database connections...");
    db_pool.close().await;
    tracing::info!("Server shutdown complete");

    result
}

async fn install_schemas(pool: &PgPool, modules: &[ModuleConfig]) -> anyhow::Result<()> {
    tracing::info!("Installing module schemas...");
    for module in modules {
        DatabaseProcessor::new(pool.clone(), module.schema.clone())
            .process(InstallModuleSchema)
            .await
            .map_err(|e| {
                tracing::error!(module = %module.name, "Failed to install schema: {}", e);
                e
            })?;
        tracing::info!(module = %module.name, schema = %module.schema, "Schema installed");
    }
    Ok(())
}

async fn run_relay(
    args: &Args,
    config_loader: Arc<ConfigLoader>,
    db_pool: &PgPool,
    loaded_config: LoadedConfig,
) -> anyhow::Result<()> {
    let broker = RedisBroker::connect(&loaded_config.broker)
        .await
        .context("failed to connect to Redis")?;
    let settings = ConfigStore::new(loaded_config.relay.clone());
    let state = RelayState::new(
        db_pool.clone(),
        broker,
        loaded_config.broker.clone(),
        settings.clone(),
    );

    if args.once {
        for module in &loaded_config.modules {
            workers::run_module_once(&state, module).await?;
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    for module in &loaded_config.modules {
        match workers::spawn_module_workers(&state, module, &shutdown_rx).await {
            Ok(spawned) => handles.extend(spawned),
            Err(e) => {
                // Stop what already started before bailing out.
                let _ = shutdown_tx.send(true);
                for handle in handles {
                    let _ = handle.await;
                }
                return Err(e);
            }
        }
    }

    // Spawn config reload handler (listens for SIGHUP)
    let reload_notify = spawn_config_reload_handler(config_loader, settings, loaded_config)?;

    tracing::info!("Relay running, {} workers", handles.len());
    let signal_result = shutdown_signal().await;

    let _ = shutdown_tx.send(true);
    reload_notify.notify_one();
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!("Worker task failed: {}", e);
        }
    }

    signal_result.map_err(Into::into)
}

async fn run_command(
    command: Command,
    db_pool: &PgPool,
    loaded_config: &LoadedConfig,
) -> anyhow::Result<()> {
    let find_module = |name: &str| {
        loaded_config
            .modules
            .iter()
            .find(|m| m.name == name)
            .cloned()
    };
    let store_for = |module: &ModuleConfig| {
        courier_core::store::PgOutboxStore::new(db_pool.clone(), module.schema.clone())
    };

    match command {
        Command::Pending => {
            for module in &loaded_config.modules {
                println!("{}", ops::pending_line(&module.name, &store_for(module)).await?);
            }
        }
        Command::DeadLetters { module, limit } => {
            let Some(module) = find_module(&module) else {
                bail!("unknown module {module}");
            };
            for line in ops::dead_letter_lines(&store_for(&module), limit).await? {
                println!("{line}");
            }
        }
        Command::Requeue { module, id } => {
            let Some(module) = find_module(&module) else {
                bail!("unknown module {module}");
            };
            let max_retries = loaded_config.relay.publisher.max_retries;
            if !ops::requeue(&store_for(&module), id, max_retries).await? {
                bail!("no dead letter {id} in module {}", module.name);
            }
        }
    }
    Ok(())
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}
