//! Signal handling for graceful shutdown and settings reload.

use crate::config::{ConfigLoader, LoadedConfig};
use courier_core::config::{ConfigStore, RelaySettings};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Notify;

/// Completes when SIGTERM or SIGINT (Ctrl+C) is received.
pub async fn shutdown_signal() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }
    Ok(())
}

/// Spawns a task that reloads the relay settings on SIGHUP.
///
/// Intervals, chunk size, retry policy, schedules and retention apply on the
/// workers' next cycle. Broker and module changes need a restart and are only
/// reported. Notify the returned handle to stop the task.
pub fn spawn_config_reload_handler(
    config_loader: Arc<ConfigLoader>,
    settings: ConfigStore<RelaySettings>,
    running: LoadedConfig,
) -> std::io::Result<Arc<Notify>> {
    let mut sighup = signal(SignalKind::hangup())?;
    let shutdown_notify = Arc::new(Notify::new());
    let shutdown_notify_clone = shutdown_notify.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    tracing::info!("Received SIGHUP, reloading configuration");
                    match config_loader.reload() {
                        Ok(loaded) => {
                            if loaded.broker != running.broker {
                                tracing::warn!("Broker settings changed; restart to apply them");
                            }
                            if loaded.modules != running.modules {
                                tracing::warn!("Module list changed; restart to apply it");
                            }
                            if loaded.relay.publisher.mode != running.relay.publisher.mode {
                                tracing::warn!("Publisher mode changed; restart to apply it");
                            }
                            let version = settings.update(loaded.relay).await;
                            tracing::info!(version, "Configuration reloaded successfully");
                        }
                        Err(e) => {
                            tracing::error!("Failed to reload configuration: {}", e);
                        }
                    }
                }
                _ = shutdown_notify_clone.notified() => {
                    tracing::debug!("Config reload handler shutting down");
                    break;
                }
            }
        }
    });

    Ok(shutdown_notify)
}
