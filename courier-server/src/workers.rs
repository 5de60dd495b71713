//! Per-module worker wiring.

use crate::handlers::registry_for;
use crate::state::RelayState;
use anyhow::Context;
use courier_core::broker::{RedisBroker, RedisStreamSource};
use courier_core::config::{ModuleConfig, PublisherMode};
use courier_core::processors::{
    CronPublishJob, DedupGate, InboundConsumer, InboxRetentionJob, OutboxPublisher, PollScheduler,
};
use courier_core::store::PgOutboxStore;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn publisher_for(
    state: &RelayState,
    module: &ModuleConfig,
) -> OutboxPublisher<PgOutboxStore, RedisBroker> {
    OutboxPublisher::new(
        module.name.clone(),
        state.outbox_store(module),
        state.broker.clone(),
        state.catalog.clone(),
        state.settings.clone(),
    )
}

/// Spawn the publisher, consumer and retention tasks of one module.
///
/// The publisher mode is read once here; switching it requires a restart.
pub async fn spawn_module_workers(
    state: &RelayState,
    module: &ModuleConfig,
    shutdown_rx: &watch::Receiver<bool>,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::new();
    let settings = state.settings.read().await.clone();
    let mode: PublisherMode = settings.publisher.mode;
    let publisher = Arc::new(publisher_for(state, module));

    if mode.runs_adaptive() {
        let scheduler = PollScheduler::new(publisher.clone(), state.settings.clone());
        handles.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));
    }
    if mode.runs_cron() {
        let job = CronPublishJob::new(publisher.clone(), state.settings.clone())
            .await
            .with_context(|| format!("invalid publish schedule for module {}", module.name))?;
        handles.push(tokio::spawn(job.run(shutdown_rx.clone())));
    }

    let retention =
        InboxRetentionJob::new(module.name.clone(), state.inbox_store(module), state.settings.clone());
    handles.push(tokio::spawn(retention.run(shutdown_rx.clone())));

    let registry = registry_for(module, settings.publisher.max_retries)
        .with_context(|| format!("conflicting handlers for module {}", module.name))?;
    if registry.is_empty() {
        tracing::info!(module = %module.name, "No handlers registered, consumer not started");
    } else {
        let consumer_name = format!("{}-{}", module.name, std::process::id());
        let source = RedisStreamSource::connect(
            state.broker_settings.clone(),
            module.name.clone(),
            consumer_name,
        )
        .await
        .with_context(|| format!("failed to join consumer group {}", module.name))?;
        tracing::info!(
            module = %module.name,
            event_types = ?registry.event_types(),
            "Subscribed to broker"
        );
        let gate = DedupGate::new(module.name.clone(), state.inbox_store(module), Arc::new(registry));
        let consumer = InboundConsumer::new(source, gate, state.broker_settings.max_deliveries);
        handles.push(tokio::spawn(consumer.run(shutdown_rx.clone())));
    }

    tracing::info!(module = %module.name, %mode, "Module workers started");
    Ok(handles)
}

/// One publish pass and one retention pass for `module`.
pub async fn run_module_once(state: &RelayState, module: &ModuleConfig) -> anyhow::Result<()> {
    let report = publisher_for(state, module)
        .run_once()
        .await
        .with_context(|| format!("publish pass failed for module {}", module.name))?;
    let retention =
        InboxRetentionJob::new(module.name.clone(), state.inbox_store(module), state.settings.clone());
    let purged = retention
        .purge_once(OffsetDateTime::now_utc())
        .await
        .with_context(|| format!("retention pass failed for module {}", module.name))?;

    tracing::info!(
        module = %module.name,
        published = report.published,
        retried = report.retried,
        dead_lettered = report.dead_lettered,
        dropped = report.dropped,
        purged = purged.unwrap_or(0),
        "Single pass complete"
    );
    Ok(())
}
