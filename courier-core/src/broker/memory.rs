//! In-process broker.
//!
//! `MemoryBroker` records what was published and can be scripted to fail the
//! next attempts. Each [`subscribe`](MemoryBroker::subscribe) call creates an
//! independent [`MemorySource`], the in-process counterpart of a consumer group.

use super::{BrokerError, Delivery, MessageBroker, MessageSource};
use async_trait::async_trait;
use courier_sdk::TransportMessage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct BrokerState {
    published: Vec<TransportMessage>,
    scripted_failures: VecDeque<BrokerError>,
    attempts: usize,
    subscribers: Vec<MemorySourceHandle>,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next publish attempt fail with `error`. Calls queue up.
    pub fn fail_next(&self, error: BrokerError) {
        lock(&self.state).scripted_failures.push_back(error);
    }

    pub fn published(&self) -> Vec<TransportMessage> {
        lock(&self.state).published.clone()
    }

    /// Publish attempts, failed ones included.
    pub fn attempts(&self) -> usize {
        lock(&self.state).attempts
    }

    pub fn subscribe(&self) -> (MemorySourceHandle, MemorySource) {
        let (handle, source) = memory_source();
        lock(&self.state).subscribers.push(handle.clone());
        (handle, source)
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn publish(&self, message: &TransportMessage) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        state.attempts += 1;
        if let Some(error) = state.scripted_failures.pop_front() {
            return Err(error);
        }
        state.published.push(message.clone());
        for subscriber in &state.subscribers {
            subscriber.deliver(message.clone());
        }
        Ok(())
    }
}

#[derive(Default)]
struct SourceLog {
    acked: Vec<String>,
    dead_lettered: Vec<(String, String)>,
}

/// Producer side of a [`MemorySource`], also used to inspect ack decisions.
#[derive(Clone)]
pub struct MemorySourceHandle {
    tx: mpsc::UnboundedSender<Delivery>,
    log: Arc<Mutex<SourceLog>>,
    next_id: Arc<AtomicU64>,
}

impl MemorySourceHandle {
    /// Queue a message for delivery; returns the delivery id assigned to it.
    pub fn deliver(&self, message: TransportMessage) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let delivery_id = format!("{n}-0");
        let _ = self.tx.send(Delivery {
            delivery_id: delivery_id.clone(),
            message,
            delivery_count: 1,
        });
        delivery_id
    }

    /// Hand an unacknowledged delivery out again.
    pub fn redeliver(&self, mut delivery: Delivery) {
        delivery.delivery_count += 1;
        let _ = self.tx.send(delivery);
    }

    pub fn acked(&self) -> Vec<String> {
        lock(&self.log).acked.clone()
    }

    /// `(delivery_id, error)` pairs.
    pub fn dead_lettered(&self) -> Vec<(String, String)> {
        lock(&self.log).dead_lettered.clone()
    }
}

pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Delivery>,
    log: Arc<Mutex<SourceLog>>,
}

pub fn memory_source() -> (MemorySourceHandle, MemorySource) {
    let (tx, rx) = mpsc::unbounded_channel();
    let log = Arc::new(Mutex::new(SourceLog::default()));
    (
        MemorySourceHandle {
            tx,
            log: Arc::clone(&log),
            next_id: Arc::new(AtomicU64::new(0)),
        },
        MemorySource { rx, log },
    )
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn next_batch(&mut self) -> Result<Vec<Delivery>, BrokerError> {
        let Some(first) = self.rx.recv().await else {
            return Err(BrokerError::Unavailable("memory source closed".to_string()));
        };
        let mut batch = vec![first];
        while let Ok(next) = self.rx.try_recv() {
            batch.push(next);
        }
        Ok(batch)
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        lock(&self.log).acked.push(delivery.delivery_id.clone());
        Ok(())
    }

    async fn dead_letter(&mut self, delivery: &Delivery, error: &str) -> Result<(), BrokerError> {
        let mut log = lock(&self.log);
        log.dead_lettered
            .push((delivery.delivery_id.clone(), error.to_string()));
        log.acked.push(delivery.delivery_id.clone());
        Ok(())
    }
}
