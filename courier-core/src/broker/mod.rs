//! Message broker seam.
//!
//! [`MessageBroker`] is the publishing side used by the outbox publisher.
//! [`MessageSource`] is the consuming side used by the inbound consumer; it
//! hands out [`Delivery`]s and takes the ack / dead-letter decision back.

pub mod memory;
pub mod redis;

pub use memory::{MemoryBroker, MemorySource, MemorySourceHandle, memory_source};
pub use self::redis::{RedisBroker, RedisStreamSource};

use crate::entities::FailureKind;
use async_trait::async_trait;
use courier_sdk::TransportMessage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Redis connection or command error
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// Broker could not be reached or timed out
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Broker refused the message itself (too large, invalid fields)
    #[error("message rejected by broker: {0}")]
    Rejected(String),

    /// Unexpected reply shape
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            BrokerError::Rejected(_) => FailureKind::Application,
            BrokerError::Redis(e) if e.kind() == ::redis::ErrorKind::TypeError => {
                FailureKind::Application
            }
            BrokerError::Redis(_) | BrokerError::Unavailable(_) | BrokerError::Protocol(_) => {
                FailureKind::Infrastructure
            }
        }
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish one message. Returns once the broker has accepted it.
    async fn publish(&self, message: &TransportMessage) -> Result<(), BrokerError>;
}

/// A message handed to a consumer, with the broker-side handle needed to
/// acknowledge it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Broker handle (a stream entry id for Redis).
    pub delivery_id: String,
    pub message: TransportMessage,
    /// How many times the broker has handed this entry out, this one included.
    pub delivery_count: u64,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

#[async_trait]
pub trait MessageSource: Send {
    /// Wait for the next deliveries. May return an empty batch on timeout.
    async fn next_batch(&mut self) -> Result<Vec<Delivery>, BrokerError>;

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Park the delivery on the dead-letter destination, then ack it.
    async fn dead_letter(&mut self, delivery: &Delivery, error: &str) -> Result<(), BrokerError>;

    async fn reconnect(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}
