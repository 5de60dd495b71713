//! Startup-built lookup tables keyed by event type.
//!
//! [`EventCatalog`] is used by the outbox publisher: it turns a stored
//! payload back into its concrete event type and wraps it into the transport
//! envelope, which rejects rows that no longer match their declared type.
//!
//! [`HandlerRegistry`] is used by the inbound consumer: each module registers
//! one [`EventHandler`] per event type it reacts to. Handlers are only ever
//! invoked through the dedup gate.

use crate::entities::{FailureKind, OutboxRecord};
use crate::store::StoreError;
use async_trait::async_trait;
use courier_sdk::{EnvelopeError, EventEnvelope, IntegrationEvent, TransportMessage};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("payload does not match event type {event_type}: {source}")]
    MalformedPayload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
}

impl CatalogError {
    /// Catalog failures never heal on retry.
    pub fn kind(&self) -> FailureKind {
        FailureKind::Application
    }
}

type Resolver = fn(&OutboxRecord) -> Result<TransportMessage, CatalogError>;

fn resolve_as<E: IntegrationEvent>(record: &OutboxRecord) -> Result<TransportMessage, CatalogError> {
    let event: E = serde_json::from_value(record.payload.clone()).map_err(|source| {
        CatalogError::MalformedPayload {
            event_type: record.event_type.clone(),
            source,
        }
    })?;
    let envelope = EventEnvelope::from_parts(record.id, record.occurred_on, event);
    Ok(TransportMessage::from_envelope(&envelope)?)
}

/// Event types a module is allowed to publish.
#[derive(Default, Clone)]
pub struct EventCatalog {
    resolvers: HashMap<&'static str, Resolver>,
}

impl EventCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `E`. Registering the same type twice is a no-op.
    pub fn register<E: IntegrationEvent>(&mut self) -> &mut Self {
        self.resolvers.insert(E::EVENT_TYPE, resolve_as::<E>);
        self
    }

    pub fn with<E: IntegrationEvent>(mut self) -> Self {
        self.register::<E>();
        self
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.resolvers.contains_key(event_type)
    }

    pub fn event_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.resolvers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Deserialize the stored payload into its registered type and build the
    /// message to publish. `message_id` is the outbox record id.
    pub fn resolve(&self, record: &OutboxRecord) -> Result<TransportMessage, CatalogError> {
        let resolver = self
            .resolvers
            .get(record.event_type.as_str())
            .ok_or_else(|| CatalogError::UnknownEventType(record.event_type.clone()))?;
        resolver(record)
    }
}

impl fmt::Debug for EventCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCatalog")
            .field("event_types", &self.event_types())
            .finish()
    }
}

/// Error returned by an [`EventHandler`].
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Worth another delivery (lock timeout, downstream outage).
    #[error("{0}")]
    Retryable(String),

    /// Will fail the same way every time.
    #[error("{0}")]
    Permanent(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl HandlerError {
    pub fn retryable(reason: impl fmt::Display) -> Self {
        HandlerError::Retryable(reason.to_string())
    }

    pub fn permanent(reason: impl fmt::Display) -> Self {
        HandlerError::Permanent(reason.to_string())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            HandlerError::Permanent(_) => FailureKind::Application,
            HandlerError::Retryable(_) | HandlerError::Database(_) | HandlerError::Store(_) => {
                FailureKind::Infrastructure
            }
        }
    }
}

/// A module's reaction to one event type.
///
/// `Tx` is the inbox transaction of the module's store. Domain writes made
/// through it commit together with the inbox row, or not at all. Handlers
/// must be idempotent: a redelivery after a lost commit runs them again.
#[async_trait]
pub trait EventHandler<Tx: Send + 'static>: Send + Sync + 'static {
    type Event: IntegrationEvent;

    async fn handle(
        &self,
        envelope: EventEnvelope<Self::Event>,
        tx: &mut Tx,
    ) -> Result<(), HandlerError>;
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no handler registered for {0}")]
    Unhandled(String),

    #[error("undecodable message: {0}")]
    Decode(#[from] EnvelopeError),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

#[async_trait]
trait ErasedHandler<Tx>: Send + Sync {
    async fn dispatch(&self, message: &TransportMessage, tx: &mut Tx) -> Result<(), DispatchError>;
}

struct Typed<H>(H);

#[async_trait]
impl<Tx, H> ErasedHandler<Tx> for Typed<H>
where
    Tx: Send + 'static,
    H: EventHandler<Tx>,
{
    async fn dispatch(&self, message: &TransportMessage, tx: &mut Tx) -> Result<(), DispatchError> {
        let envelope = message.decode::<H::Event>()?;
        self.0.handle(envelope, tx).await?;
        Ok(())
    }
}

#[derive(Debug, Error)]
#[error("a handler for {0} is already registered")]
pub struct DuplicateHandler(pub &'static str);

/// Handlers of one module, at most one per event type.
pub struct HandlerRegistry<Tx> {
    handlers: HashMap<&'static str, Box<dyn ErasedHandler<Tx>>>,
}

impl<Tx: Send + 'static> HandlerRegistry<Tx> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<H: EventHandler<Tx>>(&mut self, handler: H) -> Result<&mut Self, DuplicateHandler> {
        let event_type = <H::Event as IntegrationEvent>::EVENT_TYPE;
        if self.handlers.contains_key(event_type) {
            return Err(DuplicateHandler(event_type));
        }
        self.handlers.insert(event_type, Box::new(Typed(handler)));
        Ok(self)
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn event_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub async fn dispatch(&self, message: &TransportMessage, tx: &mut Tx) -> Result<(), DispatchError> {
        let handler = self
            .handlers
            .get(message.event_type.as_str())
            .ok_or_else(|| DispatchError::Unhandled(message.event_type.clone()))?;
        handler.dispatch(message, tx).await
    }
}

impl<Tx: Send + 'static> Default for HandlerRegistry<Tx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Tx> fmt::Debug for HandlerRegistry<Tx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("event_types", &types)
            .finish()
    }
}
