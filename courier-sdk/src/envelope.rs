//! Event envelope and transport message types.
//!
//! The logical envelope shape is:
//!
//! ```text
//! { "event_id": "<uuid v7>", "event_type": "<discriminator>",
//!   "occurred_on": "<rfc3339>", ...event specific fields }
//! ```
//!
//! Event-specific fields are flattened into the envelope so that consumers
//! written against the JSON shape do not need to know about the wrapper.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// A payload that can travel between modules.
///
/// `EVENT_TYPE` is the stable string discriminator stored in the outbox and
/// carried on the wire. It must never change once events of that type have
/// been published.
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const EVENT_TYPE: &'static str;
}

/// Errors produced while building or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: String },
}

/// Envelope wrapping an integration event with its identity and time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    pub event_id: Uuid,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_on: OffsetDateTime,
    #[serde(flatten)]
    pub event: E,
}

impl<E: IntegrationEvent> EventEnvelope<E> {
    /// Wrap `event` with a fresh time-ordered id and the current time.
    pub fn new(event: E) -> Self {
        Self::from_parts(Uuid::now_v7(), OffsetDateTime::now_utc(), event)
    }

    pub fn from_parts(event_id: Uuid, occurred_on: OffsetDateTime, event: E) -> Self {
        Self {
            event_id,
            event_type: E::EVENT_TYPE.to_string(),
            occurred_on,
            event,
        }
    }
}

/// A message as it crosses the broker boundary.
///
/// `message_id` is the deduplication key used by the consuming inbox. The
/// publisher always sets it to the outbox record id; it is optional because
/// messages injected into the broker by other tools may not carry one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub message_id: Option<String>,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_on: OffsetDateTime,
    pub body: serde_json::Value,
}

impl TransportMessage {
    pub fn from_envelope<E: IntegrationEvent>(
        envelope: &EventEnvelope<E>,
    ) -> Result<Self, EnvelopeError> {
        Ok(Self {
            message_id: Some(envelope.event_id.to_string()),
            event_type: envelope.event_type.clone(),
            occurred_on: envelope.occurred_on,
            body: serde_json::to_value(envelope)?,
        })
    }

    /// Decode the body into a typed envelope, checking the discriminator first.
    pub fn decode<E: IntegrationEvent>(&self) -> Result<EventEnvelope<E>, EnvelopeError> {
        if self.event_type != E::EVENT_TYPE {
            return Err(EnvelopeError::TypeMismatch {
                expected: E::EVENT_TYPE,
                found: self.event_type.clone(),
            });
        }
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RequestSubmitted;

    fn sample() -> EventEnvelope<RequestSubmitted> {
        EventEnvelope::from_parts(
            Uuid::now_v7(),
            time::macros::datetime!(2026-01-02 03:04:05 UTC),
            RequestSubmitted {
                request_id: Uuid::nil(),
                request_number: "REQ-0001".to_string(),
            },
        )
    }

    #[test]
    fn test_envelope_flattens_event_fields() {
        let envelope = sample();
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["event_type"], "RequestSubmitted");
        assert_eq!(value["request_number"], "REQ-0001");
        assert_eq!(value["occurred_on"], "2026-01-02T03:04:05Z");
        assert!(value.get("event").is_none());
    }

    #[test]
    fn test_transport_message_carries_event_id() {
        let envelope = sample();
        let message = TransportMessage::from_envelope(&envelope).unwrap();
        assert_eq!(message.message_id, Some(envelope.event_id.to_string()));
        let decoded: EventEnvelope<RequestSubmitted> = message.decode().unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_decode_rejects_other_event_type() {
        let mut message = TransportMessage::from_envelope(&sample()).unwrap();
        message.event_type = "DocumentUploaded".to_string();
        let err = message.decode::<RequestSubmitted>().unwrap_err();
        assert!(matches!(err, EnvelopeError::TypeMismatch { .. }));
    }
}
