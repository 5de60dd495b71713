//! Courier SDK
//!
//! The broker-agnostic contract every module shares: the [`IntegrationEvent`]
//! trait implemented by event payloads, the [`EventEnvelope`] that carries
//! them, and the [`TransportMessage`] handed to and received from the broker.

#![forbid(unsafe_code)]

pub mod envelope;
pub mod events;

pub use envelope::{EnvelopeError, EventEnvelope, IntegrationEvent, TransportMessage};
