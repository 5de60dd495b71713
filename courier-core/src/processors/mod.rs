//! Relay processors.
//!
//! Per module, the server runs:
//!
//! - `PollScheduler`: drives the `OutboxPublisher` on an adaptive interval
//! - `CronPublishJob`: drives the `OutboxPublisher` on a cron schedule
//! - `InboundConsumer`: reads the broker and runs each delivery through the
//!   module's `DedupGate`
//! - `InboxRetentionJob`: purges expired inbox rows
//!
//! Every long-running processor takes a `watch::Receiver<bool>` and returns
//! once it flips to `true`.

pub mod cron_publisher;
pub mod dedup_gate;
pub mod inbound_consumer;
pub mod inbox_retention;
pub mod outbox_publisher;
pub mod poll_scheduler;

pub use cron_publisher::CronPublishJob;
pub use dedup_gate::{DedupGate, GateOutcome};
pub use inbound_consumer::{ConsumerError, InboundConsumer};
pub use inbox_retention::{InboxRetentionJob, RetentionError};
pub use outbox_publisher::{OutboxPublisher, PublishError, PublishReport};
pub use poll_scheduler::PollScheduler;
