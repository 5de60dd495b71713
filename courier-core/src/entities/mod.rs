pub mod inbox;
pub mod outbox;
pub mod schema;

pub use inbox::InboxRecord;
pub use outbox::{DeadLetterReason, DeadLetterRecord, OutboxRecord, OutboxWriter};
pub use schema::{ModuleSchema, SchemaNameError};

/// Classification of a failed delivery attempt.
///
/// Persisted on the outbox row as `is_infrastructure_failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Broker unreachable, timeout, connection reset. Expected to be transient.
    Infrastructure,
    /// Unresolvable event type, malformed payload, rejected business rule.
    /// Retrying does not help.
    Application,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Infrastructure)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Infrastructure => write!(f, "infrastructure"),
            FailureKind::Application => write!(f, "application"),
        }
    }
}
