//! Relay state shared by every module's workers.

use courier_core::broker::RedisBroker;
use courier_core::config::{BrokerSettings, ConfigStore, ModuleConfig, RelaySettings};
use courier_core::registry::EventCatalog;
use courier_core::store::{PgInboxStore, PgOutboxStore};
use courier_sdk::events::{
    AppraisalCreated, AssignmentCompleted, DocumentUploaded, RequestSubmitted,
};
use sqlx::PgPool;
use std::sync::Arc;

/// Every integration event this relay knows how to publish.
pub fn event_catalog() -> EventCatalog {
    EventCatalog::new()
        .with::<RequestSubmitted>()
        .with::<AppraisalCreated>()
        .with::<DocumentUploaded>()
        .with::<AssignmentCompleted>()
}

/// Cloneable handle to the shared resources. Everything is behind `Arc` or
/// already a shared handle.
#[derive(Clone)]
pub struct RelayState {
    /// Database connection pool.
    pub db: PgPool,
    /// Publishing connection, shared by all publishers.
    pub broker: RedisBroker,
    /// Consumers open their own connections from these.
    pub broker_settings: BrokerSettings,
    /// Runtime tunables (can be reloaded via SIGHUP).
    pub settings: ConfigStore<RelaySettings>,
    pub catalog: Arc<EventCatalog>,
}

impl RelayState {
    pub fn new(
        db: PgPool,
        broker: RedisBroker,
        broker_settings: BrokerSettings,
        settings: ConfigStore<RelaySettings>,
    ) -> Self {
        Self {
            db,
            broker,
            broker_settings,
            settings,
            catalog: Arc::new(event_catalog()),
        }
    }

    pub fn outbox_store(&self, module: &ModuleConfig) -> PgOutboxStore {
        PgOutboxStore::new(self.db.clone(), module.schema.clone())
    }

    pub fn inbox_store(&self, module: &ModuleConfig) -> PgInboxStore {
        PgInboxStore::new(self.db.clone(), module.schema.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_sdk::IntegrationEvent;

    #[test]
    fn test_catalog_covers_every_event() {
        let catalog = event_catalog();
        for event_type in [
            RequestSubmitted::EVENT_TYPE,
            AppraisalCreated::EVENT_TYPE,
            DocumentUploaded::EVENT_TYPE,
            AssignmentCompleted::EVENT_TYPE,
        ] {
            assert!(catalog.contains(event_type), "{event_type} missing");
        }
        assert_eq!(catalog.event_types().len(), 4);
    }
}
