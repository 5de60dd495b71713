//! Per-module database namespace.
//!
//! Every module owns a PostgreSQL schema holding its business tables and its
//! outbox, dead-letter and inbox tables, so that outbox/inbox writes can share
//! a transaction with business rows. Schema names cannot be bound as query
//! parameters, so they are validated once here and then interpolated.

use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use serde::{Deserialize, Serialize};

pub const OUTBOX_TABLE: &str = "outbox_messages";
pub const DEAD_LETTER_TABLE: &str = "outbox_dead_letters";
pub const INBOX_TABLE: &str = "inbox_messages";

const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaNameError {
    #[error("schema name is empty")]
    Empty,
    #[error("schema name {0:?} is longer than 63 bytes")]
    TooLong(String),
    #[error("schema name {0:?} must start with a lowercase letter")]
    InvalidStart(String),
    #[error("schema name {0:?} may only contain lowercase letters, digits and '_'")]
    InvalidCharacter(String),
}

/// A validated PostgreSQL schema name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleSchema(String);

impl ModuleSchema {
    pub fn new(name: impl Into<String>) -> Result<Self, SchemaNameError> {
        let name = name.into();
        let mut chars = name.chars();
        match chars.next() {
            None => return Err(SchemaNameError::Empty),
            Some(c) if !c.is_ascii_lowercase() => return Err(SchemaNameError::InvalidStart(name)),
            Some(_) => {}
        }
        if name.len() > MAX_IDENTIFIER_LEN {
            return Err(SchemaNameError::TooLong(name));
        }
        if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
            return Err(SchemaNameError::InvalidCharacter(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Schema-qualified, quoted table name, e.g. `"appraisal".outbox_messages`.
    pub fn table(&self, table: &str) -> String {
        format!("\"{}\".{}", self.0, table)
    }

    pub fn outbox_table(&self) -> String {
        self.table(OUTBOX_TABLE)
    }

    pub fn dead_letter_table(&self) -> String {
        self.table(DEAD_LETTER_TABLE)
    }

    pub fn inbox_table(&self) -> String {
        self.table(INBOX_TABLE)
    }

    fn ddl(&self) -> Vec<String> {
        let schema = &self.0;
        let outbox = self.outbox_table();
        let dead_letters = self.dead_letter_table();
        let inbox = self.inbox_table();
        vec![
            format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""),
            format!(
                "CREATE TABLE IF NOT EXISTS {outbox} (
                    id UUID PRIMARY KEY,
                    event_type TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    occurred_on TIMESTAMPTZ NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    max_retries INTEGER NOT NULL DEFAULT 3,
                    last_error TEXT,
                    is_infrastructure_failure BOOLEAN NOT NULL DEFAULT FALSE
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS outbox_messages_occurred_on_idx \
                 ON {outbox} (occurred_on, id)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {dead_letters} (
                    id UUID PRIMARY KEY,
                    event_type TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    occurred_on TIMESTAMPTZ NOT NULL,
                    retry_count INTEGER NOT NULL,
                    last_error TEXT,
                    is_infrastructure_failure BOOLEAN NOT NULL,
                    reason TEXT NOT NULL,
                    dead_lettered_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {inbox} (
                    id TEXT PRIMARY KEY,
                    event_type TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    occurred_on TIMESTAMPTZ NOT NULL,
                    received_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS inbox_messages_received_at_idx \
                 ON {inbox} (received_at)"
            ),
        ]
    }
}

impl TryFrom<String> for ModuleSchema {
    type Error = SchemaNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ModuleSchema> for String {
    fn from(value: ModuleSchema) -> Self {
        value.0
    }
}

impl std::fmt::Display for ModuleSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
/// Create the module schema with its outbox, dead-letter and inbox tables.
///
/// Every statement is idempotent, so running this on each startup is safe.
pub struct InstallModuleSchema;

impl Processor<InstallModuleSchema> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:InstallModuleSchema")]
    async fn process(&self, _cmd: InstallModuleSchema) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for statement in self.schema.ddl() {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
