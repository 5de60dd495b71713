use crate::entities::ModuleSchema;
use sqlx::PgPool;

/// Executes SQL commands against one module's namespace.
///
/// Commands are plain structs with a `Processor<Command>` impl next to the
/// entity they operate on.
#[derive(Clone)]
pub struct DatabaseProcessor {
    pub pool: PgPool,
    pub schema: ModuleSchema,
}

impl DatabaseProcessor {
    pub fn new(pool: PgPool, schema: ModuleSchema) -> Self {
        Self { pool, schema }
    }
}
