//! Storage Layer - SQLite-backed persistence
//!
//! One connection per [`Database`], with tables:
//! - keyvalue(key, value) holding settings and the schema version
//! - one document table per record type: (id, search, json) plus an FTS5 index
//! - views(id, name) and view_locomotives(view_id, loco_id)

pub mod database;
pub mod schema;
pub mod settings;
pub mod statement;

pub use database::Database;
pub use settings::StoredValue;
pub use statement::{Params, Row, RunOutcome, Statement};

/// Owner of prepared statements that must be finalized before the connection closes
pub(crate) trait Release: Send + Sync {
    fn release(&self);

    fn is_released(&self) -> bool;
}

#[cfg(test)]
pub(crate) fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
