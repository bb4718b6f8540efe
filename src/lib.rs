//! # Locostore - embedded document store
//!
//! Single-connection SQLite persistence for a device-control application.
//!
//! Locostore provides:
//! - A connection manager that negotiates the schema version on open
//! - Reusable asynchronous prepared statements
//! - A generic JSON-document repository with full-text search
//! - Named membership views over a junction table

pub mod config;
pub mod locomotive;
pub mod repository;
pub mod storage;
pub mod view;

// Re-exports for convenient access
pub use config::StoreConfig;
pub use locomotive::Locomotive;
pub use repository::{Record, Repository, Table};
pub use storage::{Database, Row, RunOutcome, Statement, StoredValue};
pub use view::View;

use std::path::PathBuf;

/// Result type alias for Locostore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Locostore operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cannot open database at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Backup to {path} failed: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported schema version {found} (this build supports up to {supported})")]
    UnsupportedSchema { found: i64, supported: i64 },

    #[error("No migration script for schema version {0}")]
    MissingMigration(i64),

    #[error("Failed to prepare `{sql}`: {source}")]
    Prepare {
        sql: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("No such record: {0}")]
    NoSuchRecord(i64),

    #[error("Record has no id")]
    MissingId,

    #[error("View not found: {0}")]
    ViewNotFound(String),

    #[error("Database already closed")]
    Closed,

    #[error("Statement already released")]
    StatementReleased,

    #[error("Table {0} is registered to a different record type")]
    RegistryConflict(&'static str),
}

impl Error {
    /// True when the engine rejected a write because of a unique or foreign-key constraint
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Error::Storage(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}
