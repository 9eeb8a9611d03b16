//! Persistence for the inference gateway
//!
//! API keys, system prompts, admin users, and conversation history,
//! backed by embedded SQLite (schema-equivalent to the gateway's
//! document collections) with in-memory variants for tests and
//! ephemeral deployments.

pub mod sqlite;
pub mod keys;
pub mod history;
pub mod users;
pub mod memory;

pub use sqlite::Db;
pub use keys::{SqliteKeyStore, generate_token};
pub use history::SqliteHistoryStore;
pub use users::SqliteUserStore;
pub use memory::{MemoryKeyStore, MemoryHistoryStore};

use thiserror::Error;

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Blocking task failed: {0}")]
    Task(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Constraint(err.to_string())
            }
            _ => StoreError::Query(err.to_string()),
        }
    }
}
