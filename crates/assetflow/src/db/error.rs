//! Database error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from database operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating directories or files.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration failed to apply.
    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// A stored JSON column could not be encoded or decoded.
    #[error("Invalid JSON in column '{column}': {source}")]
    Json {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A stored enum column held an unknown value.
    #[error("Unknown {kind} '{value}'")]
    UnknownValue { kind: &'static str, value: String },

    /// A step transition the status lattice does not allow.
    #[error("Step {step_id} cannot move from {from} to {to}")]
    InvalidTransition {
        step_id: i64,
        from: &'static str,
        to: &'static str,
    },

    /// A step cannot start because its process was stopped.
    #[error("Process {process_id} is stopped")]
    ProcessStopped { process_id: i64 },

    /// The database lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,
}
