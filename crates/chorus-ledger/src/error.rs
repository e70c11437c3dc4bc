//! Error types for the ledger.

use thiserror::Error;

use crate::ActivityStatus;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// SQLite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Row not found.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Status change that would move an activity backwards.
    #[error("activity {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ActivityStatus,
        to: ActivityStatus,
    },

    /// A stored value could not be interpreted.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The connection mutex was poisoned by a panicking holder.
    #[error("database lock poisoned")]
    LockPoisoned,
}
