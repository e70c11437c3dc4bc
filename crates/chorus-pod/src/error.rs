//! Error types for amplification.

use chorus_ledger::LedgerError;
use chorus_queue::QueueError;
use thiserror::Error;

/// Why a dispatch did not fully go through.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The trigger itself is unusable.
    #[error("invalid amplification request: {0}")]
    InvalidRequest(String),

    /// Reading pod membership failed. Nothing was written.
    #[error("failed to load pod members: {0}")]
    Membership(#[source] LedgerError),

    /// Inserting activity rows failed. Nothing was enqueued.
    #[error("failed to record activities: {0}")]
    Persistence(#[source] LedgerError),

    /// Activity rows exist but their jobs could not be enqueued; they stay
    /// `queued` until the reconciliation sweep picks them up.
    #[error("recorded {activities} activities but failed to enqueue their jobs: {source}")]
    Enqueue {
        activities: usize,
        #[source]
        source: QueueError,
    },
}

impl DispatchError {
    /// Whether re-running the same dispatch is safe and could succeed.
    ///
    /// Only failures that happen before any row is written qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Membership(_) | DispatchError::Persistence(_)
        )
    }
}

/// Errors from a reconciliation sweep.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("failed to encode repost job: {0}")]
    Payload(#[from] serde_json::Error),
}
