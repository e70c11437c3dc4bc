//! Durable job queue for chorus.
//!
//! This crate provides a persistent, named job queue that:
//! - Stores jobs in SQLite so they survive crashes and restarts
//! - Supports single and bulk enqueue with a per-job delay
//! - Hands out jobs through an atomic claim, safe across worker processes
//! - Requeues failed jobs with exponential or fixed backoff up to `max_attempts`
//! - Retains exhausted jobs in a dead-letter set instead of discarding them
//! - Bounds how many completed and dead-lettered jobs are kept for audit

mod broker;
mod error;
mod types;
mod worker;

pub use broker::{JobQueue, JobSink, QueueBroker};
pub use error::QueueError;
pub use types::{
    Backoff, FailOutcome, JobFailure, JobOptions, JobState, NewJob, QueueCounts, QueueJob,
    RetentionPolicy,
};
pub use worker::{DEFAULT_STALL_TIMEOUT, JobHandler, ProcessOutcome, WorkerPool};
