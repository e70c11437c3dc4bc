//! Queue types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Largest doubling exponent applied by exponential backoff.
const MAX_BACKOFF_SHIFT: u32 = 20;

/// How long to wait before a failed job is attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Wait the same delay after every failure.
    Fixed { delay_ms: u64 },
    /// Double the delay after each failure, starting from `delay_ms`.
    Exponential { delay_ms: u64 },
}

impl Backoff {
    /// Delay before the next attempt, given how many attempts have been made so far.
    ///
    /// The first retry (after one attempt) waits the base delay.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { delay_ms } => {
                let shift = attempts_made.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
                Duration::from_millis(delay_ms.saturating_mul(1u64 << shift))
            }
        }
    }
}

/// Per-queue options applied to every job added to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    /// Delay policy between attempts.
    pub backoff: Backoff,
}

impl JobOptions {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }
}

/// How many finished jobs a queue keeps around for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_completed: usize,
    pub keep_dead: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_completed: 1000,
            keep_dead: 5000,
        }
    }
}

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for `run_at` (delayed or backing off).
    #[default]
    Waiting,
    /// Claimed by a worker.
    Active,
    /// Acknowledged successfully.
    Completed,
    /// Exhausted its attempts or failed unrecoverably; retained for inspection.
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "dead" => Some(JobState::Dead),
            _ => None,
        }
    }

    /// Whether the job can still be delivered to a worker.
    pub fn is_live(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Active)
    }
}

/// A job as stored in the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: String,
    /// Name of the queue this job belongs to.
    pub queue: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Attempts started so far (incremented on claim).
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl QueueJob {
    /// Check if this job may be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Waiting && self.run_at <= now
    }

    /// Whether another attempt is allowed after the current one.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// Decode the payload into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// A job to be added to a queue.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Caller-chosen id; a random one is assigned when absent.
    pub id: Option<String>,
    pub payload: serde_json::Value,
    /// How long after enqueue the job becomes claimable.
    pub delay: Duration,
}

impl NewJob {
    /// Build a job from a serializable payload.
    pub fn new<T: Serialize>(payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: None,
            payload: serde_json::to_value(payload)?,
            delay: Duration::ZERO,
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Why a job handler gave up on an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub message: String,
    /// When false the job is dead-lettered immediately, whatever its attempt budget.
    pub retryable: bool,
}

impl JobFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// What the broker did with a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Requeued; claimable again at `run_at`.
    Retrying { attempt: u32, run_at: DateTime<Utc> },
    /// Moved to the dead-letter set.
    DeadLettered { attempts: u32 },
}

/// Number of jobs per state in one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub dead: usize,
}
