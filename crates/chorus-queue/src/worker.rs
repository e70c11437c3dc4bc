//! Worker pool that drains a queue with bounded concurrency.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::{FailOutcome, JobFailure, JobQueue, QueueError, QueueJob};

/// Minimum sleep between polls when the queue is idle.
const MIN_POLL: Duration = Duration::from_millis(250);

/// Maximum sleep between polls when the queue is idle.
const MAX_POLL: Duration = Duration::from_secs(5);

/// Default age of an active claim after which a starting pool takes it back.
///
/// Must exceed the longest job; a repost is bounded by its browser timeouts.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Type alias for the job handler function.
pub type JobHandler = Arc<
    dyn Fn(QueueJob) -> Pin<Box<dyn Future<Output = Result<(), JobFailure>> + Send>>
        + Send
        + Sync,
>;

/// What happened to a single claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed { job_id: String },
    Failed { job_id: String, outcome: FailOutcome },
}

/// A pool of workers consuming one queue.
pub struct WorkerPool {
    queue: JobQueue,
    concurrency: usize,
    stall_timeout: Duration,
}

impl WorkerPool {
    /// Create a pool; concurrency is clamped to at least one.
    pub fn new(queue: JobQueue, concurrency: usize) -> Self {
        Self {
            queue,
            concurrency: concurrency.max(1),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Claim and run one due job, if any.
    pub async fn process_one(
        queue: &JobQueue,
        handler: &JobHandler,
    ) -> Result<Option<ProcessOutcome>, QueueError> {
        let Some(job) = queue.claim_next().await? else {
            return Ok(None);
        };

        let job_id = job.id.clone();
        debug!(queue = %queue.name(), job_id = %job_id, attempt = job.attempts_made, "processing job");

        match handler(job).await {
            Ok(()) => {
                queue.complete(&job_id).await?;
                Ok(Some(ProcessOutcome::Completed { job_id }))
            }
            Err(failure) => {
                let outcome = queue.fail(&job_id, &failure).await?;
                Ok(Some(ProcessOutcome::Failed { job_id, outcome }))
            }
        }
    }

    /// Recover stalled jobs, then spawn `concurrency` workers.
    ///
    /// Each worker finishes its in-flight job before honoring shutdown.
    pub async fn start(
        self,
        shutdown_rx: watch::Receiver<bool>,
        handler: JobHandler,
    ) -> Result<Vec<JoinHandle<()>>, QueueError> {
        self.queue.recover_stalled(self.stall_timeout).await?;
        info!(queue = %self.queue.name(), concurrency = self.concurrency, "worker pool starting");

        let mut handles = Vec::with_capacity(self.concurrency);
        for worker_id in 0..self.concurrency {
            let queue = self.queue.clone();
            let handler = Arc::clone(&handler);
            let shutdown_rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                run_worker(worker_id, queue, handler, shutdown_rx).await;
            }));
        }
        Ok(handles)
    }
}

async fn run_worker(
    worker_id: usize,
    queue: JobQueue,
    handler: JobHandler,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(worker_id, queue = %queue.name(), "worker started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match WorkerPool::process_one(&queue, &handler).await {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => error!(worker_id, queue = %queue.name(), error = %e, "queue operation failed"),
        }

        let idle = idle_duration(&queue).await;
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // Sender gone means nobody can ask us to stop; treat as shutdown
                if changed.is_err() {
                    break;
                }
            }
            _ = sleep(idle) => {}
        }
    }

    info!(worker_id, queue = %queue.name(), "worker stopped");
}

/// How long to sleep until the next waiting job is due, within poll bounds.
async fn idle_duration(queue: &JobQueue) -> Duration {
    let next = match queue.next_run_at().await {
        Ok(next) => next,
        Err(e) => {
            error!(queue = %queue.name(), error = %e, "failed to read next run time");
            None
        }
    };

    match next {
        Some(at) => (at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .clamp(MIN_POLL, MAX_POLL),
        None => MAX_POLL,
    }
}
