//! SQLite-backed queue broker.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info, warn};

use crate::{
    Backoff, FailOutcome, JobFailure, JobOptions, JobState, NewJob, QueueCounts, QueueError,
    QueueJob, RetentionPolicy,
};

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str = "id, queue, payload, state, attempts_made, max_attempts, backoff, \
                           run_at, last_error, created_at, finished_at";

/// Owner of the broker connection.
///
/// Open one per process with [`QueueBroker::open`], hand out [`JobQueue`]
/// handles with [`QueueBroker::queue`], and call [`QueueBroker::shutdown`]
/// once every worker has stopped.
pub struct QueueBroker {
    conn: Arc<Mutex<Connection>>,
}

impl QueueBroker {
    /// Open or create the broker database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        // WAL lets several worker processes share the file
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let broker = Self::init(conn)?;
        info!(path = %path.display(), "queue broker opened");
        Ok(broker)
    }

    /// Open a private in-memory broker.
    pub fn open_in_memory() -> Result<Self, QueueError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, QueueError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS queue_jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts_made INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                backoff TEXT NOT NULL,
                run_at INTEGER NOT NULL,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_queue_jobs_due ON queue_jobs(queue, state, run_at);
            CREATE INDEX IF NOT EXISTS idx_queue_jobs_id ON queue_jobs(queue, id);
            -- An id has at most one live job; dead rows for it stay as history
            CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_jobs_live
                ON queue_jobs(queue, id) WHERE state IN ('waiting', 'active');
            ",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Get a handle to the named queue with the default retention policy.
    pub fn queue(&self, name: &str, options: JobOptions) -> Result<JobQueue, QueueError> {
        self.queue_with_retention(name, options, RetentionPolicy::default())
    }

    /// Get a handle to the named queue.
    pub fn queue_with_retention(
        &self,
        name: &str,
        options: JobOptions,
        retention: RetentionPolicy,
    ) -> Result<JobQueue, QueueError> {
        if name.is_empty() {
            return Err(QueueError::InvalidConfig("queue name is empty".to_string()));
        }
        if options.max_attempts == 0 {
            return Err(QueueError::InvalidConfig(format!(
                "queue {} must allow at least one attempt",
                name
            )));
        }

        Ok(JobQueue {
            conn: Arc::clone(&self.conn),
            name: name.to_string(),
            options,
            retention,
        })
    }

    /// Flush the write-ahead log and release the connection.
    pub fn shutdown(self) -> Result<(), QueueError> {
        let conn = self.conn.lock().map_err(|_| QueueError::LockPoisoned)?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        info!("queue broker shut down");
        Ok(())
    }
}

/// Destination for new jobs, as seen by producers.
#[async_trait]
pub trait JobSink: Send + Sync {
    /// Add all jobs or none of them. Returns the assigned ids in order.
    async fn add_bulk(&self, jobs: Vec<NewJob>) -> Result<Vec<String>, QueueError>;

    /// Whether a waiting or active job with this id exists.
    async fn has_live_job(&self, id: &str) -> Result<bool, QueueError>;

    /// The most recent job with this id, in any state.
    async fn latest_job(&self, id: &str) -> Result<Option<QueueJob>, QueueError>;
}

/// Handle to one named queue.
#[derive(Clone)]
pub struct JobQueue {
    conn: Arc<Mutex<Connection>>,
    name: String,
    options: JobOptions,
    retention: RetentionPolicy,
}

impl JobQueue {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> JobOptions {
        self.options
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.conn.lock().map_err(|_| QueueError::LockPoisoned)
    }

    /// Add a single job. Returns its id.
    pub async fn add(&self, job: NewJob) -> Result<String, QueueError> {
        let mut ids = self.add_bulk(vec![job]).await?;
        ids.pop()
            .ok_or_else(|| QueueError::Corrupt("bulk insert returned no id".to_string()))
    }

    /// Add jobs at `now`, all or nothing.
    pub fn add_bulk_at(
        &self,
        jobs: Vec<NewJob>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, QueueError> {
        let backoff = serde_json::to_string(&self.options.backoff)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(jobs.len());

        for job in jobs {
            let id = job.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let delay = chrono::Duration::from_std(job.delay)
                .map_err(|_| QueueError::InvalidConfig(format!("delay too large for {}", id)))?;

            let live: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM queue_jobs
                 WHERE queue = ?1 AND id = ?2 AND state IN ('waiting', 'active'))",
                params![self.name, id],
                |row| row.get(0),
            )?;
            if live {
                return Err(QueueError::JobExists(id));
            }
            // Completed runs give their id back; dead-lettered runs are kept
            tx.execute(
                "DELETE FROM queue_jobs WHERE queue = ?1 AND id = ?2 AND state = 'completed'",
                params![self.name, id],
            )?;

            tx.execute(
                "INSERT INTO queue_jobs
                    (id, queue, payload, state, attempts_made, max_attempts, backoff, run_at, created_at)
                 VALUES (?1, ?2, ?3, 'waiting', 0, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    self.name,
                    serde_json::to_string(&job.payload)?,
                    self.options.max_attempts,
                    backoff,
                    (now + delay).timestamp_millis(),
                    now.timestamp_millis(),
                ],
            )?;
            debug!(queue = %self.name, job_id = %id, delay_ms = job.delay.as_millis() as u64, "job enqueued");
            ids.push(id);
        }

        tx.commit()?;
        Ok(ids)
    }

    /// Claim the next due job, if any.
    pub async fn claim_next(&self) -> Result<Option<QueueJob>, QueueError> {
        self.claim_due(Utc::now())
    }

    /// Atomically claim the oldest job due at `now` and mark it active.
    ///
    /// The claim is a single UPDATE, so two workers (even in different
    /// processes) can never receive the same job.
    pub fn claim_due(&self, now: DateTime<Utc>) -> Result<Option<QueueJob>, QueueError> {
        let conn = self.lock()?;
        let sql = format!(
            "UPDATE queue_jobs
             SET state = 'active', attempts_made = attempts_made + 1, started_at = ?3
             WHERE seq = (
                 SELECT seq FROM queue_jobs
                 WHERE queue = ?1 AND state = 'waiting' AND run_at <= ?2
                 ORDER BY run_at, seq
                 LIMIT 1
             )
             RETURNING {}",
            JOB_COLUMNS
        );
        let raw = conn
            .query_row(
                &sql,
                params![self.name, now.timestamp_millis(), now.timestamp_millis()],
                RawJob::from_row,
            )
            .optional()?;
        raw.map(QueueJob::try_from).transpose()
    }

    /// Acknowledge a successful attempt.
    pub async fn complete(&self, id: &str) -> Result<(), QueueError> {
        let now = Utc::now();
        {
            let conn = self.lock()?;
            let updated = conn.execute(
                "UPDATE queue_jobs SET state = 'completed', finished_at = ?3, last_error = NULL
                 WHERE queue = ?1 AND id = ?2 AND state = 'active'",
                params![self.name, id, now.timestamp_millis()],
            )?;
            if updated == 0 {
                return Err(QueueError::JobNotFound(id.to_string()));
            }
        }
        self.prune()?;
        Ok(())
    }

    /// Record a failed attempt and decide between retry and dead-lettering.
    pub async fn fail(&self, id: &str, failure: &JobFailure) -> Result<FailOutcome, QueueError> {
        self.fail_at(id, failure, Utc::now())
    }

    /// Record a failed attempt as of `now`.
    pub fn fail_at(
        &self,
        id: &str,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError> {
        let outcome = {
            let conn = self.lock()?;
            let job = fetch_latest(&conn, &self.name, id)?
                .filter(|j| j.state == JobState::Active)
                .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;

            let (outcome, updated) = if failure.retryable && job.has_attempts_left() {
                let delay = chrono::Duration::from_std(job.backoff.delay_for(job.attempts_made))
                    .map_err(|_| {
                        QueueError::InvalidConfig(format!("backoff too large for {}", id))
                    })?;
                let run_at = now + delay;
                let updated = conn.execute(
                    "UPDATE queue_jobs SET state = 'waiting', run_at = ?3, last_error = ?4
                     WHERE queue = ?1 AND id = ?2 AND state = 'active'",
                    params![self.name, id, run_at.timestamp_millis(), failure.message],
                )?;
                let outcome = FailOutcome::Retrying {
                    attempt: job.attempts_made + 1,
                    run_at,
                };
                (outcome, updated)
            } else {
                let updated = conn.execute(
                    "UPDATE queue_jobs SET state = 'dead', finished_at = ?3, last_error = ?4
                     WHERE queue = ?1 AND id = ?2 AND state = 'active'",
                    params![self.name, id, now.timestamp_millis(), failure.message],
                )?;
                let outcome = FailOutcome::DeadLettered {
                    attempts: job.attempts_made,
                };
                (outcome, updated)
            };
            if updated == 0 {
                return Err(QueueError::JobNotFound(id.to_string()));
            }
            outcome
        };
        if matches!(outcome, FailOutcome::DeadLettered { .. }) {
            self.prune()?;
        }

        match &outcome {
            FailOutcome::Retrying { attempt, run_at } => warn!(
                queue = %self.name,
                job_id = %id,
                next_attempt = attempt,
                run_at = %run_at,
                error = %failure.message,
                "job failed, scheduled retry"
            ),
            FailOutcome::DeadLettered { attempts } => warn!(
                queue = %self.name,
                job_id = %id,
                attempts,
                retryable = failure.retryable,
                error = %failure.message,
                "job dead-lettered"
            ),
        }
        Ok(outcome)
    }

    /// Return jobs left active by a stopped worker to the waiting set.
    ///
    /// Only claims older than `older_than` are touched, so a live worker in
    /// another process keeps its job. A stalled attempt still counts; jobs with
    /// no attempts left are dead-lettered.
    pub async fn recover_stalled(&self, older_than: Duration) -> Result<usize, QueueError> {
        self.recover_stalled_at(older_than, Utc::now())
    }

    /// Recover stalled jobs as of `now`.
    pub fn recover_stalled_at(
        &self,
        older_than: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, QueueError> {
        let lease = chrono::Duration::from_std(older_than)
            .map_err(|_| QueueError::InvalidConfig("stall timeout too large".to_string()))?;
        let cutoff = (now - lease).timestamp_millis();
        let now = now.timestamp_millis();

        let conn = self.lock()?;
        let requeued = conn.execute(
            "UPDATE queue_jobs SET state = 'waiting', run_at = ?2
             WHERE queue = ?1 AND state = 'active' AND started_at <= ?3
               AND attempts_made < max_attempts",
            params![self.name, now, cutoff],
        )?;
        let dead = conn.execute(
            "UPDATE queue_jobs
             SET state = 'dead', finished_at = ?2,
                 last_error = COALESCE(last_error, 'stalled: worker stopped mid-attempt')
             WHERE queue = ?1 AND state = 'active' AND started_at <= ?3",
            params![self.name, now, cutoff],
        )?;
        if requeued + dead > 0 {
            info!(queue = %self.name, requeued, dead, "recovered stalled jobs");
        }
        Ok(requeued + dead)
    }

    /// Get the most recent job with this id.
    pub async fn get(&self, id: &str) -> Result<Option<QueueJob>, QueueError> {
        self.get_sync(id)
    }

    fn get_sync(&self, id: &str) -> Result<Option<QueueJob>, QueueError> {
        let conn = self.lock()?;
        fetch_latest(&conn, &self.name, id)
    }

    /// List dead-lettered jobs, most recent first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<QueueJob>, QueueError> {
        self.list_in_state(JobState::Dead, limit)
    }

    /// List jobs in a state, most recently touched first.
    pub fn list_in_state(&self, state: JobState, limit: usize) -> Result<Vec<QueueJob>, QueueError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM queue_jobs WHERE queue = ?1 AND state = ?2
             ORDER BY COALESCE(finished_at, run_at) DESC, seq DESC LIMIT ?3",
            JOB_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![self.name, state.as_str(), limit as i64],
            RawJob::from_row,
        )?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(QueueJob::try_from(row?)?);
        }
        Ok(jobs)
    }

    /// Count jobs per state.
    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM queue_jobs WHERE queue = ?1 GROUP BY state")?;
        let rows = stmt.query_map(params![self.name], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let (state, n) = row?;
            let n = n as usize;
            match JobState::parse(&state) {
                Some(JobState::Waiting) => counts.waiting = n,
                Some(JobState::Active) => counts.active = n,
                Some(JobState::Completed) => counts.completed = n,
                Some(JobState::Dead) => counts.dead = n,
                None => return Err(QueueError::Corrupt(format!("unknown state {}", state))),
            }
        }
        Ok(counts)
    }

    /// Earliest `run_at` among waiting jobs.
    pub async fn next_run_at(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
        let conn = self.lock()?;
        let ms: Option<i64> = conn.query_row(
            "SELECT MIN(run_at) FROM queue_jobs WHERE queue = ?1 AND state = 'waiting'",
            params![self.name],
            |row| row.get(0),
        )?;
        ms.map(from_millis).transpose()
    }

    /// Drop the oldest finished jobs beyond the retention limits.
    pub fn prune(&self) -> Result<usize, QueueError> {
        let conn = self.lock()?;
        let mut removed = 0;
        for (state, keep) in [
            (JobState::Completed, self.retention.keep_completed),
            (JobState::Dead, self.retention.keep_dead),
        ] {
            removed += conn.execute(
                "DELETE FROM queue_jobs WHERE queue = ?1 AND state = ?2 AND seq NOT IN (
                     SELECT seq FROM queue_jobs WHERE queue = ?1 AND state = ?2
                     ORDER BY finished_at DESC, seq DESC LIMIT ?3
                 )",
                params![self.name, state.as_str(), keep as i64],
            )?;
        }
        if removed > 0 {
            debug!(queue = %self.name, removed, "pruned finished jobs");
        }
        Ok(removed)
    }
}

#[async_trait]
impl JobSink for JobQueue {
    async fn add_bulk(&self, jobs: Vec<NewJob>) -> Result<Vec<String>, QueueError> {
        self.add_bulk_at(jobs, Utc::now())
    }

    async fn has_live_job(&self, id: &str) -> Result<bool, QueueError> {
        Ok(self.get_sync(id)?.is_some_and(|j| j.state.is_live()))
    }

    async fn latest_job(&self, id: &str) -> Result<Option<QueueJob>, QueueError> {
        self.get_sync(id)
    }
}

/// Latest row for `id`; a live run is always newer than any dead one.
fn fetch_latest(conn: &Connection, queue: &str, id: &str) -> Result<Option<QueueJob>, QueueError> {
    let sql = format!(
        "SELECT {} FROM queue_jobs WHERE queue = ?1 AND id = ?2 ORDER BY seq DESC LIMIT 1",
        JOB_COLUMNS
    );
    let raw = conn
        .query_row(&sql, params![queue, id], RawJob::from_row)
        .optional()?;
    raw.map(QueueJob::try_from).transpose()
}

/// Row as stored, before interpretation.
struct RawJob {
    id: String,
    queue: String,
    payload: String,
    state: String,
    attempts_made: u32,
    max_attempts: u32,
    backoff: String,
    run_at: i64,
    last_error: Option<String>,
    created_at: i64,
    finished_at: Option<i64>,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            queue: row.get(1)?,
            payload: row.get(2)?,
            state: row.get(3)?,
            attempts_made: row.get(4)?,
            max_attempts: row.get(5)?,
            backoff: row.get(6)?,
            run_at: row.get(7)?,
            last_error: row.get(8)?,
            created_at: row.get(9)?,
            finished_at: row.get(10)?,
        })
    }
}

impl TryFrom<RawJob> for QueueJob {
    type Error = QueueError;

    fn try_from(raw: RawJob) -> Result<Self, Self::Error> {
        let state = JobState::parse(&raw.state)
            .ok_or_else(|| QueueError::Corrupt(format!("job {} has state {}", raw.id, raw.state)))?;
        let backoff: Backoff = serde_json::from_str(&raw.backoff)?;
        Ok(QueueJob {
            payload: serde_json::from_str(&raw.payload)?,
            state,
            attempts_made: raw.attempts_made,
            max_attempts: raw.max_attempts,
            backoff,
            run_at: from_millis(raw.run_at)?,
            last_error: raw.last_error,
            created_at: from_millis(raw.created_at)?,
            finished_at: raw.finished_at.map(from_millis).transpose()?,
            id: raw.id,
            queue: raw.queue,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::Corrupt(format!("timestamp out of range: {}", ms)))
}
