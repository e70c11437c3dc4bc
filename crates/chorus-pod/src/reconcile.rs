//! Sweep for activities the queue lost track of.

use std::sync::Arc;
use std::time::Duration;

use chorus_ledger::{LedgerError, PodStore};
use chorus_queue::{JobSink, JobState, NewJob};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::{ReconcileError, RepostJob, StaggerPolicy};

/// What one sweep found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Activities `queued` for longer than the staleness threshold.
    pub stale: usize,
    /// Stale activities that still had a live job and were left alone.
    pub with_live_job: usize,
    /// Stale activities whose member no longer exists.
    pub orphaned: usize,
    /// Jobs enqueued by this sweep.
    pub requeued: usize,
    /// `processing` activities whose job was dead-lettered, now marked `failed`.
    pub abandoned: usize,
}

/// Re-enqueues stale `queued` activities that have no live repost job, and
/// fails stale `processing` activities whose job ended up dead-lettered
/// without reporting back (a worker that died on its last attempt).
///
/// It never replays `failed` rows.
pub struct Reconciler {
    store: Arc<dyn PodStore>,
    repost_queue: Arc<dyn JobSink>,
    stagger: StaggerPolicy,
    stale_after: Duration,
}

impl Reconciler {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);
    pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(900);

    pub fn new(
        store: Arc<dyn PodStore>,
        repost_queue: Arc<dyn JobSink>,
        stagger: StaggerPolicy,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            repost_queue,
            stagger,
            stale_after,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, ReconcileError> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as of `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, ReconcileError> {
        let cutoff = now
            - chrono::Duration::from_std(self.stale_after)
                .unwrap_or_else(|_| chrono::Duration::days(1));
        let mut report = SweepReport {
            abandoned: self.fail_abandoned(cutoff).await?,
            ..Default::default()
        };

        let stale = self.store.stale_queued(cutoff).await?;
        report.stale = stale.len();
        let mut payloads = Vec::new();
        for activity in stale {
            if self.repost_queue.has_live_job(&activity.id).await? {
                report.with_live_job += 1;
                continue;
            }
            let Some(member) = self.store.get_member(&activity.member_id).await? else {
                warn!(activity_id = %activity.id, member_id = %activity.member_id, "stale activity has no member");
                report.orphaned += 1;
                continue;
            };
            payloads.push(RepostJob {
                activity_id: activity.id,
                member_id: member.id,
                target_url: activity.target_url,
                account_credential_ref: member.account_ref,
            });
        }

        if payloads.is_empty() {
            if report.abandoned > 0 {
                info!(abandoned = report.abandoned, "reconciliation sweep failed abandoned activities");
            }
            return Ok(report);
        }

        let delays = self.stagger.schedule(payloads.len());
        let jobs = payloads
            .iter()
            .zip(delays)
            .map(|(payload, delay)| {
                NewJob::new(payload).map(|job| job.with_id(&payload.activity_id).with_delay(delay))
            })
            .collect::<Result<Vec<_>, _>>()?;
        report.requeued = self.repost_queue.add_bulk(jobs).await?.len();

        info!(
            stale = report.stale,
            requeued = report.requeued,
            with_live_job = report.with_live_job,
            abandoned = report.abandoned,
            "reconciliation sweep re-enqueued stale activities"
        );
        Ok(report)
    }

    /// Mark `failed` every stale `processing` activity whose latest job is dead.
    async fn fail_abandoned(&self, cutoff: DateTime<Utc>) -> Result<usize, ReconcileError> {
        let mut failed = 0;
        for activity in self.store.stale_processing(cutoff).await? {
            let Some(job) = self.repost_queue.latest_job(&activity.id).await? else {
                continue;
            };
            if job.state != JobState::Dead {
                continue;
            }
            let error = format!(
                "dead-lettered after {} attempts: {}",
                job.attempts_made,
                job.last_error.as_deref().unwrap_or("retry budget exhausted")
            );
            match self.store.mark_failed(&activity.id, &error).await {
                Ok(_) => {
                    warn!(activity_id = %activity.id, error = %error, "abandoned activity marked failed");
                    failed += 1;
                }
                // A worker got there first
                Err(LedgerError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(failed)
    }

    /// Sweep every `interval` until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            stale_after_secs = self.stale_after.as_secs(),
            "reconciler started"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "reconciliation sweep failed");
                    }
                }
            }
        }
        info!("reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_ledger::{ActivityKind, ActivityStatus, NewActivity, OnboardingStatus, SqliteStore};
    use chorus_queue::{JobQueue, QueueBroker};
    use pretty_assertions::assert_eq;

    use crate::{REPOST_QUEUE, repost_queue_options};

    async fn setup(rows: usize) -> (Arc<SqliteStore>, QueueBroker, JobQueue, Vec<String>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let pod = store.create_pod("t", "p").unwrap();
        let member = store
            .add_member(&pod.id, "u", "acc-1", true, OnboardingStatus::Complete)
            .unwrap();
        let activities = store
            .insert_activities(
                (0..rows)
                    .map(|_| NewActivity {
                        pod_id: pod.id.clone(),
                        post_id: "post".to_string(),
                        member_id: member.id.clone(),
                        dispatch_id: uuid::Uuid::new_v4().to_string(),
                        kind: ActivityKind::Repost,
                        target_url: "https://example.com/p".to_string(),
                    })
                    .collect(),
            )
            .await
            .unwrap();
        let broker = QueueBroker::open_in_memory().unwrap();
        let queue = broker.queue(REPOST_QUEUE, repost_queue_options()).unwrap();
        let ids = activities.into_iter().map(|a| a.id).collect();
        (store, broker, queue, ids)
    }

    fn reconciler(store: &Arc<SqliteStore>, queue: &JobQueue) -> Reconciler {
        Reconciler::new(
            store.clone(),
            Arc::new(queue.clone()),
            StaggerPolicy::default(),
            Duration::from_secs(900),
        )
    }

    #[tokio::test]
    async fn test_fresh_activities_left_alone() {
        let (store, _broker, queue, _) = setup(2).await;
        let report = reconciler(&store, &queue).sweep().await.unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn test_stale_without_job_requeued() {
        let (store, _broker, queue, ids) = setup(3).await;
        // One activity still has its job
        queue
            .add(NewJob::new(&1).unwrap().with_id(&ids[0]))
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(901);
        let report = reconciler(&store, &queue).sweep_at(later).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                stale: 3,
                with_live_job: 1,
                orphaned: 0,
                requeued: 2,
                abandoned: 0,
            }
        );
        assert!(queue.has_live_job(&ids[1]).await.unwrap());
        assert!(queue.has_live_job(&ids[2]).await.unwrap());

        let job = queue.get(&ids[1]).await.unwrap().unwrap();
        let payload: RepostJob = job.decode().unwrap();
        assert_eq!(payload.account_credential_ref, "acc-1");

        // Second sweep sees live jobs for everything
        let again = reconciler(&store, &queue).sweep_at(later).await.unwrap();
        assert_eq!(again.requeued, 0);
        assert_eq!(again.with_live_job, 3);
    }

    #[tokio::test]
    async fn test_sweep_never_touches_status() {
        let (store, _broker, queue, ids) = setup(1).await;
        store.mark_processing(&ids[0]).await.unwrap();
        store.mark_failed(&ids[0], "boom").await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(901);
        let report = reconciler(&store, &queue).sweep_at(later).await.unwrap();
        assert_eq!(report.stale, 0);
        assert_eq!(queue.counts().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_processing_with_dead_job_marked_failed() {
        let (store, _broker, queue, ids) = setup(2).await;
        for id in &ids {
            queue.add(NewJob::new(&1).unwrap().with_id(id)).await.unwrap();
            queue.claim_next().await.unwrap().unwrap();
            store.mark_processing(id).await.unwrap();
        }
        // First job is dead, second is still running
        queue
            .fail(&ids[0], &chorus_queue::JobFailure::fatal("stalled"))
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(901);
        let report = reconciler(&store, &queue).sweep_at(later).await.unwrap();
        assert_eq!(report.abandoned, 1);

        let failed = store.get_activity(&ids[0]).await.unwrap().unwrap();
        assert_eq!(failed.status, ActivityStatus::Failed);
        assert!(failed.error.unwrap().contains("stalled"));
        let running = store.get_activity(&ids[1]).await.unwrap().unwrap();
        assert_eq!(running.status, ActivityStatus::Processing);

        // Already failed rows are not touched again
        let again = reconciler(&store, &queue).sweep_at(later).await.unwrap();
        assert_eq!(again.abandoned, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let (store, _broker, queue, _) = setup(0).await;
        let reconciler = Arc::new(reconciler(&store, &queue));
        let (tx, rx) = watch::channel(false);

        let task = {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move { reconciler.run(Duration::from_secs(300), rx).await })
        };
        tokio::time::sleep(Duration::from_secs(601)).await;
        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
