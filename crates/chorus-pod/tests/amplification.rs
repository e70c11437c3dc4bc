//! End-to-end amplification against the SQLite ledger and queue, with a fake
//! session broker and browser.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chorus_browser::{ExecutorError, RepostExecutor};
use chorus_ledger::{
    ActivityStatus, LedgerError, NewActivity, OnboardingStatus, PodActivity, PodMember, PodStore,
    SqliteStore,
};
use chorus_pod::{
    AmplificationRequest, DISPATCH_QUEUE, DispatchError, Dispatcher, REPOST_QUEUE, Reconciler,
    RepostWorker, StaggerPolicy, dispatch_queue_options, fanout_handler, repost_queue_options, trigger,
};
use chorus_queue::{
    Backoff, FailOutcome, JobHandler, JobOptions, JobQueue, JobState, QueueBroker, WorkerPool,
};
use chorus_session::{BrowserSession, SessionError, SessionResolver, SessionSource};
use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tokio::sync::watch;

// =============================================================================
// Fakes
// =============================================================================

/// Resolver that either always succeeds or always reports an expired login.
struct FakeResolver {
    expired: bool,
}

#[async_trait]
impl SessionResolver for FakeResolver {
    async fn resolve(&self, account_ref: &str) -> Result<BrowserSession, SessionError> {
        if self.expired {
            return Err(SessionError::CredentialUnavailable {
                account_ref: account_ref.to_string(),
                reason: "session expired".to_string(),
            });
        }
        Ok(BrowserSession {
            account_ref: account_ref.to_string(),
            cookies: Vec::new(),
            source: SessionSource::Token,
        })
    }
}

/// Executor that counts calls and optionally never finds the control.
#[derive(Default)]
struct FakeExecutor {
    control_missing: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl RepostExecutor for FakeExecutor {
    async fn execute(&self, _: &BrowserSession, _: &str) -> Result<(), ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.control_missing {
            return Err(ExecutorError::ActionControlNotFound {
                control: "repost".to_string(),
                tried: 3,
            });
        }
        Ok(())
    }
}

/// Store whose activity insert always fails.
struct BrokenInsertStore(Arc<SqliteStore>);

#[async_trait]
impl PodStore for BrokenInsertStore {
    async fn eligible_members(
        &self,
        pod_id: &str,
        author_member_id: &str,
    ) -> Result<Vec<PodMember>, LedgerError> {
        self.0.eligible_members(pod_id, author_member_id).await
    }

    async fn get_member(&self, member_id: &str) -> Result<Option<PodMember>, LedgerError> {
        self.0.get_member(member_id).await
    }

    async fn insert_activities(
        &self,
        _activities: Vec<NewActivity>,
    ) -> Result<Vec<PodActivity>, LedgerError> {
        Err(LedgerError::Database(rusqlite_busy()))
    }

    async fn get_activity(&self, id: &str) -> Result<Option<PodActivity>, LedgerError> {
        self.0.get_activity(id).await
    }

    async fn mark_processing(&self, id: &str) -> Result<PodActivity, LedgerError> {
        self.0.mark_processing(id).await
    }

    async fn mark_completed(&self, id: &str) -> Result<PodActivity, LedgerError> {
        self.0.mark_completed(id).await
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<PodActivity, LedgerError> {
        self.0.mark_failed(id, error).await
    }

    async fn stale_queued(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<PodActivity>, LedgerError> {
        self.0.stale_queued(created_before).await
    }

    async fn stale_processing(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<PodActivity>, LedgerError> {
        self.0.stale_processing(started_before).await
    }

    async fn activities_for_post(&self, post_id: &str) -> Result<Vec<PodActivity>, LedgerError> {
        self.0.activities_for_post(post_id).await
    }
}

fn rusqlite_busy() -> rusqlite::Error {
    rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
        Some("database is locked".to_string()),
    )
}

// =============================================================================
// Fixture
// =============================================================================

struct Pod {
    store: Arc<SqliteStore>,
    broker: QueueBroker,
    repost: JobQueue,
    pod_id: String,
    members: Vec<PodMember>,
}

/// A pod whose first member is the author. Each entry is (active, onboarded).
fn pod(shape: &[(bool, bool)], repost_options: JobOptions) -> Pod {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let pod = store.create_pod("tenant", "pod").unwrap();
    let members = shape
        .iter()
        .enumerate()
        .map(|(i, (active, onboarded))| {
            let status = if *onboarded {
                OnboardingStatus::Complete
            } else {
                OnboardingStatus::Pending
            };
            store
                .add_member(
                    &pod.id,
                    &format!("user-{}", i),
                    &format!("acc-{}", i),
                    *active,
                    status,
                )
                .unwrap()
        })
        .collect();
    let broker = QueueBroker::open_in_memory().unwrap();
    let repost = broker.queue(REPOST_QUEUE, repost_options).unwrap();
    Pod {
        store,
        broker,
        repost,
        pod_id: pod.id,
        members,
    }
}

/// Scenario fixture: author, three eligible, one inactive.
fn pod_of_five(repost_options: JobOptions) -> Pod {
    pod(
        &[
            (true, true),
            (true, true),
            (true, true),
            (true, true),
            (false, true),
        ],
        repost_options,
    )
}

fn request(pod: &Pod) -> AmplificationRequest {
    AmplificationRequest {
        post_id: "post-1".to_string(),
        post_url: "https://www.linkedin.com/feed/update/urn:li:activity:1".to_string(),
        pod_id: pod.pod_id.clone(),
        author_member_id: pod.members[0].id.clone(),
        created_at: Utc::now(),
    }
}

fn dispatcher(pod: &Pod) -> Dispatcher {
    Dispatcher::new(
        pod.store.clone(),
        Arc::new(pod.repost.clone()),
        StaggerPolicy::default(),
    )
}

fn worker_handler(pod: &Pod, resolver: FakeResolver, executor: Arc<FakeExecutor>) -> JobHandler {
    Arc::new(RepostWorker::new(pod.store.clone(), Arc::new(resolver), executor)).handler()
}

/// Claim the job due at `at`, run it, and report what the queue did with it.
async fn deliver(queue: &JobQueue, handler: &JobHandler, at: DateTime<Utc>) -> Option<FailOutcome> {
    let job = queue.claim_due(at).unwrap().expect("a job should be due");
    let id = job.id.clone();
    match handler(job).await {
        Ok(()) => {
            queue.complete(&id).await.unwrap();
            None
        }
        Err(failure) => Some(queue.fail_at(&id, &failure, at).unwrap()),
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn scenario_a_three_activities_staggered_five_seconds_apart() {
    let pod = pod_of_five(repost_queue_options());
    let outcome = dispatcher(&pod).dispatch(&request(&pod)).await.unwrap();

    assert_eq!(outcome.activities_created, 3);
    assert_eq!(outcome.jobs_enqueued, 3);

    let activities = pod.store.activities_for_post("post-1").await.unwrap();
    assert_eq!(activities.len(), 3);
    assert!(activities.iter().all(|a| a.status == ActivityStatus::Queued));

    let mut jobs = pod.repost.list_in_state(JobState::Waiting, 10).unwrap();
    jobs.sort_by_key(|j| j.run_at);
    let delays: Vec<i64> = jobs
        .iter()
        .map(|j| (j.run_at - j.created_at).num_milliseconds())
        .collect();
    assert_eq!(delays, vec![0, 5_000, 10_000]);

    let mut job_ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
    let mut activity_ids: Vec<&str> = activities.iter().map(|a| a.id.as_str()).collect();
    job_ids.sort();
    activity_ids.sort();
    assert_eq!(job_ids, activity_ids);
}

#[tokio::test]
async fn scenario_b_control_never_found_fails_after_two_attempts() {
    let pod = pod(&[(true, true), (true, true)], repost_queue_options());
    dispatcher(&pod).dispatch(&request(&pod)).await.unwrap();

    let executor = Arc::new(FakeExecutor {
        control_missing: true,
        ..Default::default()
    });
    let handler = worker_handler(&pod, FakeResolver { expired: false }, executor.clone());

    let t0 = Utc::now();
    let first = deliver(&pod.repost, &handler, t0).await;
    let retry_at = match first {
        Some(FailOutcome::Retrying { attempt: 2, run_at }) => run_at,
        other => panic!("expected a retry, got {other:?}"),
    };
    assert_eq!(retry_at - t0, chrono::Duration::seconds(10));

    let second = deliver(&pod.repost, &handler, retry_at).await;
    assert_eq!(second, Some(FailOutcome::DeadLettered { attempts: 2 }));
    assert!(
        pod.repost
            .claim_due(retry_at + chrono::Duration::hours(1))
            .unwrap()
            .is_none()
    );
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);

    let activities = pod.store.activities_for_post("post-1").await.unwrap();
    assert_eq!(activities.len(), 1);
    assert_eq!(activities[0].status, ActivityStatus::Failed);
    assert!(activities[0].error.as_deref().unwrap().contains("no repost control"));

    let dead = pod.repost.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, activities[0].id);
    assert_eq!(dead[0].attempts_made, 2);
}

#[tokio::test]
async fn scenario_c_unavailable_credential_is_never_retried() {
    let generous = JobOptions::new(5, Backoff::Exponential { delay_ms: 10_000 });
    let pod = pod(&[(true, true), (true, true)], generous);
    dispatcher(&pod).dispatch(&request(&pod)).await.unwrap();

    let executor = Arc::new(FakeExecutor::default());
    let handler = worker_handler(&pod, FakeResolver { expired: true }, executor.clone());

    let now = Utc::now();
    let outcome = deliver(&pod.repost, &handler, now).await;
    assert_eq!(outcome, Some(FailOutcome::DeadLettered { attempts: 1 }));
    assert!(
        pod.repost
            .claim_due(now + chrono::Duration::days(1))
            .unwrap()
            .is_none()
    );
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);

    let activities = pod.store.activities_for_post("post-1").await.unwrap();
    assert_eq!(activities[0].status, ActivityStatus::Failed);
    assert!(activities[0].error.is_some());
}

#[tokio::test]
async fn scenario_d_insert_failure_enqueues_nothing() {
    let pod = pod_of_five(repost_queue_options());
    let broken = Dispatcher::new(
        Arc::new(BrokenInsertStore(pod.store.clone())),
        Arc::new(pod.repost.clone()),
        StaggerPolicy::default(),
    );

    let err = broken.dispatch(&request(&pod)).await.unwrap_err();
    assert!(matches!(err, DispatchError::Persistence(_)));
    assert!(err.is_retryable());

    let counts = pod.repost.counts().await.unwrap();
    assert_eq!(counts.waiting + counts.active + counts.completed + counts.dead, 0);
    assert!(pod.store.activities_for_post("post-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn retry_that_succeeds_overwrites_failure() {
    let pod = pod(&[(true, true), (true, true)], repost_queue_options());
    dispatcher(&pod).dispatch(&request(&pod)).await.unwrap();

    let failing = worker_handler(
        &pod,
        FakeResolver { expired: false },
        Arc::new(FakeExecutor {
            control_missing: true,
            ..Default::default()
        }),
    );
    let t0 = Utc::now();
    let Some(FailOutcome::Retrying { run_at, .. }) = deliver(&pod.repost, &failing, t0).await else {
        panic!("expected a retry");
    };

    let working = worker_handler(
        &pod,
        FakeResolver { expired: false },
        Arc::new(FakeExecutor::default()),
    );
    assert_eq!(deliver(&pod.repost, &working, run_at).await, None);

    let activities = pod.store.activities_for_post("post-1").await.unwrap();
    assert_eq!(activities[0].status, ActivityStatus::Completed);
    assert_eq!(activities[0].error, None);
}

#[tokio::test]
async fn worker_dying_on_last_attempt_leaves_activity_failed() {
    let pod = pod(&[(true, true), (true, true)], repost_queue_options());
    dispatcher(&pod).dispatch(&request(&pod)).await.unwrap();
    let lease = Duration::from_secs(600);

    // Both attempts start and the worker disappears mid-repost each time
    let t0 = Utc::now();
    let job = pod.repost.claim_due(t0).unwrap().unwrap();
    pod.store.mark_processing(&job.id).await.unwrap();
    let t1 = t0 + chrono::Duration::seconds(601);
    assert_eq!(pod.repost.recover_stalled_at(lease, t1).unwrap(), 1);
    pod.repost.claim_due(t1).unwrap().unwrap();
    let t2 = t1 + chrono::Duration::seconds(601);
    assert_eq!(pod.repost.recover_stalled_at(lease, t2).unwrap(), 1);
    assert_eq!(
        pod.repost.get(&job.id).await.unwrap().unwrap().state,
        JobState::Dead
    );

    let reconciler = Reconciler::new(
        pod.store.clone(),
        Arc::new(pod.repost.clone()),
        StaggerPolicy::default(),
        Reconciler::DEFAULT_STALE_AFTER,
    );
    let report = reconciler
        .sweep_at(t0 + chrono::Duration::seconds(1_000))
        .await
        .unwrap();
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.requeued, 0);

    let activity = pod.store.get_activity(&job.id).await.unwrap().unwrap();
    assert_eq!(activity.status, ActivityStatus::Failed);
    assert!(activity.error.as_deref().unwrap().contains("stalled"));

    // Nothing more to do on the next sweep; the dead letter stays
    let again = reconciler
        .sweep_at(t0 + chrono::Duration::seconds(2_000))
        .await
        .unwrap();
    assert_eq!(again.abandoned, 0);
    assert_eq!(pod.repost.counts().await.unwrap().dead, 1);
}

#[tokio::test]
async fn sweep_requeue_keeps_earlier_dead_letter() {
    let pod = pod(&[(true, true), (true, true)], repost_queue_options());
    dispatcher(&pod).dispatch(&request(&pod)).await.unwrap();

    // The worker died before touching the ledger, on a job with one attempt left
    let t0 = Utc::now();
    let job = pod.repost.claim_due(t0).unwrap().unwrap();
    pod.repost
        .fail_at(&job.id, &chorus_queue::JobFailure::fatal("undeliverable"), t0)
        .unwrap();
    assert_eq!(pod.repost.counts().await.unwrap().dead, 1);

    let reconciler = Reconciler::new(
        pod.store.clone(),
        Arc::new(pod.repost.clone()),
        StaggerPolicy::default(),
        Reconciler::DEFAULT_STALE_AFTER,
    );
    let report = reconciler
        .sweep_at(t0 + chrono::Duration::seconds(1_000))
        .await
        .unwrap();
    assert_eq!(report.requeued, 1);

    let counts = pod.repost.counts().await.unwrap();
    assert_eq!(counts.dead, 1);
    assert_eq!(counts.waiting, 1);
    assert_eq!(
        pod.repost.dead_letters(10).await.unwrap()[0].last_error.as_deref(),
        Some("undeliverable")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn trigger_to_completion_through_worker_pools() {
    let pod = pod_of_five(repost_queue_options());
    let fanout = pod
        .broker
        .queue(DISPATCH_QUEUE, dispatch_queue_options())
        .unwrap();
    let dispatcher = Arc::new(Dispatcher::new(
        pod.store.clone(),
        Arc::new(pod.repost.clone()),
        StaggerPolicy::fixed(Duration::from_millis(10)).unwrap(),
    ));
    let executor = Arc::new(FakeExecutor::default());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = WorkerPool::new(fanout.clone(), 1)
        .start(shutdown_rx.clone(), fanout_handler(dispatcher))
        .await
        .unwrap();
    handles.extend(
        WorkerPool::new(pod.repost.clone(), 2)
            .start(
                shutdown_rx,
                worker_handler(&pod, FakeResolver { expired: false }, executor.clone()),
            )
            .await
            .unwrap(),
    );

    trigger(&fanout, &request(&pod)).await.unwrap();

    let mut done = 0;
    for _ in 0..400 {
        done = pod
            .store
            .activities_for_post("post-1")
            .await
            .unwrap()
            .iter()
            .filter(|a| a.status == ActivityStatus::Completed)
            .count();
        if done == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    shutdown_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(done, 3);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    assert_eq!(pod.repost.counts().await.unwrap().completed, 3);
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Activity and job counts both equal the eligible count, and the author
    /// is never amplifying their own post.
    #[test]
    fn dispatch_counts_match_eligible_members(
        shape in proptest::collection::vec((any::<bool>(), any::<bool>()), 1..10),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let pod = pod(&shape, repost_queue_options());
            let author = pod.members[0].id.clone();
            let expected = shape[1..].iter().filter(|(active, onboarded)| *active && *onboarded).count();

            let outcome = dispatcher(&pod).dispatch(&request(&pod)).await.unwrap();
            prop_assert_eq!(outcome.activities_created, expected);
            prop_assert_eq!(outcome.jobs_enqueued, expected);

            let activities = pod.store.activities_for_post("post-1").await.unwrap();
            prop_assert_eq!(activities.len(), expected);
            prop_assert!(activities.iter().all(|a| a.member_id != author));

            let mut members: Vec<&str> = activities.iter().map(|a| a.member_id.as_str()).collect();
            members.sort();
            members.dedup();
            prop_assert_eq!(members.len(), expected);
            Ok(())
        })?;
    }
}
