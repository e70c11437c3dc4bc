//! Runs one repost job end to end.

use std::sync::Arc;

use chorus_browser::RepostExecutor;
use chorus_ledger::{ActivityStatus, LedgerError, PodStore};
use chorus_queue::{JobFailure, JobHandler, QueueJob};
use chorus_session::SessionResolver;
use tracing::{error, info, instrument, warn};

use crate::RepostJob;

/// Resolves a member's session, drives the browser, and records the outcome.
///
/// The activity row reflects the latest attempt only; attempt history lives
/// in the queue.
pub struct RepostWorker {
    store: Arc<dyn PodStore>,
    resolver: Arc<dyn SessionResolver>,
    executor: Arc<dyn RepostExecutor>,
}

impl RepostWorker {
    pub fn new(
        store: Arc<dyn PodStore>,
        resolver: Arc<dyn SessionResolver>,
        executor: Arc<dyn RepostExecutor>,
    ) -> Self {
        Self {
            store,
            resolver,
            executor,
        }
    }

    /// Process delivery number `attempt` of `job`.
    ///
    /// Credential failures are fatal so the queue never retries them;
    /// automation failures keep their own retry classification.
    #[instrument(skip(self, job), fields(activity_id = %job.activity_id, member_id = %job.member_id))]
    pub async fn process(&self, job: &RepostJob, attempt: u32) -> Result<(), JobFailure> {
        let activity = match self.store.get_activity(&job.activity_id).await {
            Ok(Some(activity)) => activity,
            Ok(None) => {
                return Err(JobFailure::fatal(format!(
                    "activity {} does not exist",
                    job.activity_id
                )));
            }
            Err(e) => return Err(JobFailure::retryable(format!("ledger read failed: {}", e))),
        };

        if activity.member_id != job.member_id {
            return Err(JobFailure::fatal(format!(
                "job member {} does not own activity {}",
                job.member_id, activity.id
            )));
        }
        if activity.status == ActivityStatus::Completed {
            info!("activity already completed, skipping duplicate delivery");
            return Ok(());
        }

        match self.store.mark_processing(&job.activity_id).await {
            Ok(_) => {}
            Err(LedgerError::InvalidTransition {
                from: ActivityStatus::Completed,
                ..
            }) => {
                info!("activity completed concurrently, skipping");
                return Ok(());
            }
            Err(e) => {
                return Err(JobFailure::retryable(format!(
                    "failed to mark processing: {}",
                    e
                )));
            }
        }

        let session = match self.resolver.resolve(&job.account_credential_ref).await {
            Ok(session) => session,
            Err(e) => {
                let message = format!("session: {}", e);
                self.record_failure(&job.activity_id, attempt, &message).await;
                return Err(if e.is_retryable() {
                    JobFailure::retryable(message)
                } else {
                    JobFailure::fatal(message)
                });
            }
        };

        if let Err(e) = self.executor.execute(&session, &job.target_url).await {
            let message = format!("automation: {}", e);
            self.record_failure(&job.activity_id, attempt, &message).await;
            return Err(if e.is_retryable() {
                JobFailure::retryable(message)
            } else {
                JobFailure::fatal(message)
            });
        }

        // The repost already happened; retrying would repeat it.
        if let Err(e) = self.store.mark_completed(&job.activity_id).await {
            error!(error = %e, "repost succeeded but ledger update failed");
            return Err(JobFailure::fatal(format!(
                "repost done, failed to mark completed: {}",
                e
            )));
        }

        info!(attempt, "repost completed");
        Ok(())
    }

    async fn record_failure(&self, activity_id: &str, attempt: u32, message: &str) {
        warn!(attempt, error = %message, "repost attempt failed");
        if let Err(e) = self.store.mark_failed(activity_id, message).await {
            error!(error = %e, "failed to record activity failure");
        }
    }

    /// Queue handler for [`crate::REPOST_QUEUE`].
    pub fn handler(self: Arc<Self>) -> JobHandler {
        Arc::new(move |job: QueueJob| {
            let worker = Arc::clone(&self);
            Box::pin(async move {
                let payload: RepostJob = job
                    .decode()
                    .map_err(|e| JobFailure::fatal(format!("undecodable repost job: {}", e)))?;
                worker.process(&payload, job.attempts_made).await
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chorus_browser::ExecutorError;
    use chorus_ledger::{ActivityKind, NewActivity, OnboardingStatus, PodActivity, SqliteStore};
    use chorus_session::{BrowserSession, SessionError, SessionSource};
    use pretty_assertions::assert_eq;

    struct StaticResolver {
        fail: Option<fn(&str) -> SessionError>,
    }

    #[async_trait]
    impl SessionResolver for StaticResolver {
        async fn resolve(&self, account_ref: &str) -> Result<BrowserSession, SessionError> {
            if let Some(fail) = self.fail {
                return Err(fail(account_ref));
            }
            Ok(BrowserSession {
                account_ref: account_ref.to_string(),
                cookies: Vec::new(),
                source: SessionSource::Token,
            })
        }
    }

    #[derive(Default)]
    struct ScriptedExecutor {
        failures: Mutex<Vec<ExecutorError>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RepostExecutor for ScriptedExecutor {
        async fn execute(&self, _: &BrowserSession, _: &str) -> Result<(), ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.failures.lock().unwrap().pop() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    fn unavailable(account_ref: &str) -> SessionError {
        SessionError::CredentialUnavailable {
            account_ref: account_ref.to_string(),
            reason: "expired".to_string(),
        }
    }

    async fn setup() -> (Arc<SqliteStore>, PodActivity, RepostJob) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let pod = store.create_pod("t", "p").unwrap();
        let member = store
            .add_member(&pod.id, "u", "acc-1", true, OnboardingStatus::Complete)
            .unwrap();
        let activity = store
            .insert_activities(vec![NewActivity {
                pod_id: pod.id.clone(),
                post_id: "post".to_string(),
                member_id: member.id.clone(),
                dispatch_id: "d".to_string(),
                kind: ActivityKind::Repost,
                target_url: "https://example.com/p".to_string(),
            }])
            .await
            .unwrap()
            .remove(0);
        let job = RepostJob {
            activity_id: activity.id.clone(),
            member_id: member.id,
            target_url: activity.target_url.clone(),
            account_credential_ref: "acc-1".to_string(),
        };
        (store, activity, job)
    }

    fn worker(
        store: Arc<SqliteStore>,
        resolver: StaticResolver,
        executor: Arc<ScriptedExecutor>,
    ) -> RepostWorker {
        RepostWorker::new(store, Arc::new(resolver), executor)
    }

    #[tokio::test]
    async fn test_success_marks_completed() {
        let (store, activity, job) = setup().await;
        let executor = Arc::new(ScriptedExecutor::default());
        let w = worker(store.clone(), StaticResolver { fail: None }, executor);

        w.process(&job, 1).await.unwrap();
        let row = store.get_activity(&activity.id).await.unwrap().unwrap();
        assert_eq!(row.status, ActivityStatus::Completed);
        assert!(row.started_at.is_some());
        assert!(row.completed_at.is_some());
        assert_eq!(row.error, None);
    }

    #[tokio::test]
    async fn test_credential_unavailable_is_fatal() {
        let (store, activity, job) = setup().await;
        let executor = Arc::new(ScriptedExecutor::default());
        let w = worker(
            store.clone(),
            StaticResolver {
                fail: Some(unavailable),
            },
            executor.clone(),
        );

        let failure = w.process(&job, 1).await.unwrap_err();
        assert!(!failure.retryable);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);

        let row = store.get_activity(&activity.id).await.unwrap().unwrap();
        assert_eq!(row.status, ActivityStatus::Failed);
        assert!(row.error.unwrap().contains("credential unavailable"));
    }

    #[tokio::test]
    async fn test_automation_failure_is_retryable_and_retry_overwrites() {
        let (store, activity, job) = setup().await;
        let executor = Arc::new(ScriptedExecutor {
            failures: Mutex::new(vec![ExecutorError::ActionControlNotFound {
                control: "repost".to_string(),
                tried: 3,
            }]),
            ..Default::default()
        });
        let w = worker(store.clone(), StaticResolver { fail: None }, executor);

        let failure = w.process(&job, 1).await.unwrap_err();
        assert!(failure.retryable);
        let row = store.get_activity(&activity.id).await.unwrap().unwrap();
        assert_eq!(row.status, ActivityStatus::Failed);

        w.process(&job, 2).await.unwrap();
        let row = store.get_activity(&activity.id).await.unwrap().unwrap();
        assert_eq!(row.status, ActivityStatus::Completed);
        assert_eq!(row.error, None);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_after_completion_is_acked() {
        let (store, _activity, job) = setup().await;
        let executor = Arc::new(ScriptedExecutor::default());
        let w = worker(store, StaticResolver { fail: None }, executor.clone());

        w.process(&job, 1).await.unwrap();
        w.process(&job, 1).await.unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_activity_is_fatal() {
        let (store, _activity, mut job) = setup().await;
        job.activity_id = "nope".to_string();
        let w = worker(
            store,
            StaticResolver { fail: None },
            Arc::new(ScriptedExecutor::default()),
        );
        assert!(!w.process(&job, 1).await.unwrap_err().retryable);
    }

    #[tokio::test]
    async fn test_member_mismatch_is_fatal() {
        let (store, _activity, mut job) = setup().await;
        job.member_id = "someone-else".to_string();
        let w = worker(
            store,
            StaticResolver { fail: None },
            Arc::new(ScriptedExecutor::default()),
        );
        assert!(!w.process(&job, 1).await.unwrap_err().retryable);
    }
}
