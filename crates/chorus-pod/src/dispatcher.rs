//! Fan a published post out to the rest of the pod.

use std::collections::HashMap;
use std::sync::Arc;

use chorus_ledger::{ActivityKind, NewActivity, PodStore};
use chorus_queue::{JobFailure, JobHandler, JobSink, NewJob, QueueError, QueueJob};
use tracing::{info, instrument, warn};

use crate::{AmplificationRequest, DispatchError, DispatchOutcome, RepostJob, StaggerPolicy};

/// Creates ledger rows and staggered repost jobs for one request.
pub struct Dispatcher {
    store: Arc<dyn PodStore>,
    repost_queue: Arc<dyn JobSink>,
    stagger: StaggerPolicy,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn PodStore>,
        repost_queue: Arc<dyn JobSink>,
        stagger: StaggerPolicy,
    ) -> Self {
        Self {
            store,
            repost_queue,
            stagger,
        }
    }

    pub fn stagger(&self) -> StaggerPolicy {
        self.stagger
    }

    /// Amplify `request.post_id` across every eligible member of the pod.
    ///
    /// Activities are written before any job is enqueued; a failed insert
    /// leaves the queue untouched. A pod with nobody to amplify is a
    /// successful no-op.
    #[instrument(skip(self, request), fields(post_id = %request.post_id, pod_id = %request.pod_id))]
    pub async fn dispatch(
        &self,
        request: &AmplificationRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        request.validate()?;

        let members = self
            .store
            .eligible_members(&request.pod_id, &request.author_member_id)
            .await
            .map_err(DispatchError::Membership)?;
        let members: Vec<_> = members
            .into_iter()
            .filter(|m| m.id != request.author_member_id && m.is_eligible())
            .collect();

        if members.is_empty() {
            info!("no eligible members, nothing to dispatch");
            return Ok(DispatchOutcome::default());
        }

        let dispatch_id = uuid::Uuid::new_v4().to_string();
        let rows = members
            .iter()
            .map(|m| NewActivity {
                pod_id: request.pod_id.clone(),
                post_id: request.post_id.clone(),
                member_id: m.id.clone(),
                dispatch_id: dispatch_id.clone(),
                kind: ActivityKind::Repost,
                target_url: request.post_url.clone(),
            })
            .collect();
        let activities = self
            .store
            .insert_activities(rows)
            .await
            .map_err(DispatchError::Persistence)?;

        let accounts: HashMap<&str, &str> = members
            .iter()
            .map(|m| (m.id.as_str(), m.account_ref.as_str()))
            .collect();
        let delays = self.stagger.schedule(activities.len());

        let jobs = activities
            .iter()
            .zip(delays)
            .map(|(activity, delay)| {
                let payload = RepostJob {
                    activity_id: activity.id.clone(),
                    member_id: activity.member_id.clone(),
                    target_url: activity.target_url.clone(),
                    account_credential_ref: accounts
                        .get(activity.member_id.as_str())
                        .map(|a| a.to_string())
                        .unwrap_or_default(),
                };
                NewJob::new(&payload).map(|job| job.with_id(&activity.id).with_delay(delay))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DispatchError::Enqueue {
                activities: activities.len(),
                source: QueueError::from(e),
            })?;

        let enqueued = match self.repost_queue.add_bulk(jobs).await {
            Ok(ids) => ids.len(),
            Err(source) => {
                warn!(
                    dispatch_id = %dispatch_id,
                    activities = activities.len(),
                    error = %source,
                    "activities recorded but jobs not enqueued; left for reconciliation"
                );
                return Err(DispatchError::Enqueue {
                    activities: activities.len(),
                    source,
                });
            }
        };

        info!(
            dispatch_id = %dispatch_id,
            activities = activities.len(),
            jobs = enqueued,
            interval_ms = self.stagger.interval().as_millis() as u64,
            "dispatched amplification"
        );
        Ok(DispatchOutcome {
            activities_created: activities.len(),
            jobs_enqueued: enqueued,
        })
    }
}

/// Put a request on the fan-out queue. Returns the trigger job id.
pub async fn trigger(
    dispatch_queue: &dyn JobSink,
    request: &AmplificationRequest,
) -> Result<String, DispatchError> {
    request.validate()?;
    let job = NewJob::new(request)
        .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?
        .with_id(request.job_id());
    let mut ids = dispatch_queue
        .add_bulk(vec![job])
        .await
        .map_err(|source| DispatchError::Enqueue {
            activities: 0,
            source,
        })?;
    info!(post_id = %request.post_id, pod_id = %request.pod_id, "amplification triggered");
    ids.pop().ok_or_else(|| DispatchError::Enqueue {
        activities: 0,
        source: QueueError::Corrupt("bulk insert returned no id".to_string()),
    })
}

/// Fan-out queue handler: decode the trigger and dispatch it.
///
/// Only failures that left nothing behind are retried; a half-finished
/// dispatch is handed to reconciliation rather than duplicated.
pub fn fanout_handler(dispatcher: Arc<Dispatcher>) -> JobHandler {
    Arc::new(move |job: QueueJob| {
        let dispatcher = Arc::clone(&dispatcher);
        Box::pin(async move {
            let request: AmplificationRequest = job
                .decode()
                .map_err(|e| JobFailure::fatal(format!("undecodable trigger: {}", e)))?;

            match dispatcher.dispatch(&request).await {
                Ok(_) => Ok(()),
                Err(e) if e.is_retryable() => Err(JobFailure::retryable(e.to_string())),
                Err(e) => Err(JobFailure::fatal(e.to_string())),
            }
        })
    })
}
