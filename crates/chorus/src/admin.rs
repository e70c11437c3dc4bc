//! One-shot commands: triggers, inspection, pod administration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chorus_ledger::{OnboardingStatus, PodStore, SqliteStore};
use chorus_pod::{
    AmplificationRequest, DISPATCH_QUEUE, Dispatcher, REPOST_QUEUE, Reconciler, StaggerPolicy,
    dispatch_queue_options, repost_queue_options,
};
use chorus_queue::{JobOptions, QueueBroker};
use miette::{Result, miette};
use serde::Serialize;

/// Parse an onboarding status argument.
pub fn parse_onboarding(s: &str) -> Result<OnboardingStatus, String> {
    OnboardingStatus::parse(&s.to_lowercase()).ok_or_else(|| {
        format!(
            "invalid onboarding status '{}', expected invited/pending/complete",
            s
        )
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).map_err(|e| miette!("{}", e))?;
    println!("{}", out);
    Ok(())
}

fn open_store(db_path: &Path) -> Result<SqliteStore> {
    SqliteStore::open(db_path)
        .map_err(|e| miette!("failed to open ledger {}: {}", db_path.display(), e))
}

fn open_broker(queue_path: &Path) -> Result<QueueBroker> {
    QueueBroker::open(queue_path)
        .map_err(|e| miette!("failed to open queue {}: {}", queue_path.display(), e))
}

fn queue_options(name: &str) -> Result<JobOptions> {
    match name {
        DISPATCH_QUEUE => Ok(dispatch_queue_options()),
        REPOST_QUEUE => Ok(repost_queue_options()),
        other => Err(miette!(
            "unknown queue '{}', expected {} or {}",
            other,
            DISPATCH_QUEUE,
            REPOST_QUEUE
        )),
    }
}

/// Hand a request to the fan-out queue for a running daemon to pick up.
pub async fn trigger(queue_path: &Path, request: AmplificationRequest) -> Result<()> {
    let broker = open_broker(queue_path)?;
    let queue = broker
        .queue(DISPATCH_QUEUE, dispatch_queue_options())
        .map_err(|e| miette!("{}", e))?;
    let job_id = chorus_pod::trigger(&queue, &request)
        .await
        .map_err(|e| miette!("{}", e))?;
    println!("{}", job_id);
    broker.shutdown().map_err(|e| miette!("{}", e))
}

/// Dispatch synchronously and print `{activitiesCreated, jobsEnqueued}`.
pub async fn dispatch(
    db_path: &Path,
    queue_path: &Path,
    request: AmplificationRequest,
    stagger: StaggerPolicy,
) -> Result<()> {
    let store = Arc::new(open_store(db_path)?);
    let broker = open_broker(queue_path)?;
    let repost = broker
        .queue(REPOST_QUEUE, repost_queue_options())
        .map_err(|e| miette!("{}", e))?;

    let outcome = Dispatcher::new(store, Arc::new(repost), stagger)
        .dispatch(&request)
        .await
        .map_err(|e| miette!("{}", e))?;
    print_json(&outcome)?;
    broker.shutdown().map_err(|e| miette!("{}", e))
}

/// Print the ledger rows for a post.
pub async fn activities(db_path: &Path, post_id: &str) -> Result<()> {
    let store = open_store(db_path)?;
    let rows = store
        .activities_for_post(post_id)
        .await
        .map_err(|e| miette!("{}", e))?;
    print_json(&rows)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeadLetter {
    id: String,
    attempts_made: u32,
    last_error: Option<String>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
    payload: serde_json::Value,
}

#[derive(Serialize)]
struct DeadLetterReport {
    queue: String,
    counts: chorus_queue::QueueCounts,
    dead: Vec<DeadLetter>,
}

/// Print state counts and the most recent dead-lettered jobs of a queue.
pub async fn dead_letters(queue_path: &Path, queue_name: &str, limit: usize) -> Result<()> {
    let broker = open_broker(queue_path)?;
    let queue = broker
        .queue(queue_name, queue_options(queue_name)?)
        .map_err(|e| miette!("{}", e))?;

    let counts = queue.counts().await.map_err(|e| miette!("{}", e))?;
    let dead = queue
        .dead_letters(limit)
        .await
        .map_err(|e| miette!("{}", e))?
        .into_iter()
        .map(|job| DeadLetter {
            id: job.id,
            attempts_made: job.attempts_made,
            last_error: job.last_error,
            finished_at: job.finished_at,
            payload: job.payload,
        })
        .collect();

    print_json(&DeadLetterReport {
        queue: queue_name.to_string(),
        counts,
        dead,
    })
}

/// Run one reconciliation sweep and print its report.
pub async fn sweep(
    db_path: &Path,
    queue_path: &Path,
    stagger: StaggerPolicy,
    stale_after: Duration,
) -> Result<()> {
    let store = Arc::new(open_store(db_path)?);
    let broker = open_broker(queue_path)?;
    let repost = broker
        .queue(REPOST_QUEUE, repost_queue_options())
        .map_err(|e| miette!("{}", e))?;

    let report = Reconciler::new(store, Arc::new(repost), stagger, stale_after)
        .sweep()
        .await
        .map_err(|e| miette!("{}", e))?;
    println!(
        "stale: {}, requeued: {}, with live job: {}, orphaned: {}, failed after dead letter: {}",
        report.stale, report.requeued, report.with_live_job, report.orphaned, report.abandoned
    );
    broker.shutdown().map_err(|e| miette!("{}", e))
}

pub fn create_pod(db_path: &Path, tenant_id: &str, name: &str) -> Result<()> {
    let pod = open_store(db_path)?
        .create_pod(tenant_id, name)
        .map_err(|e| miette!("{}", e))?;
    print_json(&pod)
}

pub fn add_member(
    db_path: &Path,
    pod_id: &str,
    user_id: &str,
    account_ref: &str,
    active: bool,
    onboarding: OnboardingStatus,
) -> Result<()> {
    let store = open_store(db_path)?;
    if store
        .get_pod(pod_id)
        .map_err(|e| miette!("{}", e))?
        .is_none()
    {
        return Err(miette!("pod not found: {}", pod_id));
    }
    let member = store
        .add_member(pod_id, user_id, account_ref, active, onboarding)
        .map_err(|e| miette!("{}", e))?;
    print_json(&member)
}

pub fn set_member(
    db_path: &Path,
    member_id: &str,
    active: Option<bool>,
    onboarding: Option<OnboardingStatus>,
) -> Result<()> {
    if active.is_none() && onboarding.is_none() {
        return Err(miette!("nothing to change: pass --active and/or --onboarding"));
    }
    let store = open_store(db_path)?;
    if let Some(active) = active {
        store
            .set_member_active(member_id, active)
            .map_err(|e| miette!("{}", e))?;
    }
    if let Some(status) = onboarding {
        store
            .set_onboarding_status(member_id, status)
            .map_err(|e| miette!("{}", e))?;
    }
    println!("updated {}", member_id);
    Ok(())
}

pub fn members(db_path: &Path, pod_id: &str) -> Result<()> {
    let members = open_store(db_path)?
        .members(pod_id)
        .map_err(|e| miette!("{}", e))?;
    print_json(&members)
}
