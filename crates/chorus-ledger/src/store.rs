//! Store trait used by the dispatcher, worker and reconciler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{LedgerError, NewActivity, PodActivity, PodMember};

/// Reads pod membership and owns the activity ledger.
///
/// Every activity mutation touches a single row by id.
#[async_trait]
pub trait PodStore: Send + Sync {
    /// Members of `pod_id` that are active, fully onboarded, and not `author_member_id`.
    async fn eligible_members(
        &self,
        pod_id: &str,
        author_member_id: &str,
    ) -> Result<Vec<PodMember>, LedgerError>;

    /// Look up a single member.
    async fn get_member(&self, member_id: &str) -> Result<Option<PodMember>, LedgerError>;

    /// Insert all activities with status `queued`, or none of them.
    async fn insert_activities(
        &self,
        activities: Vec<NewActivity>,
    ) -> Result<Vec<PodActivity>, LedgerError>;

    /// Look up a single activity.
    async fn get_activity(&self, id: &str) -> Result<Option<PodActivity>, LedgerError>;

    /// Start (or restart) an attempt: `queued | processing | failed -> processing`.
    async fn mark_processing(&self, id: &str) -> Result<PodActivity, LedgerError>;

    /// Finish an attempt successfully: `processing -> completed`.
    async fn mark_completed(&self, id: &str) -> Result<PodActivity, LedgerError>;

    /// Finish an attempt with an error: `processing -> failed`.
    async fn mark_failed(&self, id: &str, error: &str) -> Result<PodActivity, LedgerError>;

    /// Activities still `queued` that were created before `created_before`.
    async fn stale_queued(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<PodActivity>, LedgerError>;

    /// Activities still `processing` whose attempt started before `started_before`.
    async fn stale_processing(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<PodActivity>, LedgerError>;

    /// All activities for a post, oldest first.
    async fn activities_for_post(&self, post_id: &str) -> Result<Vec<PodActivity>, LedgerError>;
}
