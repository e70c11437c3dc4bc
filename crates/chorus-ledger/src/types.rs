//! Pod and activity types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cooperating group of accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Where a member is in the onboarding flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStatus {
    #[default]
    Invited,
    /// Account connection started but not confirmed.
    Pending,
    Complete,
}

impl OnboardingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnboardingStatus::Invited => "invited",
            OnboardingStatus::Pending => "pending",
            OnboardingStatus::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invited" => Some(OnboardingStatus::Invited),
            "pending" => Some(OnboardingStatus::Pending),
            "complete" => Some(OnboardingStatus::Complete),
            _ => None,
        }
    }
}

/// A member account in a pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodMember {
    pub id: String,
    pub pod_id: String,
    /// Owning user in the surrounding product.
    pub user_id: String,
    /// Opaque handle the session broker knows this account by.
    pub account_ref: String,
    pub active: bool,
    pub onboarding_status: OnboardingStatus,
    pub created_at: DateTime<Utc>,
}

impl PodMember {
    /// Whether this member may take part in amplification at all.
    pub fn is_eligible(&self) -> bool {
        self.active && self.onboarding_status == OnboardingStatus::Complete
    }
}

/// Kind of engagement an activity performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    #[default]
    Repost,
    Comment,
    Like,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Repost => "repost",
            ActivityKind::Comment => "comment",
            ActivityKind::Like => "like",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "repost" => Some(ActivityKind::Repost),
            "comment" => Some(ActivityKind::Comment),
            "like" => Some(ActivityKind::Like),
            _ => None,
        }
    }
}

/// Status of one amplification attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    #[default]
    Queued,
    Processing,
    Completed,
    Failed,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Queued => "queued",
            ActivityStatus::Processing => "processing",
            ActivityStatus::Completed => "completed",
            ActivityStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(ActivityStatus::Queued),
            "processing" => Some(ActivityStatus::Processing),
            "completed" => Some(ActivityStatus::Completed),
            "failed" => Some(ActivityStatus::Failed),
            _ => None,
        }
    }

    /// Whether the ledger accepts a move from `self` to `next`.
    ///
    /// `processing -> processing` re-confirms a redelivered attempt and
    /// `failed -> processing` starts a queue retry. `completed` is final.
    pub fn can_transition_to(&self, next: ActivityStatus) -> bool {
        use ActivityStatus::*;
        matches!(
            (self, next),
            (Queued | Processing | Failed, Processing) | (Processing, Completed | Failed)
        )
    }

    /// Statuses from which a move to `next` is accepted.
    pub fn sources_for(next: ActivityStatus) -> &'static [ActivityStatus] {
        use ActivityStatus::*;
        match next {
            Queued => &[],
            Processing => &[Queued, Processing, Failed],
            Completed | Failed => &[Processing],
        }
    }
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One member's amplification of one post, for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodActivity {
    pub id: String,
    pub pod_id: String,
    pub post_id: String,
    pub member_id: String,
    /// Dispatch that created this row; rows are never shared across dispatches.
    pub dispatch_id: String,
    pub kind: ActivityKind,
    pub status: ActivityStatus,
    pub target_url: String,
    /// Error from the most recent failed attempt.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Activity to be inserted by a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewActivity {
    pub pod_id: String,
    pub post_id: String,
    pub member_id: String,
    pub dispatch_id: String,
    pub kind: ActivityKind,
    pub target_url: String,
}
