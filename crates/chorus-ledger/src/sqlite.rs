//! SQLite implementation of the pod store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};

use crate::{
    ActivityKind, ActivityStatus, LedgerError, NewActivity, OnboardingStatus, Pod, PodActivity,
    PodMember, PodStore,
};

const MEMBER_COLUMNS: &str =
    "id, pod_id, user_id, account_ref, active, onboarding_status, created_at";

const ACTIVITY_COLUMNS: &str = "id, pod_id, post_id, member_id, dispatch_id, kind, status, \
                                target_url, error, created_at, started_at, completed_at";

/// SQLite-backed pod store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;

        // Enable WAL mode for concurrent readers across worker processes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self::init(conn)?;
        info!(path = %path.display(), "ledger database initialized");
        Ok(store)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS pods (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pod_members (
                id TEXT PRIMARY KEY,
                pod_id TEXT NOT NULL REFERENCES pods(id),
                user_id TEXT NOT NULL,
                account_ref TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                onboarding_status TEXT NOT NULL DEFAULT 'invited',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_members_pod ON pod_members(pod_id);

            CREATE TABLE IF NOT EXISTS pod_activities (
                id TEXT PRIMARY KEY,
                pod_id TEXT NOT NULL REFERENCES pods(id),
                post_id TEXT NOT NULL,
                member_id TEXT NOT NULL REFERENCES pod_members(id),
                dispatch_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                target_url TEXT NOT NULL,
                error TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                UNIQUE (dispatch_id, member_id)
            );
            CREATE INDEX IF NOT EXISTS idx_activities_post ON pod_activities(post_id);
            CREATE INDEX IF NOT EXISTS idx_activities_status ON pod_activities(status, created_at);
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::LockPoisoned)
    }

    // =========================================================================
    // Pods and members
    // =========================================================================

    /// Create a pod.
    pub fn create_pod(&self, tenant_id: &str, name: &str) -> Result<Pod, LedgerError> {
        let pod = Pod {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            created_at: Utc::now().trunc_subsecs(3),
        };
        self.lock()?.execute(
            "INSERT INTO pods (id, tenant_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![pod.id, pod.tenant_id, pod.name, timestamp(pod.created_at)],
        )?;
        info!(pod_id = %pod.id, tenant_id, "created pod");
        Ok(pod)
    }

    /// Get a pod by id.
    pub fn get_pod(&self, pod_id: &str) -> Result<Option<Pod>, LedgerError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, tenant_id, name, created_at FROM pods WHERE id = ?1",
                params![pod_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, tenant_id, name, created_at)| {
            Ok(Pod {
                id,
                tenant_id,
                name,
                created_at: parse_timestamp(&created_at)?,
            })
        })
        .transpose()
    }

    /// Add a member to a pod.
    pub fn add_member(
        &self,
        pod_id: &str,
        user_id: &str,
        account_ref: &str,
        active: bool,
        onboarding_status: OnboardingStatus,
    ) -> Result<PodMember, LedgerError> {
        let member = PodMember {
            id: uuid::Uuid::new_v4().to_string(),
            pod_id: pod_id.to_string(),
            user_id: user_id.to_string(),
            account_ref: account_ref.to_string(),
            active,
            onboarding_status,
            created_at: Utc::now().trunc_subsecs(3),
        };
        self.lock()?.execute(
            "INSERT INTO pod_members (id, pod_id, user_id, account_ref, active, onboarding_status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                member.id,
                member.pod_id,
                member.user_id,
                member.account_ref,
                member.active,
                member.onboarding_status.as_str(),
                timestamp(member.created_at),
            ],
        )?;
        debug!(pod_id, member_id = %member.id, "added pod member");
        Ok(member)
    }

    /// Turn a member's participation on or off.
    pub fn set_member_active(&self, member_id: &str, active: bool) -> Result<(), LedgerError> {
        let updated = self.lock()?.execute(
            "UPDATE pod_members SET active = ?2 WHERE id = ?1",
            params![member_id, active],
        )?;
        require_updated(updated, "member", member_id)
    }

    /// Record onboarding progress for a member.
    pub fn set_onboarding_status(
        &self,
        member_id: &str,
        status: OnboardingStatus,
    ) -> Result<(), LedgerError> {
        let updated = self.lock()?.execute(
            "UPDATE pod_members SET onboarding_status = ?2 WHERE id = ?1",
            params![member_id, status.as_str()],
        )?;
        require_updated(updated, "member", member_id)
    }

    /// All members of a pod, oldest first.
    pub fn members(&self, pod_id: &str) -> Result<Vec<PodMember>, LedgerError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM pod_members WHERE pod_id = ?1 ORDER BY created_at, rowid",
            MEMBER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![pod_id], RawMember::from_row)?;
        rows.map(|r| PodMember::try_from(r?)).collect()
    }

    // =========================================================================
    // Activities
    // =========================================================================

    /// Move an activity to `next` if its current status allows it.
    fn transition(
        &self,
        id: &str,
        next: ActivityStatus,
        error: Option<&str>,
    ) -> Result<PodActivity, LedgerError> {
        let sources = ActivityStatus::sources_for(next)
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE pod_activities
             SET status = ?2,
                 started_at = CASE WHEN ?2 = 'processing' THEN ?3 ELSE started_at END,
                 completed_at = CASE WHEN ?2 = 'processing' THEN NULL ELSE ?3 END,
                 error = ?4
             WHERE id = ?1 AND status IN ({})
             RETURNING {}",
            sources, ACTIVITY_COLUMNS
        );

        let raw = {
            let conn = self.lock()?;
            conn.query_row(
                &sql,
                params![id, next.as_str(), timestamp(Utc::now()), error],
                RawActivity::from_row,
            )
            .optional()?
        };

        match raw {
            Some(raw) => {
                let activity = PodActivity::try_from(raw)?;
                debug!(activity_id = %id, status = %next, "activity status updated");
                Ok(activity)
            }
            None => match self.get_activity_sync(id)? {
                Some(current) => Err(LedgerError::InvalidTransition {
                    id: id.to_string(),
                    from: current.status,
                    to: next,
                }),
                None => Err(LedgerError::NotFound {
                    kind: "activity",
                    id: id.to_string(),
                }),
            },
        }
    }

    fn get_activity_sync(&self, id: &str) -> Result<Option<PodActivity>, LedgerError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM pod_activities WHERE id = ?1",
            ACTIVITY_COLUMNS
        );
        conn.query_row(&sql, params![id], RawActivity::from_row)
            .optional()?
            .map(PodActivity::try_from)
            .transpose()
    }

    fn query_activities(
        &self,
        filter: &str,
        param: &str,
    ) -> Result<Vec<PodActivity>, LedgerError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM pod_activities WHERE {} ORDER BY created_at, rowid",
            ACTIVITY_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![param], RawActivity::from_row)?;
        rows.map(|r| PodActivity::try_from(r?)).collect()
    }
}

#[async_trait]
impl PodStore for SqliteStore {
    async fn eligible_members(
        &self,
        pod_id: &str,
        author_member_id: &str,
    ) -> Result<Vec<PodMember>, LedgerError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM pod_members
             WHERE pod_id = ?1 AND active = 1 AND onboarding_status = 'complete' AND id != ?2
             ORDER BY created_at, rowid",
            MEMBER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![pod_id, author_member_id], RawMember::from_row)?;
        rows.map(|r| PodMember::try_from(r?)).collect()
    }

    async fn get_member(&self, member_id: &str) -> Result<Option<PodMember>, LedgerError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM pod_members WHERE id = ?1", MEMBER_COLUMNS);
        conn.query_row(&sql, params![member_id], RawMember::from_row)
            .optional()?
            .map(PodMember::try_from)
            .transpose()
    }

    async fn insert_activities(
        &self,
        activities: Vec<NewActivity>,
    ) -> Result<Vec<PodActivity>, LedgerError> {
        let now = Utc::now().trunc_subsecs(3);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut created = Vec::with_capacity(activities.len());

        for new in activities {
            let activity = PodActivity {
                id: uuid::Uuid::new_v4().to_string(),
                pod_id: new.pod_id,
                post_id: new.post_id,
                member_id: new.member_id,
                dispatch_id: new.dispatch_id,
                kind: new.kind,
                status: ActivityStatus::Queued,
                target_url: new.target_url,
                error: None,
                created_at: now,
                started_at: None,
                completed_at: None,
            };
            tx.execute(
                "INSERT INTO pod_activities
                    (id, pod_id, post_id, member_id, dispatch_id, kind, status, target_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7, ?8)",
                params![
                    activity.id,
                    activity.pod_id,
                    activity.post_id,
                    activity.member_id,
                    activity.dispatch_id,
                    activity.kind.as_str(),
                    activity.target_url,
                    timestamp(activity.created_at),
                ],
            )?;
            created.push(activity);
        }

        tx.commit()?;
        Ok(created)
    }

    async fn get_activity(&self, id: &str) -> Result<Option<PodActivity>, LedgerError> {
        self.get_activity_sync(id)
    }

    async fn mark_processing(&self, id: &str) -> Result<PodActivity, LedgerError> {
        self.transition(id, ActivityStatus::Processing, None)
    }

    async fn mark_completed(&self, id: &str) -> Result<PodActivity, LedgerError> {
        self.transition(id, ActivityStatus::Completed, None)
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<PodActivity, LedgerError> {
        self.transition(id, ActivityStatus::Failed, Some(error))
    }

    async fn stale_queued(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<PodActivity>, LedgerError> {
        self.query_activities(
            "status = 'queued' AND created_at < ?1",
            &timestamp(created_before),
        )
    }

    async fn stale_processing(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<PodActivity>, LedgerError> {
        self.query_activities(
            "status = 'processing' AND started_at < ?1",
            &timestamp(started_before),
        )
    }

    async fn activities_for_post(&self, post_id: &str) -> Result<Vec<PodActivity>, LedgerError> {
        self.query_activities("post_id = ?1", post_id)
    }
}

/// Fixed-width RFC 3339 so that string order matches time order.
fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LedgerError::Corrupt(format!("bad timestamp {}: {}", s, e)))
}

fn require_updated(updated: usize, kind: &'static str, id: &str) -> Result<(), LedgerError> {
    if updated == 0 {
        return Err(LedgerError::NotFound {
            kind,
            id: id.to_string(),
        });
    }
    Ok(())
}

struct RawMember {
    id: String,
    pod_id: String,
    user_id: String,
    account_ref: String,
    active: bool,
    onboarding_status: String,
    created_at: String,
}

impl RawMember {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            pod_id: row.get(1)?,
            user_id: row.get(2)?,
            account_ref: row.get(3)?,
            active: row.get(4)?,
            onboarding_status: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

impl TryFrom<RawMember> for PodMember {
    type Error = LedgerError;

    fn try_from(raw: RawMember) -> Result<Self, Self::Error> {
        let onboarding_status = OnboardingStatus::parse(&raw.onboarding_status).ok_or_else(|| {
            LedgerError::Corrupt(format!(
                "member {} has onboarding status {}",
                raw.id, raw.onboarding_status
            ))
        })?;
        Ok(PodMember {
            created_at: parse_timestamp(&raw.created_at)?,
            id: raw.id,
            pod_id: raw.pod_id,
            user_id: raw.user_id,
            account_ref: raw.account_ref,
            active: raw.active,
            onboarding_status,
        })
    }
}

struct RawActivity {
    id: String,
    pod_id: String,
    post_id: String,
    member_id: String,
    dispatch_id: String,
    kind: String,
    status: String,
    target_url: String,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl RawActivity {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            pod_id: row.get(1)?,
            post_id: row.get(2)?,
            member_id: row.get(3)?,
            dispatch_id: row.get(4)?,
            kind: row.get(5)?,
            status: row.get(6)?,
            target_url: row.get(7)?,
            error: row.get(8)?,
            created_at: row.get(9)?,
            started_at: row.get(10)?,
            completed_at: row.get(11)?,
        })
    }
}

impl TryFrom<RawActivity> for PodActivity {
    type Error = LedgerError;

    fn try_from(raw: RawActivity) -> Result<Self, Self::Error> {
        let kind = ActivityKind::parse(&raw.kind).ok_or_else(|| {
            LedgerError::Corrupt(format!("activity {} has kind {}", raw.id, raw.kind))
        })?;
        let status = ActivityStatus::parse(&raw.status).ok_or_else(|| {
            LedgerError::Corrupt(format!("activity {} has status {}", raw.id, raw.status))
        })?;
        Ok(PodActivity {
            kind,
            status,
            created_at: parse_timestamp(&raw.created_at)?,
            started_at: raw.started_at.as_deref().map(parse_timestamp).transpose()?,
            completed_at: raw
                .completed_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            id: raw.id,
            pod_id: raw.pod_id,
            post_id: raw.post_id,
            member_id: raw.member_id,
            dispatch_id: raw.dispatch_id,
            target_url: raw.target_url,
            error: raw.error,
        })
    }
}
