//! Queue names, options and payloads.

use chorus_queue::{Backoff, JobOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::DispatchError;

/// Fan-out queue for incoming amplification triggers.
pub const DISPATCH_QUEUE: &str = "pod-dispatch";

/// Per-member repost queue.
pub const REPOST_QUEUE: &str = "pod-repost";

/// Three attempts, exponential backoff from 5 s.
pub fn dispatch_queue_options() -> JobOptions {
    JobOptions::new(3, Backoff::Exponential { delay_ms: 5_000 })
}

/// Two attempts, exponential backoff from 10 s. A repost is visible on the
/// platform, so it is retried sparingly.
pub fn repost_queue_options() -> JobOptions {
    JobOptions::new(2, Backoff::Exponential { delay_ms: 10_000 })
}

/// "This post was just published, amplify it."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmplificationRequest {
    pub post_id: String,
    pub post_url: String,
    pub pod_id: String,
    pub author_member_id: String,
    pub created_at: DateTime<Utc>,
}

impl AmplificationRequest {
    pub fn validate(&self) -> Result<(), DispatchError> {
        for (field, value) in [
            ("postId", &self.post_id),
            ("podId", &self.pod_id),
            ("authorMemberId", &self.author_member_id),
        ] {
            if value.trim().is_empty() {
                return Err(DispatchError::InvalidRequest(format!("{} is empty", field)));
            }
        }
        if !(self.post_url.starts_with("https://") || self.post_url.starts_with("http://")) {
            return Err(DispatchError::InvalidRequest(format!(
                "postUrl is not an http(s) URL: {}",
                self.post_url
            )));
        }
        Ok(())
    }

    /// Trigger job id. Re-sending the same publish event maps to the same job.
    pub fn job_id(&self) -> String {
        format!("{}:{}", self.post_id, self.created_at.timestamp_millis())
    }
}

/// Payload of one repost job. The job id is the activity id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepostJob {
    pub activity_id: String,
    pub member_id: String,
    pub target_url: String,
    pub account_credential_ref: String,
}

/// Result of one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub activities_created: usize,
    pub jobs_enqueued: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn request() -> AmplificationRequest {
        AmplificationRequest {
            post_id: "post-1".to_string(),
            post_url: "https://www.linkedin.com/feed/update/urn:li:activity:1".to_string(),
            pod_id: "pod-1".to_string(),
            author_member_id: "m-0".to_string(),
            created_at: DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn test_queue_options() {
        assert_eq!(dispatch_queue_options().max_attempts, 3);
        assert_eq!(repost_queue_options().max_attempts, 2);
        assert_eq!(
            repost_queue_options().backoff,
            Backoff::Exponential { delay_ms: 10_000 }
        );
    }

    #[test]
    fn test_request_wire_shape() {
        let value = serde_json::to_value(request()).unwrap();
        assert_eq!(value["postId"], "post-1");
        assert_eq!(value["authorMemberId"], "m-0");

        let decoded: AmplificationRequest = serde_json::from_value(json!({
            "postId": "p",
            "postUrl": "https://example.com/p",
            "podId": "pod",
            "authorMemberId": "a",
            "createdAt": "2026-01-02T03:04:05Z"
        }))
        .unwrap();
        assert_eq!(decoded.pod_id, "pod");
    }

    #[test]
    fn test_validate() {
        assert!(request().validate().is_ok());

        let mut missing_pod = request();
        missing_pod.pod_id = " ".to_string();
        assert!(matches!(
            missing_pod.validate(),
            Err(DispatchError::InvalidRequest(_))
        ));

        let mut bad_url = request();
        bad_url.post_url = "urn:li:activity:1".to_string();
        assert!(bad_url.validate().is_err());
    }

    #[test]
    fn test_job_id_is_stable() {
        assert_eq!(request().job_id(), request().job_id());
        assert_eq!(request().job_id(), "post-1:1767323045000");
    }

    #[test]
    fn test_repost_job_wire_shape() {
        let job = RepostJob {
            activity_id: "a".to_string(),
            member_id: "m".to_string(),
            target_url: "https://example.com".to_string(),
            account_credential_ref: "acc".to_string(),
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["accountCredentialRef"], "acc");
        assert_eq!(value["activityId"], "a");
    }
}
