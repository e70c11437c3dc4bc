//! Error types for session resolution.

use thiserror::Error;

/// Errors that can occur when resolving a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The broker has no live session for this account (expired, revoked or
    /// never authenticated). Retrying will not help.
    #[error("credential unavailable for account {account_ref}: {reason}")]
    CredentialUnavailable { account_ref: String, reason: String },

    /// The broker rejected our own API key.
    #[error("broker authentication failed: {0}")]
    Auth(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Rate limited by the broker.
    #[error("rate limited by broker{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited { retry_after_secs: Option<u64> },

    /// Broker returned an unexpected status.
    #[error("broker error ({status}): {message}")]
    Broker { status: u16, message: String },

    /// Invalid client configuration.
    #[error("invalid broker configuration: {0}")]
    Config(String),
}

impl SessionError {
    /// Whether a later attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::CredentialUnavailable { .. }
            | SessionError::Auth(_)
            | SessionError::Config(_) => false,
            SessionError::Http(_) | SessionError::Json(_) | SessionError::RateLimited { .. } => {
                true
            }
            SessionError::Broker { status, .. } => *status >= 500,
        }
    }

    /// Whether this is a transient failure worth retrying inside one resolve call.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            SessionError::Http(e) => e.is_timeout() || e.is_connect(),
            SessionError::Broker { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
