//! Error types for browser automation.

use std::time::Duration;

use thiserror::Error;

/// Errors from one automation run.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Could not start a browser or open a page.
    #[error("failed to launch browser: {0}")]
    Launch(String),

    /// The target page did not finish loading in time.
    #[error("navigation to {url} timed out after {}s", after.as_secs())]
    NavigationTimeout { url: String, after: Duration },

    /// Navigation failed outright (DNS, TLS, aborted load).
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    /// No selector strategy resolved to a control.
    #[error("no {control} control found after trying {tried} selector strategies")]
    ActionControlNotFound { control: String, tried: usize },

    /// The target URL cannot be opened at all.
    #[error("invalid target URL: {0}")]
    InvalidTarget(String),

    /// No browser backend is available in this build.
    #[error("browser automation unavailable: {0}")]
    Unsupported(String),

    /// Any other browser protocol failure.
    #[error("browser error: {0}")]
    Browser(String),
}

impl ExecutorError {
    /// Whether another attempt in a fresh browser could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ExecutorError::InvalidTarget(_) | ExecutorError::Unsupported(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(
            ExecutorError::ActionControlNotFound {
                control: "repost".to_string(),
                tried: 3
            }
            .is_retryable()
        );
        assert!(
            ExecutorError::NavigationTimeout {
                url: "https://example.com".to_string(),
                after: Duration::from_secs(30)
            }
            .is_retryable()
        );
        assert!(!ExecutorError::InvalidTarget("ftp://x".to_string()).is_retryable());
        assert!(!ExecutorError::Unsupported("no backend".to_string()).is_retryable());
    }

    #[test]
    fn test_timeout_message() {
        let err = ExecutorError::NavigationTimeout {
            url: "https://example.com/p/1".to_string(),
            after: Duration::from_secs(30),
        };
        assert_eq!(
            err.to_string(),
            "navigation to https://example.com/p/1 timed out after 30s"
        );
    }
}
