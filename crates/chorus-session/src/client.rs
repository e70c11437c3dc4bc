//! HTTP client for the session broker.

use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::{BrokerCredentials, BrowserSession, CookieDefaults, SessionError};

/// Broker account statuses that mean the stored login is gone.
const DEAD_STATUSES: &[&str] = &["expired", "revoked", "credentials", "disconnected", "stopped"];

/// Turns an account reference into a usable browser session.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    /// Resolve a live session for `account_ref`.
    ///
    /// Fails with [`SessionError::CredentialUnavailable`] when the broker has
    /// nothing usable for this account.
    async fn resolve(&self, account_ref: &str) -> Result<BrowserSession, SessionError>;
}

/// Connection settings for the session broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub base_url: String,
    pub api_key: String,
    pub cookie_defaults: CookieDefaults,
    pub request_timeout: Duration,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    pub retry_initial_interval: Duration,
}

impl BrokerConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            cookie_defaults: CookieDefaults::default(),
            request_timeout: Duration::from_secs(15),
            max_retries: 2,
            retry_initial_interval: Duration::from_millis(500),
        }
    }
}

/// Session broker client.
pub struct BrokerClient {
    http: Client,
    base: Url,
    config: BrokerConfig,
}

impl BrokerClient {
    pub fn new(config: BrokerConfig) -> Result<Self, SessionError> {
        if config.base_url.trim().is_empty() {
            return Err(SessionError::Config("broker base URL is empty".to_string()));
        }
        if config.api_key.trim().is_empty() {
            return Err(SessionError::Config("broker API key is empty".to_string()));
        }

        let base = Url::parse(config.base_url.trim())
            .map_err(|e| SessionError::Config(format!("invalid broker base URL: {}", e)))?;
        if base.cannot_be_a_base() {
            return Err(SessionError::Config(format!(
                "broker base URL cannot carry a path: {}",
                base
            )));
        }

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { http, base, config })
    }

    /// `{base}/api/v1/accounts/{account_ref}/session` with the reference
    /// encoded as a single path segment.
    fn session_url(&self, account_ref: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["api", "v1", "accounts", account_ref, "session"]);
        }
        url
    }

    /// One request, no retries.
    async fn fetch_once(&self, account_ref: &str) -> Result<BrowserSession, SessionError> {
        let response = self
            .http
            .get(self.session_url(account_ref))
            .header("X-API-KEY", &self.config.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                return Err(SessionError::CredentialUnavailable {
                    account_ref: account_ref.to_string(),
                    reason: format!("broker has no session ({})", status.as_u16()),
                });
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(SessionError::Auth(format!(
                    "broker rejected API key ({})",
                    status.as_u16()
                )));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_secs = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse().ok());
                return Err(SessionError::RateLimited { retry_after_secs });
            }
            _ => {}
        }

        if !status.is_success() {
            // Body may echo request details; keep only the status.
            return Err(SessionError::Broker {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            });
        }

        let body: Value = response.json().await?;
        if let Some(state) = body.get("status").and_then(Value::as_str) {
            let state = state.to_ascii_lowercase();
            if DEAD_STATUSES.contains(&state.as_str()) {
                return Err(SessionError::CredentialUnavailable {
                    account_ref: account_ref.to_string(),
                    reason: format!("account status is {}", state),
                });
            }
        }

        let credentials: BrokerCredentials = serde_json::from_value(body)?;
        credentials
            .into_session(account_ref, &self.config.cookie_defaults)
            .ok_or_else(|| SessionError::CredentialUnavailable {
                account_ref: account_ref.to_string(),
                reason: "broker returned no usable cookies or token".to_string(),
            })
    }
}

#[async_trait]
impl SessionResolver for BrokerClient {
    #[instrument(skip(self))]
    async fn resolve(&self, account_ref: &str) -> Result<BrowserSession, SessionError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.retry_initial_interval,
            max_interval: Duration::from_secs(10),
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            match self.fetch_once(account_ref).await {
                Ok(session) => {
                    debug!(
                        account_ref,
                        cookies = session.cookies.len(),
                        source = ?session.source,
                        "resolved session"
                    );
                    return Ok(session);
                }
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let wait = backoff
                        .next_backoff()
                        .unwrap_or(self.config.retry_initial_interval);
                    warn!(
                        account_ref,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "transient broker error, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
