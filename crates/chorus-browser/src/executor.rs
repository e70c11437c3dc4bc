//! The automation step machine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chorus_session::BrowserSession;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::{ActionPlan, ActionTarget, BrowserDriver, BrowserPage, ExecutorError, SelectorStrategy};

/// Performs one repost on behalf of one session.
#[async_trait]
pub trait RepostExecutor: Send + Sync {
    async fn execute(&self, session: &BrowserSession, target_url: &str) -> Result<(), ExecutorError>;
}

/// States of one automation run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Fresh browser and context are up; cookies go in.
    Launch,
    Navigate,
    LocateControl,
    Activate,
    /// Activate the follow-up control if the plan has one and it appears.
    Confirm,
    Settle,
    /// Always reached once a browser was launched.
    Close,
}

/// Timeouts and pacing for one run.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub nav_timeout: Duration,
    /// How long to keep retrying selector strategies for the main control.
    pub locate_timeout: Duration,
    /// How long to wait for an optional confirmation control.
    pub confirm_timeout: Duration,
    pub poll_interval: Duration,
    /// Pause after the last click so the platform can register it.
    pub settle: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            nav_timeout: Duration::from_secs(30),
            locate_timeout: Duration::from_secs(10),
            confirm_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(500),
            settle: Duration::from_secs(2),
        }
    }
}

/// What a successful run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub steps: Vec<Step>,
    /// Strategy that found the main control.
    pub control: Option<SelectorStrategy>,
    pub confirmed: bool,
}

/// Drives a [`BrowserDriver`] through an [`ActionPlan`].
pub struct AutomationExecutor {
    driver: Arc<dyn BrowserDriver>,
    plan: ActionPlan,
    config: ExecutorConfig,
}

impl AutomationExecutor {
    pub fn new(driver: Arc<dyn BrowserDriver>, plan: ActionPlan, config: ExecutorConfig) -> Self {
        Self {
            driver,
            plan: plan.without_confirm_overlap(),
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run the plan once in a brand-new browser.
    ///
    /// The page is closed on every path after a successful launch. A failed
    /// close after a successful action is logged, not returned, since the
    /// action already happened.
    #[instrument(skip(self, session), fields(account_ref = %session.account_ref))]
    pub async fn run(
        &self,
        session: &BrowserSession,
        target_url: &str,
    ) -> Result<ExecutionReport, ExecutorError> {
        validate_target(target_url)?;

        let mut page = self.driver.launch().await?;
        let mut report = ExecutionReport::default();
        let outcome = self
            .drive(page.as_mut(), session, target_url, &mut report)
            .await;

        report.steps.push(Step::Close);
        if let Err(e) = page.close().await {
            warn!(error = %e, "failed to close browser");
        }

        match outcome {
            Ok(()) => {
                info!(control = ?report.control, confirmed = report.confirmed, "action completed");
                Ok(report)
            }
            Err(e) => {
                debug!(error = %e, steps = ?report.steps, "action failed");
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        page: &mut dyn BrowserPage,
        session: &BrowserSession,
        target_url: &str,
        report: &mut ExecutionReport,
    ) -> Result<(), ExecutorError> {
        let mut step = Step::Launch;
        let mut control = None;

        while step != Step::Close {
            report.steps.push(step);
            step = match step {
                Step::Launch => {
                    page.set_cookies(&session.cookies).await?;
                    Step::Navigate
                }
                Step::Navigate => {
                    match timeout(self.config.nav_timeout, page.navigate(target_url)).await {
                        Ok(result) => result?,
                        Err(_) => {
                            return Err(ExecutorError::NavigationTimeout {
                                url: target_url.to_string(),
                                after: self.config.nav_timeout,
                            });
                        }
                    }
                    Step::LocateControl
                }
                Step::LocateControl => {
                    let found = self
                        .find(page, &self.plan.control, self.config.locate_timeout)
                        .await?;
                    control = Some(found.ok_or_else(|| ExecutorError::ActionControlNotFound {
                        control: self.plan.control.name.clone(),
                        tried: self.plan.control.strategies.len(),
                    })?);
                    Step::Activate
                }
                Step::Activate => {
                    if let Some(selector) = &control {
                        page.activate(selector).await?;
                    }
                    report.control = control.clone();
                    Step::Confirm
                }
                Step::Confirm => {
                    if let Some(confirm) = &self.plan.confirm {
                        match self.find(page, confirm, self.config.confirm_timeout).await? {
                            Some(selector) => {
                                page.activate(&selector).await?;
                                report.confirmed = true;
                            }
                            None => debug!(control = %confirm.name, "no confirmation shown"),
                        }
                    }
                    Step::Settle
                }
                Step::Settle => {
                    sleep(self.config.settle).await;
                    Step::Close
                }
                Step::Close => Step::Close,
            };
        }
        Ok(())
    }

    /// Try each strategy in order, re-polling until `wait` runs out.
    async fn find(
        &self,
        page: &mut dyn BrowserPage,
        target: &ActionTarget,
        wait: Duration,
    ) -> Result<Option<SelectorStrategy>, ExecutorError> {
        let deadline = Instant::now() + wait;
        loop {
            for strategy in &target.strategies {
                if page.locate(strategy).await? {
                    debug!(control = %target.name, %strategy, "control located");
                    return Ok(Some(strategy.clone()));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }
}

#[async_trait]
impl RepostExecutor for AutomationExecutor {
    async fn execute(&self, session: &BrowserSession, target_url: &str) -> Result<(), ExecutorError> {
        self.run(session, target_url).await.map(|_| ())
    }
}

fn validate_target(url: &str) -> Result<(), ExecutorError> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    match rest {
        Some(host_and_path) if !host_and_path.is_empty() => Ok(()),
        _ => Err(ExecutorError::InvalidTarget(url.to_string())),
    }
}
