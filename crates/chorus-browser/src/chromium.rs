//! Headless Chromium driver over the DevTools protocol.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chorus_session::SessionCookie;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, TimeSinceEpoch};
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{BrowserDriver, BrowserPage, ExecutorError, SelectorStrategy};

/// Interval between samples of the page's resource count.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Unchanged samples in a row that count as network idle (500 ms).
const IDLE_SAMPLES: usize = 3;

/// Give up waiting for idle after this long and carry on with a loaded page.
const IDLE_MAX: Duration = Duration::from_secs(5);

/// Launches one Chromium process per call, each with its own throwaway profile.
#[derive(Debug, Clone, Default)]
pub struct ChromiumDriver {
    /// Explicit browser binary; otherwise chromiumoxide searches the usual places.
    pub executable: Option<PathBuf>,
    pub headed: bool,
}

impl ChromiumDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn launch(&self) -> Result<Box<dyn BrowserPage>, ExecutorError> {
        let profile_dir = std::env::temp_dir().join(format!("chorus-browser-{}", Uuid::new_v4()));

        let mut builder = BrowserConfig::builder().user_data_dir(&profile_dir);
        if self.headed {
            builder = builder.with_head();
        }
        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(ExecutorError::Launch)?;

        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ExecutorError::Launch(e.to_string()))?;
        // The CDP connection only makes progress while this stream is polled.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                let _ = browser.close().await;
                handler_task.abort();
                remove_profile(&profile_dir).await;
                return Err(ExecutorError::Launch(e.to_string()));
            }
        };
        debug!(profile = %profile_dir.display(), "browser launched");

        Ok(Box::new(ChromiumPage {
            browser,
            page,
            handler_task,
            profile_dir,
        }))
    }
}

struct ChromiumPage {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    profile_dir: PathBuf,
}

impl ChromiumPage {
    /// Wait until the page stops fetching resources, up to [`IDLE_MAX`].
    ///
    /// CDP has no network-idle event, so the number of resource timing
    /// entries is sampled until it holds still for a short window.
    async fn wait_for_network_idle(&self) {
        let deadline = tokio::time::Instant::now() + IDLE_MAX;
        let mut samples = Vec::new();
        while tokio::time::Instant::now() < deadline {
            let count = match self
                .page
                .evaluate("performance.getEntriesByType('resource').length")
                .await
                .map(|r| r.into_value::<u64>())
            {
                Ok(Ok(count)) => count,
                _ => {
                    debug!("resource count unavailable, not waiting for idle");
                    return;
                }
            };
            samples.push(count);
            if is_idle(&samples) {
                return;
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
        debug!("network still busy, continuing with loaded page");
    }

    async fn find(&self, selector: &SelectorStrategy) -> Option<Element> {
        let found = match selector {
            SelectorStrategy::Css(css) => self.page.find_element(css.as_str()).await,
            SelectorStrategy::AriaLabel(label) => {
                let css = format!("button[aria-label*=\"{}\"]", escape_quotes(label));
                self.page.find_element(css).await
            }
            SelectorStrategy::Text(text) => {
                let xpath = format!(
                    "//button[contains(normalize-space(.), {})]",
                    xpath_literal(text)
                );
                self.page.find_xpath(xpath).await
            }
        };
        found.ok()
    }
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    async fn set_cookies(&mut self, cookies: &[SessionCookie]) -> Result<(), ExecutorError> {
        let params = cookies
            .iter()
            .map(|cookie| {
                let mut builder = CookieParam::builder()
                    .name(cookie.name.clone())
                    .value(cookie.value.clone())
                    .domain(cookie.domain.clone())
                    .path(cookie.path.clone())
                    .secure(cookie.secure)
                    .http_only(cookie.http_only);
                if let Some(expires) = cookie.expires {
                    builder = builder.expires(TimeSinceEpoch::new(expires));
                }
                builder.build().map_err(ExecutorError::Browser)
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.page
            .set_cookies(params)
            .await
            .map_err(|e| ExecutorError::Browser(e.to_string()))?;
        Ok(())
    }

    async fn navigate(&mut self, url: &str) -> Result<(), ExecutorError> {
        let failed = |e: chromiumoxide::error::CdpError| ExecutorError::Navigation {
            url: url.to_string(),
            reason: e.to_string(),
        };
        self.page.goto(url).await.map_err(failed)?;
        self.page.wait_for_navigation().await.map_err(failed)?;
        self.wait_for_network_idle().await;
        Ok(())
    }

    async fn locate(&mut self, selector: &SelectorStrategy) -> Result<bool, ExecutorError> {
        Ok(self.find(selector).await.is_some())
    }

    async fn activate(&mut self, selector: &SelectorStrategy) -> Result<(), ExecutorError> {
        let element = self.find(selector).await.ok_or_else(|| {
            ExecutorError::Browser(format!("control {} disappeared before click", selector))
        })?;
        element
            .click()
            .await
            .map_err(|e| ExecutorError::Browser(e.to_string()))?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), ExecutorError> {
        let ChromiumPage {
            mut browser,
            page,
            handler_task,
            profile_dir,
        } = *self;

        if let Err(e) = page.close().await {
            debug!(error = %e, "page close failed, closing browser anyway");
        }
        let closed = browser.close().await;
        if closed.is_ok() {
            let _ = browser.wait().await;
        }
        handler_task.abort();
        remove_profile(&profile_dir).await;

        closed
            .map(|_| ())
            .map_err(|e| ExecutorError::Browser(e.to_string()))
    }
}

async fn remove_profile(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(profile = %dir.display(), error = %e, "failed to remove browser profile");
        }
    }
}

fn escape_quotes(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// XPath 1.0 has no escapes; pick a quote the text does not contain.
fn xpath_literal(s: &str) -> String {
    if !s.contains('"') {
        format!("\"{}\"", s)
    } else if !s.contains('\'') {
        format!("'{}'", s)
    } else {
        let parts: Vec<String> = s.split('"').map(|p| format!("\"{}\"", p)).collect();
        format!("concat({})", parts.join(", '\"', "))
    }
}

/// Whether the last [`IDLE_SAMPLES`] resource counts are identical.
fn is_idle(samples: &[u64]) -> bool {
    samples.len() >= IDLE_SAMPLES
        && samples[samples.len() - IDLE_SAMPLES..]
            .windows(2)
            .all(|w| w[0] == w[1])
}
