//! The seam between the step machine and a real browser.

use async_trait::async_trait;
use chorus_session::SessionCookie;

use crate::{ExecutorError, SelectorStrategy};

/// Starts isolated browser pages.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Launch a fresh browser instance with an unshared context and one blank page.
    ///
    /// Nothing launched here may be reused by another call.
    async fn launch(&self) -> Result<Box<dyn BrowserPage>, ExecutorError>;
}

/// One page inside an isolated browser instance.
#[async_trait]
pub trait BrowserPage: Send {
    /// Add cookies to this page's context.
    async fn set_cookies(&mut self, cookies: &[SessionCookie]) -> Result<(), ExecutorError>;

    /// Load `url` and wait until the page has settled. Callers bound this with a timeout.
    async fn navigate(&mut self, url: &str) -> Result<(), ExecutorError>;

    /// Whether `selector` currently matches a control on the page.
    async fn locate(&mut self, selector: &SelectorStrategy) -> Result<bool, ExecutorError>;

    /// Click the first control matching `selector`.
    async fn activate(&mut self, selector: &SelectorStrategy) -> Result<(), ExecutorError>;

    /// Tear down the page, its context and the browser process.
    async fn close(self: Box<Self>) -> Result<(), ExecutorError>;
}

/// Driver used when the binary was built without a browser backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableDriver;

#[async_trait]
impl BrowserDriver for UnavailableDriver {
    async fn launch(&self) -> Result<Box<dyn BrowserPage>, ExecutorError> {
        Err(ExecutorError::Unsupported(
            "no browser backend compiled in (enable the `chromium` feature)".to_string(),
        ))
    }
}
