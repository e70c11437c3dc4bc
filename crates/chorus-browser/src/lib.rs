//! Browser automation for a single engagement action.
//!
//! [`AutomationExecutor`] walks one isolated browser page through an explicit
//! sequence of steps (see [`Step`]) and always closes the page, whatever the
//! outcome. The browser itself sits behind [`BrowserDriver`] so the step
//! machine can be exercised without a real Chromium; the CDP-backed driver is
//! compiled with the `chromium` feature.

#[cfg(feature = "chromium")]
mod chromium;
mod driver;
mod error;
mod executor;
mod plan;

#[cfg(feature = "chromium")]
pub use chromium::ChromiumDriver;
pub use driver::{BrowserDriver, BrowserPage, UnavailableDriver};
pub use error::ExecutorError;
pub use executor::{AutomationExecutor, ExecutionReport, ExecutorConfig, RepostExecutor, Step};
pub use plan::{ActionPlan, ActionTarget, SelectorStrategy};
