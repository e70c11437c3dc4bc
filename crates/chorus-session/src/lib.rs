//! Session resolution for pod member accounts.
//!
//! A third-party session broker holds each member's platform login. This
//! crate asks the broker for a live session and normalizes whatever shape it
//! returns (a cookie list, or a single opaque session token) into a
//! [`BrowserSession`] that can be injected into a fresh browser context.

mod client;
mod error;
mod types;

pub use client::{BrokerClient, BrokerConfig, SessionResolver};
pub use error::SessionError;
pub use types::{BrokerCredentials, BrowserSession, CookieDefaults, SessionCookie, SessionSource};
