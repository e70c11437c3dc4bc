//! Daemon configuration.

use std::path::PathBuf;
use std::time::Duration;

use chorus_browser::ExecutorConfig;
use chorus_pod::{DispatchError, StaggerPolicy};

/// Default seconds between staggered repost jobs.
pub const DEFAULT_STAGGER_SECS: u64 = 5;

/// Default jitter added to each stagger slot, in seconds.
pub const DEFAULT_STAGGER_JITTER_SECS: u64 = 0;

/// Default concurrent repost jobs per process.
pub const DEFAULT_REPOST_CONCURRENCY: usize = 2;

/// Default concurrent dispatch jobs per process.
pub const DEFAULT_DISPATCH_CONCURRENCY: usize = 1;

/// Default page navigation timeout in seconds.
pub const DEFAULT_NAV_TIMEOUT_SECS: u64 = 30;

/// Default seconds between reconciliation sweeps (5 minutes).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Default age in seconds after which a queued activity counts as stale (15 minutes).
pub const DEFAULT_STALE_AFTER_SECS: u64 = 900;

/// Configuration for the daemon.
#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    pub db_path: PathBuf,
    pub queue_path: PathBuf,
    pub broker_url: String,
    pub broker_api_key: String,
    /// Seconds between staggered jobs (default 5).
    pub stagger_secs: Option<u64>,
    /// Random jitter per slot in seconds, below the interval (default 0).
    pub stagger_jitter_secs: Option<u64>,
    /// Concurrent repost jobs (default 2).
    pub repost_concurrency: Option<usize>,
    /// Navigation timeout in seconds (default 30).
    pub nav_timeout_secs: Option<u64>,
    /// Reconciliation interval in seconds; 0 disables the sweep (default 300).
    pub sweep_interval_secs: Option<u64>,
    /// Staleness threshold in seconds (default 900).
    pub stale_after_secs: Option<u64>,
    /// Explicit Chromium binary.
    pub chrome_path: Option<PathBuf>,
    pub headed: bool,
}

impl DaemonConfig {
    pub fn stagger(&self) -> Result<StaggerPolicy, DispatchError> {
        StaggerPolicy::new(
            Duration::from_secs(self.stagger_secs.unwrap_or(DEFAULT_STAGGER_SECS)),
            Duration::from_secs(
                self.stagger_jitter_secs
                    .unwrap_or(DEFAULT_STAGGER_JITTER_SECS),
            ),
        )
    }

    pub fn repost_concurrency(&self) -> usize {
        self.repost_concurrency
            .unwrap_or(DEFAULT_REPOST_CONCURRENCY)
            .max(1)
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            nav_timeout: Duration::from_secs(
                self.nav_timeout_secs.unwrap_or(DEFAULT_NAV_TIMEOUT_SECS),
            ),
            ..ExecutorConfig::default()
        }
    }

    /// `None` when the sweep is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        match self
            .sweep_interval_secs
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS)
        {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs.unwrap_or(DEFAULT_STALE_AFTER_SECS))
    }
}
