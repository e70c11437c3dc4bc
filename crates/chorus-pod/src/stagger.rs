//! Spacing between the jobs of one dispatch.

use std::time::Duration;

use rand::Rng;

use crate::DispatchError;

/// Constant-interval schedule with optional random jitter.
///
/// Job `i` of a batch is delayed by `i * interval`, plus a uniform random
/// offset below `jitter`. Jitter must stay below the interval so delays keep
/// strictly increasing with batch index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaggerPolicy {
    interval: Duration,
    jitter: Duration,
}

impl StaggerPolicy {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

    pub fn new(interval: Duration, jitter: Duration) -> Result<Self, DispatchError> {
        if interval.is_zero() {
            return Err(DispatchError::InvalidRequest(
                "stagger interval must be positive".to_string(),
            ));
        }
        if jitter >= interval {
            return Err(DispatchError::InvalidRequest(format!(
                "stagger jitter ({}ms) must be below the interval ({}ms)",
                jitter.as_millis(),
                interval.as_millis()
            )));
        }
        Ok(Self { interval, jitter })
    }

    /// Fixed interval, no jitter.
    pub fn fixed(interval: Duration) -> Result<Self, DispatchError> {
        Self::new(interval, Duration::ZERO)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn jitter(&self) -> Duration {
        self.jitter
    }

    /// Base delay for the job at `index`, before jitter.
    pub fn base_delay(&self, index: usize) -> Duration {
        let millis = (self.interval.as_millis() as u64).saturating_mul(index as u64);
        Duration::from_millis(millis)
    }

    /// Delays for a batch of `count` jobs.
    pub fn schedule(&self, count: usize) -> Vec<Duration> {
        self.schedule_with(count, &mut rand::thread_rng())
    }

    pub fn schedule_with<R: Rng>(&self, count: usize, rng: &mut R) -> Vec<Duration> {
        let jitter_ms = self.jitter.as_millis() as u64;
        (0..count)
            .map(|index| {
                let offset = if jitter_ms == 0 {
                    0
                } else {
                    rng.gen_range(0..jitter_ms)
                };
                self.base_delay(index) + Duration::from_millis(offset)
            })
            .collect()
    }
}

impl Default for StaggerPolicy {
    fn default() -> Self {
        Self {
            interval: Self::DEFAULT_INTERVAL,
            jitter: Duration::ZERO,
        }
    }
}
