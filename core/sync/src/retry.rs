//! Retry timing for failed queue drains.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long the executor waits before draining again after a failure.
///
/// The default is a fixed five minute interval. Exponential backoff and
/// jitter can be enabled for deployments where many clients might retry
/// against the same remote at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub interval: Duration,
    /// Upper bound for the delay once backoff kicks in.
    pub max_interval: Duration,
    /// Growth factor per consecutive failure. `1.0` keeps the delay fixed.
    pub backoff_multiplier: f64,
    /// Whether to spread delays by +/- 25%.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Five minutes between attempts.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

    /// A policy that always waits `interval`.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Set maximum delay.
    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the retry that follows `failures` consecutive failed drains.
    ///
    /// `failures` counts from 1; zero is treated as one.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.interval.as_millis() as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        let cap = self.max_interval.max(self.interval).as_millis() as f64;
        let capped = base.min(cap);

        let delay = if self.jitter {
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped * jitter_factor
        } else {
            capped
        };

        Duration::from_millis(delay as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Self::DEFAULT_INTERVAL)
    }
}
