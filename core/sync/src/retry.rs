//! Backoff policy for transient remote failures.
//!
//! Only errors classified as retryable (connectivity, throttling, timeouts,
//! service outages) are retried; everything else surfaces on the first try.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use fitsync_common::duration::millis;
use fitsync_common::{Error, Result};

/// How often and how patiently a remote call is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; zero disables retrying.
    pub max_retries: u32,
    /// Backoff before the first retry.
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Upper bound for any single backoff, including throttling hints.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Growth factor between consecutive backoffs.
    pub backoff_multiplier: f64,
    /// Spread each backoff uniformly over 75%..125% of its nominal value.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Fail on the first error.
    pub fn none() -> Self {
        Self::new(0)
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff before retry number `retry` (zero-based).
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let nominal_ms = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped_ms = nominal_ms.min(self.max_delay.as_millis() as f64);

        let spread = if self.jitter {
            0.75 + rand::random::<f64>() * 0.5
        } else {
            1.0
        };
        Duration::from_millis((capped_ms * spread) as u64)
    }

    /// Backoff before retry number `retry` following `err`.
    ///
    /// A longer `retry_after` hint replaces the computed backoff; both are
    /// bounded by `max_delay`.
    pub fn delay_after(&self, retry: u32, err: &Error) -> Duration {
        let backoff = self.delay_for_attempt(retry);
        err.retry_after()
            .map_or(backoff, |hint| hint.max(backoff).min(self.max_delay))
    }
}

/// Runs a remote call under a [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Call `operation` until it succeeds, fails terminally, or the retry
    /// allowance is spent. The last error is returned unchanged.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            let err = match operation().await {
                Ok(value) => {
                    if retries > 0 {
                        debug!("Remote call succeeded on retry {}", retries);
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            if retries >= self.config.max_retries {
                if self.config.max_retries > 0 {
                    warn!("Giving up after {} retries: {}", retries, err);
                }
                return Err(err);
            }

            let delay = self.config.delay_after(retries, &err);
            retries += 1;
            warn!("Transient failure ({}), retry {} in {:?}", err, retries, delay);
            tokio::time::sleep(delay).await;
        }
    }
}
