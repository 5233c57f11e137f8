//! Retry policy and the retry-or-dead-letter decision.
//!
//! A failed attempt increments `retry_count`; the job is retried while
//! `retry_count <= max_retries` and dead-lettered otherwise. Retries wait
//! for a backoff delay that never decreases with the attempt number.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RETRY_STRATEGY` | `exponential` | `fixed` or `exponential` |
//! | `RETRY_BASE_DELAY_MS` | `1000` | First (or every, for fixed) delay |
//! | `RETRY_MAX_DELAY_MS` | `300000` | Cap on any single delay |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::{Error, Result};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay for every attempt.
    Fixed,
    /// `base * 2^(n-1)`, capped.
    #[default]
    Exponential,
}

impl FromStr for BackoffStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffStrategy::Fixed),
            "exponential" => Ok(BackoffStrategy::Exponential),
            other => Err(Error::Config(format!("unknown retry strategy: {}", other))),
        }
    }
}

/// Backoff configuration applied by `fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_millis(defaults::RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(defaults::RETRY_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let strategy = std::env::var("RETRY_STRATEGY")
            .ok()
            .and_then(|v| v.parse::<BackoffStrategy>().ok())
            .unwrap_or_default();

        let base_delay_ms = std::env::var("RETRY_BASE_DELAY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::RETRY_BASE_DELAY_MS);

        let max_delay_ms = std::env::var("RETRY_MAX_DELAY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::RETRY_MAX_DELAY_MS)
            .max(base_delay_ms);

        Self {
            strategy,
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
        }
    }

    /// Retries become claimable again immediately.
    pub fn immediate() -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Delay before attempt `retry_count` (1-based) becomes claimable.
    pub fn delay_for(&self, retry_count: i32) -> Duration {
        if retry_count <= 0 {
            return Duration::ZERO;
        }
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let shift = (retry_count - 1).min(31) as u32;
                self.base_delay
                    .checked_mul(1u32 << shift)
                    .unwrap_or(self.max_delay)
            }
        };
        delay.min(self.max_delay)
    }

    /// Decide what happens to a job whose `retry_count` was just incremented.
    pub fn decide(&self, retry_count: i32, max_retries: i32) -> RetryDecision {
        if retry_count <= max_retries {
            RetryDecision::Retry {
                delay: self.delay_for(retry_count),
            }
        } else {
            RetryDecision::DeadLetter
        }
    }
}

/// Routing decision for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return to the queue after `delay` (zero means pending right away).
    Retry { delay: Duration },
    /// Budget exhausted.
    DeadLetter,
}
