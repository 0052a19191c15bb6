//! Exponential backoff with jitter, bounded by attempts and total delay.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::review::InvocationError;

/// Retry limits. Base and cap come from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Cap on a single backoff delay.
    pub max_delay_ms: u64,
    /// Cap on the sum of all delays for one call.
    pub max_total_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_total_delay_ms: 60_000,
        }
    }
}

/// What the executor should do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp { reason: String },
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`, before jitter: `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let raw = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(raw.min(self.max_delay_ms))
    }

    /// Decide after `attempt` attempts have failed, the last with `err`.
    ///
    /// `spent` is the delay already slept for this call. `jitter` is a
    /// uniform sample in `[0, 1)`; equal jitter keeps at least half of the
    /// exponential backoff.
    pub fn decide(
        &self,
        attempt: u32,
        err: &InvocationError,
        spent: Duration,
        jitter: f64,
    ) -> RetryDecision {
        if !err.is_transient() {
            return RetryDecision::GiveUp {
                reason: format!("fatal error ({})", err.kind),
            };
        }
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: "max attempts reached".to_string(),
            };
        }

        let backoff = self.backoff(attempt).as_millis() as u64;
        let half = backoff / 2;
        let jitter = jitter.clamp(0.0, 1.0);
        let mut delay_ms = half + (half as f64 * jitter) as u64;
        if let Some(hint) = err.retry_after_ms {
            delay_ms = delay_ms.max(hint);
        }
        delay_ms = delay_ms.min(self.max_delay_ms);

        let spent_ms = spent.as_millis() as u64;
        if spent_ms.saturating_add(delay_ms) > self.max_total_delay_ms {
            return RetryDecision::GiveUp {
                reason: "retry delay budget exhausted".to_string(),
            };
        }
        RetryDecision::Retry {
            delay: Duration::from_millis(delay_ms),
        }
    }
}
