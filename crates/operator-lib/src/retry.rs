//! Retry backoff policy
//!
//! `delay(attempt) = min(initial * multiplier^attempt, max)` with no jitter,
//! so the same attempt number always yields the same delay.

use std::time::Duration;

/// Default initial backoff (30 seconds)
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(30);

/// Default backoff cap (10 minutes)
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10 * 60);

/// Default multiplier between consecutive attempts
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Default number of pipeline retries before a VNF is marked permanently failed
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Exponential backoff configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            multiplier: DEFAULT_MULTIPLIER,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl BackoffPolicy {
    /// A policy that never waits, for driving state machines in tests
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
            max_backoff: Duration::ZERO,
            max_retries,
        }
    }

    /// Delay before retry number `attempt` (zero-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial_backoff.as_secs_f64() * factor;

        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }

        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Whether `retry_count` retries have used up the budget
    pub fn exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}
