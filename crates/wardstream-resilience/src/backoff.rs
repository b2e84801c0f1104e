//! ---
//! ws_section: "07-resilience-fault-tolerance"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Retry delay schedule shared by every stream consumer."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
use std::time::Duration;

use wardstream_common::config::{BackoffConfig, StreamMode};

use crate::error::ErrorKind;

const MAX_EXPONENT: u32 = 20;

/// Pure retry schedule: exponential growth capped at a ceiling, with a faster
/// ramp for high-availability sessions.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    /// Build a policy from (validated) configuration.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Access the underlying constants.
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Number of automatic retries allowed for the mode.
    pub fn budget(&self, mode: StreamMode) -> u32 {
        match mode {
            StreamMode::Standard => self.config.standard_budget,
            StreamMode::HighAvailability => self
                .config
                .high_availability_budget
                .max(self.config.standard_budget.saturating_mul(2)),
        }
    }

    /// Retries left once `attempt` retries have been made.
    pub fn remaining(&self, attempt: u32, mode: StreamMode) -> u32 {
        self.budget(mode).saturating_sub(attempt)
    }

    /// Delay before the retry following `attempt` previous retries, or `None`
    /// when the budget is exhausted or the kind is never retried.
    pub fn delay(&self, attempt: u32, kind: ErrorKind, mode: StreamMode) -> Option<Duration> {
        if !kind.is_retryable() || attempt >= self.budget(mode) {
            return None;
        }
        let fast_attempts = self.config.fast_attempts;
        let scheduled = match mode {
            StreamMode::HighAvailability if attempt < fast_attempts => {
                doubled(self.config.fast_delay, attempt)
            }
            StreamMode::HighAvailability => {
                doubled(self.config.base_delay, attempt - fast_attempts)
            }
            StreamMode::Standard => doubled(self.config.base_delay, attempt),
        };
        let scheduled = if kind == ErrorKind::RateLimited {
            scale(scheduled, self.config.rate_limit_multiplier)
        } else {
            scheduled
        };
        Some(scheduled.min(self.config.max_delay))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

fn doubled(base: Duration, exponent: u32) -> Duration {
    base.saturating_mul(1u32 << exponent.min(MAX_EXPONENT))
}

fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}
