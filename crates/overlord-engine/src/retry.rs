use crate::config::RetryConfig;
use std::time::Duration;

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_ms),
            max: Duration::from_millis(config.max_ms),
            multiplier: config.multiplier,
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before retry number `retries` (1-based).
    pub fn delay(&self, retries: u32) -> Duration {
        let exp = retries.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    /// True once `retries` consecutive retriable failures used up the budget.
    pub fn exhausted(&self, retries: u32) -> bool {
        self.max_attempts.is_some_and(|max| retries > max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}
