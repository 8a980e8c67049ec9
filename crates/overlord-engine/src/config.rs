use crate::EngineError;
use overlord_state::PruneOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine tuning. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on concurrently running handlers.
    pub max_concurrent: usize,
    /// Period of the ensure timer.
    pub ensure_interval_ms: u64,
    pub retry: RetryConfig,
    /// Tasks in progress longer than this are reported as stuck.
    pub stuck_after_secs: u64,
    pub prune: PruneConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    /// Consecutive retries allowed before the error counts as fatal.
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruneConfig {
    pub interval_secs: u64,
    pub prune_wait_secs: u64,
    pub abort_wait_secs: Option<u64>,
    pub max_ready_changes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            ensure_interval_ms: 5 * 60 * 1000,
            retry: RetryConfig::default(),
            stuck_after_secs: 10 * 60,
            prune: PruneConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 5 * 60 * 1000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10 * 60,
            prune_wait_secs: 24 * 60 * 60,
            abort_wait_secs: None,
            max_ready_changes: 500,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| EngineError::Config(format!("invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_concurrent == 0 {
            return Err(EngineError::Config(
                "max_concurrent must be at least 1".to_owned(),
            ));
        }
        if self.ensure_interval_ms == 0 {
            return Err(EngineError::Config(
                "ensure_interval_ms must be positive".to_owned(),
            ));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(EngineError::Config(format!(
                "retry.multiplier must be >= 1, got {}",
                self.retry.multiplier
            )));
        }
        if self.retry.max_ms < self.retry.initial_ms {
            return Err(EngineError::Config(format!(
                "retry.max_ms ({}) is below retry.initial_ms ({})",
                self.retry.max_ms, self.retry.initial_ms
            )));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(EngineError::Config(
                "retry.max_attempts must be at least 1 when set".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn ensure_interval(&self) -> Duration {
        Duration::from_millis(self.ensure_interval_ms)
    }

    pub fn stuck_after(&self) -> Duration {
        Duration::from_secs(self.stuck_after_secs)
    }
}

impl PruneConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn options(&self) -> PruneOptions {
        PruneOptions {
            prune_wait: Duration::from_secs(self.prune_wait_secs),
            abort_wait: self.abort_wait_secs.map(Duration::from_secs),
            max_ready_changes: self.max_ready_changes,
        }
    }
}
