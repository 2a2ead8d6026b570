//! Processor Configuration

use crate::retry::RetryPolicy;
use std::time::Duration;

/// Tunables for the audit processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Interval between periodic export attempts.
    pub schedule_delay: Duration,
    /// Upper bound on records per export call. Must be positive.
    pub max_batch: usize,
    /// Deadline applied to each export call. `Duration::ZERO` disables
    /// the deadline.
    pub exporter_timeout: Duration,
    /// Retry behavior for failed exports.
    pub retry: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            schedule_delay: Duration::from_secs(1),
            max_batch: 512,
            exporter_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl ProcessorConfig {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.max_batch == 0 {
            return Err("max_batch must be positive".to_string());
        }
        if self.retry.multiplier <= 0.0 {
            return Err("retry multiplier must be positive".to_string());
        }
        Ok(())
    }
}
