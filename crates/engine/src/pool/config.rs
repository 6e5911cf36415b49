//! Adaptive pool configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::backpressure::BackpressureConfig;
use crate::config::ConfigError;

/// Adaptive thread pool configuration
///
/// # Example
///
/// ```
/// use utagent_engine::pool::AdaptivePoolConfig;
/// use std::time::Duration;
///
/// let config = AdaptivePoolConfig::default()
///     .with_workers(2, 8)
///     .with_adjustment_interval(Duration::from_secs(1))
///     .with_max_queue_size(500);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdaptivePoolConfig {
    /// Lower bound on worker threads
    pub min_workers: usize,

    /// Upper bound on worker threads
    pub max_workers: usize,

    /// How often the adjustment loop samples load
    #[serde(with = "crate::serde_duration::millis")]
    pub adjustment_interval: Duration,

    /// CPU usage (percent) above which the pool shrinks and below which it
    /// may grow
    pub cpu_threshold_high: f64,

    /// Queue depth above which the pool grows
    pub queue_threshold_high: usize,

    /// Queue depth below which the pool shrinks
    pub queue_threshold_low: usize,

    /// Growth multiplier (> 1.0)
    pub scale_up_factor: f64,

    /// Shrink multiplier (< 1.0)
    pub scale_down_factor: f64,

    pub backpressure: BackpressureConfig,

    /// Prefix for worker thread names
    pub thread_name_prefix: String,
}

impl Default for AdaptivePoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 32,
            adjustment_interval: Duration::from_secs(5),
            cpu_threshold_high: 80.0,
            queue_threshold_high: 10,
            queue_threshold_low: 2,
            scale_up_factor: 1.5,
            scale_down_factor: 0.8,
            backpressure: BackpressureConfig::default(),
            thread_name_prefix: "utagent-pool".to_string(),
        }
    }
}

impl AdaptivePoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set both worker bounds
    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    pub fn with_adjustment_interval(mut self, interval: Duration) -> Self {
        self.adjustment_interval = interval;
        self
    }

    pub fn with_cpu_threshold(mut self, percent: f64) -> Self {
        self.cpu_threshold_high = percent.clamp(0.0, 100.0);
        self
    }

    /// Set the queue-depth band (grow above `high`, shrink below `low`)
    pub fn with_queue_thresholds(mut self, low: usize, high: usize) -> Self {
        self.queue_threshold_low = low;
        self.queue_threshold_high = high;
        self
    }

    pub fn with_scale_factors(mut self, up: f64, down: f64) -> Self {
        self.scale_up_factor = up;
        self.scale_down_factor = down;
        self
    }

    pub fn with_backpressure(mut self, enabled: bool) -> Self {
        self.backpressure.enabled = enabled;
        self
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.backpressure.max_queue_size = size;
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_workers == 0 {
            return Err(ConfigError::invalid("min_workers", "must be at least 1"));
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigError::invalid(
                "min_workers",
                format!(
                    "min_workers ({}) exceeds max_workers ({})",
                    self.min_workers, self.max_workers
                ),
            ));
        }
        if self.adjustment_interval.is_zero() {
            return Err(ConfigError::invalid(
                "adjustment_interval",
                "must be greater than zero",
            ));
        }
        if self.scale_up_factor <= 1.0 {
            return Err(ConfigError::invalid(
                "scale_up_factor",
                "must be greater than 1.0",
            ));
        }
        if !(self.scale_down_factor > 0.0 && self.scale_down_factor < 1.0) {
            return Err(ConfigError::invalid(
                "scale_down_factor",
                "must be between 0.0 and 1.0 (exclusive)",
            ));
        }
        if self.queue_threshold_low > self.queue_threshold_high {
            return Err(ConfigError::invalid(
                "queue_threshold_low",
                "must not exceed queue_threshold_high",
            ));
        }
        self.backpressure.validate()
    }
}
