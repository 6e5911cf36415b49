//! Backpressure for pool submissions
//!
//! Rejects new jobs once the pool's incoming queue is full.

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Backpressure configuration
///
/// `resume_ratio` adds hysteresis: once the queue fills up, submissions stay
/// rejected until depth falls to `max_queue_size * resume_ratio`. The default
/// of 1.0 accepts again as soon as a single slot frees up.
///
/// # Example
///
/// ```
/// use utagent_engine::pool::BackpressureConfig;
///
/// let config = BackpressureConfig::default()
///     .with_max_queue_size(50)
///     .with_resume_ratio(0.8);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureConfig {
    /// Reject submissions when the queue is full
    pub enabled: bool,

    /// Queue depth at which submissions are rejected
    pub max_queue_size: usize,

    /// Fraction of `max_queue_size` the queue must drain to before
    /// submissions are accepted again
    pub resume_ratio: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_queue_size: 100,
            resume_ratio: 1.0,
        }
    }
}

impl BackpressureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration that never rejects
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_resume_ratio(mut self, ratio: f64) -> Self {
        self.resume_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.max_queue_size == 0 {
            return Err(ConfigError::invalid(
                "max_queue_size",
                "must be at least 1 when backpressure is enabled",
            ));
        }
        if !(self.resume_ratio > 0.0 && self.resume_ratio <= 1.0) {
            return Err(ConfigError::invalid(
                "resume_ratio",
                "must be in (0.0, 1.0]",
            ));
        }
        Ok(())
    }

    fn resume_depth(&self) -> usize {
        let depth = (self.max_queue_size as f64 * self.resume_ratio).floor() as usize;
        depth.min(self.max_queue_size.saturating_sub(1))
    }
}

/// Admission state for the pool's incoming queue
///
/// Lives inside the pool's state mutex, so it is only touched by one thread
/// at a time.
#[derive(Debug)]
pub struct BackpressureGate {
    config: BackpressureConfig,
    accepting: bool,
    reason: Option<String>,
}

impl BackpressureGate {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            accepting: true,
            reason: None,
        }
    }

    /// Whether a job may be enqueued at the given queue depth
    pub fn should_accept(&mut self, queue_depth: usize) -> bool {
        if !self.config.enabled {
            return true;
        }

        if self.accepting {
            if queue_depth >= self.config.max_queue_size {
                self.accepting = false;
                self.reason = Some(format!(
                    "queue depth {} reached max_queue_size {}",
                    queue_depth, self.config.max_queue_size
                ));
                return false;
            }
            true
        } else {
            if queue_depth <= self.config.resume_depth() {
                self.accepting = true;
                self.reason = None;
                return true;
            }
            false
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Why submissions are being rejected, if they are
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }
}
