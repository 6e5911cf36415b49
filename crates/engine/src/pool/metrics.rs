//! Pool metrics

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of task durations kept for the rolling average
pub const DURATION_WINDOW: usize = 100;

/// Rolling window of the most recent task durations
#[derive(Debug, Clone)]
pub struct DurationWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl DurationWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, duration: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(duration);
    }

    /// Mean of the retained samples, zero when empty
    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        self.samples.iter().sum::<Duration>() / self.samples.len() as u32
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for DurationWindow {
    fn default() -> Self {
        Self::new(DURATION_WINDOW)
    }
}

/// Point-in-time pool metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub current_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Jobs waiting for a thread
    pub queue_size: usize,
    /// Jobs currently running
    pub active_tasks: usize,
    pub completed_tasks: u64,
    pub rejected_tasks: u64,
    /// Mean duration over the last [`DURATION_WINDOW`] jobs
    #[serde(with = "crate::serde_duration::millis")]
    pub avg_task_duration: Duration,
    /// CPU usage (percent) at the last adjustment cycle
    pub cpu_usage: f64,
    pub adjustment_count: u64,
    pub last_adjustment_at: Option<DateTime<Utc>>,
}

impl PoolMetrics {
    /// Worker utilization in 0.0-1.0
    pub fn utilization(&self) -> f64 {
        if self.current_workers == 0 {
            0.0
        } else {
            (self.active_tasks as f64 / self.current_workers as f64).min(1.0)
        }
    }
}
