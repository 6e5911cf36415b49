//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::error::{ErrorCategory, TaskError};

/// Backoff schedule for retried operations
///
/// Supports exponential backoff with an upper cap and optional jitter.
///
/// # Example
///
/// ```
/// use utagent_engine::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_retries(3)
///     .with_initial_interval(Duration::from_secs(1))
///     .with_jitter(0.0);
///
/// assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_retry(2), Duration::from_secs(2));
/// assert_eq!(policy.delay_for_retry(3), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "crate::serde_duration::millis")]
    pub initial_interval: Duration,

    /// Upper bound for any single delay
    #[serde(with = "crate::serde_duration::millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (1.0 for fixed delays)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0); 0.1 means +/-10%
    pub jitter: f64,

    /// Error categories that are never retried
    #[serde(default = "default_non_retryable")]
    pub non_retryable: Vec<ErrorCategory>,
}

fn default_non_retryable() -> Vec<ErrorCategory> {
    vec![ErrorCategory::PermanentInput]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff policy
    ///
    /// - 3 retries (4 attempts)
    /// - 1 second initial interval, doubling
    /// - 60 second cap
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 4,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            non_retryable: default_non_retryable(),
        }
    }

    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable: default_non_retryable(),
        }
    }

    /// Policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_retries: u32) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable: default_non_retryable(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the retry budget, not counting the initial attempt
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_attempts = max_retries.saturating_add(1);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter factor (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Mark a category as non-retryable
    pub fn with_non_retryable(mut self, category: ErrorCategory) -> Self {
        if !self.non_retryable.contains(&category) {
            self.non_retryable.push(category);
        }
        self
    }

    /// Retries allowed after the initial attempt
    pub fn max_retries(&self) -> u32 {
        self.max_attempts.saturating_sub(1)
    }

    /// Delay before a given attempt (1-based, the initial attempt has none)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 || self.initial_interval.is_zero() {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::try_from_secs_f64(jittered).unwrap_or(self.max_interval)
    }

    /// Delay before the n-th retry (1-based)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        self.delay_for_attempt(retry.saturating_add(1))
    }

    /// Whether an error may be retried at all
    pub fn should_retry(&self, error: &TaskError) -> bool {
        !self.non_retryable.contains(&error.category())
    }

    /// Whether another attempt fits after `current_attempt` (1-based)
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if self.backoff_coefficient < 1.0 {
            return Err(ConfigError::invalid(
                "backoff_coefficient",
                format!("must be >= 1.0, got {}", self.backoff_coefficient),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid(
                "jitter",
                format!("must be within 0.0..=1.0, got {}", self.jitter),
            ));
        }
        if self.initial_interval > self.max_interval {
            return Err(ConfigError::invalid(
                "initial_interval",
                "must not exceed max_interval",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.backoff_coefficient, 2.0);
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_retries(), 0);
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn test_fixed_interval() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500), 3);
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(500));
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy::exponential().with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::exponential()
            .with_max_interval(Duration::from_secs(5))
            .with_jitter(0.0);

        assert_eq!(policy.delay_for_retry(10), Duration::from_secs(5));
    }

    #[test]
    fn test_huge_max_interval_does_not_overflow() {
        let policy = RetryPolicy::exponential()
            .with_max_interval(Duration::MAX)
            .with_jitter(0.5);

        for retry in [1, 64, 200, 1 << 31, u32::MAX] {
            assert!(policy.delay_for_retry(retry) >= Duration::from_millis(500));
        }
        assert_eq!(
            RetryPolicy::exponential()
                .with_max_interval(Duration::MAX)
                .with_jitter(0.0)
                .delay_for_retry(200),
            Duration::MAX
        );
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::exponential().with_jitter(0.5);
        for _ in 0..50 {
            let delay = policy.delay_for_retry(2);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(3));
        }
    }

    #[test]
    fn test_permanent_errors_are_not_retried() {
        let policy = RetryPolicy::exponential();
        assert!(!policy.should_retry(&TaskError::permanent("bad payload")));
        assert!(policy.should_retry(&TaskError::transient("429")));

        let strict = policy.with_non_retryable(ErrorCategory::BestEffortStep);
        assert!(!strict.should_retry(&TaskError::best_effort("optional lint")));
    }

    #[test]
    fn test_with_max_retries() {
        let policy = RetryPolicy::exponential().with_max_retries(2);
        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::exponential()
            .with_max_retries(9)
            .with_non_retryable(ErrorCategory::Unclassified);

        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["initial_interval"], 1000);

        let parsed: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(policy, parsed);
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::exponential().validate().is_ok());
        assert!(RetryPolicy::no_retry().validate().is_ok());
        assert!(RetryPolicy::exponential()
            .with_backoff_coefficient(0.5)
            .validate()
            .is_err());

        let mut policy = RetryPolicy::exponential();
        policy.jitter = 1.5;
        assert!(policy.validate().is_err());
    }
}
