//! Engine configuration
//!
//! [`EngineConfig`] bundles the per-component configs and loads overrides
//! from `UTAGENT_*` environment variables. Unset or unparsable variables
//! keep the default.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::pool::AdaptivePoolConfig;
use crate::reliability::{CircuitBreakerConfig, RetryPolicy};
use crate::worker::ExecutorConfig;

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Configuration for every engine component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub executor: ExecutorConfig,
    pub pool: AdaptivePoolConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_pool(mut self, pool: AdaptivePoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Defaults overridden by `UTAGENT_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by values from `lookup`
    ///
    /// ```
    /// use std::collections::HashMap;
    /// use utagent_engine::config::EngineConfig;
    ///
    /// let vars = HashMap::from([("UTAGENT_WORKERS", "8"), ("UTAGENT_POOL_MAX_WORKERS", "64")]);
    /// let config = EngineConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
    ///
    /// assert_eq!(config.executor.workers, 8);
    /// assert_eq!(config.pool.max_workers, 64);
    /// ```
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut config = Self::default();

        let executor = &mut config.executor;
        env.set("UTAGENT_WORKERS", &mut executor.workers);
        env.set(
            "UTAGENT_MAX_CONCURRENT",
            &mut executor.max_concurrent_per_worker,
        );
        env.set_millis("UTAGENT_POLL_INTERVAL_MS", &mut executor.poll_interval);
        env.set_millis(
            "UTAGENT_MONITOR_INTERVAL_MS",
            &mut executor.monitor_interval,
        );
        env.set_millis(
            "UTAGENT_SHUTDOWN_TIMEOUT_MS",
            &mut executor.shutdown_timeout,
        );

        let pool = &mut config.pool;
        env.set("UTAGENT_POOL_MIN_WORKERS", &mut pool.min_workers);
        env.set("UTAGENT_POOL_MAX_WORKERS", &mut pool.max_workers);
        env.set_millis(
            "UTAGENT_POOL_ADJUSTMENT_INTERVAL_MS",
            &mut pool.adjustment_interval,
        );
        env.set("UTAGENT_POOL_MAX_QUEUE", &mut pool.backpressure.max_queue_size);
        env.set("UTAGENT_POOL_BACKPRESSURE", &mut pool.backpressure.enabled);

        let breaker = &mut config.circuit_breaker;
        env.set("UTAGENT_CB_FAILURE_THRESHOLD", &mut breaker.failure_threshold);
        env.set_millis(
            "UTAGENT_CB_RECOVERY_TIMEOUT_MS",
            &mut breaker.recovery_timeout,
        );
        env.set(
            "UTAGENT_CB_HALF_OPEN_REQUESTS",
            &mut breaker.half_open_requests,
        );

        let retry = &mut config.retry;
        env.set("UTAGENT_RETRY_MAX_ATTEMPTS", &mut retry.max_attempts);
        env.set_millis(
            "UTAGENT_RETRY_INITIAL_INTERVAL_MS",
            &mut retry.initial_interval,
        );
        env.set_millis("UTAGENT_RETRY_MAX_INTERVAL_MS", &mut retry.max_interval);
        env.set("UTAGENT_RETRY_BACKOFF", &mut retry.backoff_coefficient);
        env.set("UTAGENT_RETRY_JITTER", &mut retry.jitter);

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.executor.validate()?;
        self.pool.validate()?;
        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = (self.lookup)(key)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(key, value = %raw, "Ignoring unparsable config value");
                None
            }
        }
    }

    fn set<T: FromStr>(&self, key: &str, target: &mut T) {
        if let Some(value) = self.parse(key) {
            *target = value;
        }
    }

    fn set_millis(&self, key: &str, target: &mut Duration) {
        if let Some(millis) = self.parse::<u64>(key) {
            *target = Duration::from_millis(millis);
        }
    }
}
