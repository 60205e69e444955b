//! Bus configuration: defaults, YAML file, environment overrides.
//!
//! Sources merge in precedence order: built-in defaults, then an optional
//! `relaybus.yaml`, then `RELAYBUS_*` environment variables (nested keys
//! separated by `__`, e.g. `RELAYBUS_CIRCUIT_BREAKER__FAILURE_THRESHOLD`).

use std::path::Path;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::circuit_breaker::CircuitBreakerConfig;

/// Behavior when the intake queue is full at admission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Reject the incoming message with a backpressure error.
    #[default]
    RejectNew,
    /// Evict the oldest queued message to make room.
    DropOldest,
    /// Delay producers increasingly as the queue fills, rejecting only
    /// after the admission timeout.
    AdaptiveRateLimit,
}

/// Circuit breaker tuning, nested under `circuit_breaker` in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Whether breakers are enforced.
    pub enabled: bool,
    /// Consecutive failures before a breaker opens.
    pub failure_threshold: u32,
    /// Milliseconds a breaker stays open before probing.
    pub cooldown_ms: u64,
    /// Concurrent trial commands admitted while half-open. A single trial
    /// success closes the breaker.
    pub trial_budget: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self { enabled: true, failure_threshold: 5, cooldown_ms: 30_000, trial_budget: 2 }
    }
}

/// Complete bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum messages held in the intake queue.
    pub queue_capacity: usize,
    /// Admission behavior when the queue is full.
    pub backpressure: BackpressurePolicy,
    /// Messages drained per dispatch loop iteration.
    pub batch_size: usize,
    /// Upper bound in milliseconds on how long the idle dispatch loop
    /// waits before re-checking the queue.
    pub batch_window_ms: u64,
    /// Retries after a failed command attempt (total attempts is one more).
    pub max_retries: u32,
    /// First retry delay in milliseconds; later delays double.
    pub initial_backoff_ms: u64,
    /// Ceiling on the retry delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Circuit breaker settings.
    pub circuit_breaker: CircuitBreakerSettings,
    /// Dead letter entries retained before the oldest is evicted.
    pub dead_letter_capacity: usize,
    /// Scheduler tick interval in milliseconds.
    pub scheduler_tick_ms: u64,
    /// When true, `publish_and_wait` returns the first event handler
    /// error after the full fan-out; otherwise handler errors are only
    /// observed.
    pub raise_event_handler_errors: bool,
    /// How long `stop` waits for the queue to drain, in milliseconds.
    pub drain_timeout_ms: u64,
    /// Base producer delay for adaptive admission, in milliseconds.
    pub adaptive_base_delay_ms: u64,
    /// Largest producer delay for adaptive admission, in milliseconds.
    pub adaptive_max_delay_ms: u64,
    /// Total time adaptive admission keeps retrying before rejecting, in
    /// milliseconds.
    pub adaptive_admission_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            backpressure: BackpressurePolicy::default(),
            batch_size: 32,
            batch_window_ms: 25,
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 5_000,
            circuit_breaker: CircuitBreakerSettings::default(),
            dead_letter_capacity: 256,
            scheduler_tick_ms: 100,
            raise_event_handler_errors: false,
            drain_timeout_ms: 5_000,
            adaptive_base_delay_ms: 5,
            adaptive_max_delay_ms: 100,
            adaptive_admission_timeout_ms: 1_000,
        }
    }
}

impl BusConfig {
    /// Check invariants between related settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity);
        }
        if self.batch_size == 0 || self.batch_size > self.queue_capacity {
            return Err(ConfigError::InvalidBatchSize {
                batch_size: self.batch_size,
                queue_capacity: self.queue_capacity,
            });
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::InvalidBackoffRange {
                initial_ms: self.initial_backoff_ms,
                max_ms: self.max_backoff_ms,
            });
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold);
        }
        if self.circuit_breaker.trial_budget == 0 {
            return Err(ConfigError::InvalidTrialBudget);
        }
        if self.scheduler_tick_ms == 0 {
            return Err(ConfigError::InvalidSchedulerTick);
        }
        Ok(())
    }

    pub(crate) fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            cooldown: std::time::Duration::from_millis(self.circuit_breaker.cooldown_ms),
            trial_budget: self.circuit_breaker.trial_budget,
            enabled: self.circuit_breaker.enabled,
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source failed to parse or merge.
    #[error("failed to load configuration: {0}")]
    Load(String),

    /// `queue_capacity` must be at least 1.
    #[error("queue_capacity must be at least 1")]
    InvalidQueueCapacity,

    /// `batch_size` must be between 1 and `queue_capacity`.
    #[error("batch_size {batch_size} must be between 1 and queue_capacity {queue_capacity}")]
    InvalidBatchSize {
        /// Configured batch size.
        batch_size: usize,
        /// Configured queue capacity.
        queue_capacity: usize,
    },

    /// `max_backoff_ms` must not be below `initial_backoff_ms`.
    #[error("max_backoff_ms {max_ms} must be >= initial_backoff_ms {initial_ms}")]
    InvalidBackoffRange {
        /// Configured initial backoff.
        initial_ms: u64,
        /// Configured maximum backoff.
        max_ms: u64,
    },

    /// `circuit_breaker.failure_threshold` must be at least 1.
    #[error("circuit_breaker.failure_threshold must be at least 1")]
    InvalidFailureThreshold,

    /// `circuit_breaker.trial_budget` must be at least 1.
    #[error("circuit_breaker.trial_budget must be at least 1")]
    InvalidTrialBudget,

    /// `scheduler_tick_ms` must be at least 1.
    #[error("scheduler_tick_ms must be at least 1")]
    InvalidSchedulerTick,
}

/// Load configuration from defaults, an optional YAML file, and the
/// environment. `path` overrides the default `relaybus.yaml` lookup.
pub fn load_config(path: Option<&Path>) -> Result<BusConfig, ConfigError> {
    let mut figment = Figment::new().merge(Serialized::defaults(BusConfig::default()));
    figment = match path {
        Some(file) => figment.merge(Yaml::file(file)),
        None => figment.merge(Yaml::file("relaybus.yaml")),
    };
    let config: BusConfig = figment
        .merge(Env::prefixed("RELAYBUS_").split("__"))
        .extract()
        .map_err(|err| ConfigError::Load(err.to_string()))?;
    config.validate()?;
    Ok(config)
}
